//! AES-128-ECB with PKCS#7 padding, keyed by the device's local key.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::{Error, Result};

const BLOCK: usize = 16;

pub(crate) struct Cipher {
    aes: Aes128,
}

impl Cipher {
    pub(crate) fn new(local_key: &[u8]) -> Result<Self> {
        let aes = Aes128::new_from_slice(local_key).map_err(|_| Error::InvalidKey(local_key.len()))?;
        Ok(Self { aes })
    }

    pub(crate) fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let pad = BLOCK - plain.len() % BLOCK;
        let mut buf = Vec::with_capacity(plain.len() + pad);
        buf.extend_from_slice(plain);
        buf.resize(plain.len() + pad, pad as u8);

        for chunk in buf.chunks_exact_mut(BLOCK) {
            self.aes.encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        buf
    }

    pub(crate) fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK != 0 {
            return Err(Error::Decrypt);
        }

        let mut buf = data.to_vec();
        for chunk in buf.chunks_exact_mut(BLOCK) {
            self.aes.decrypt_block(GenericArray::from_mut_slice(chunk));
        }

        let pad = *buf.last().ok_or(Error::Decrypt)? as usize;
        if pad == 0 || pad > BLOCK || pad > buf.len() {
            return Err(Error::Decrypt);
        }
        if !buf[buf.len() - pad..].iter().all(|&b| b as usize == pad) {
            return Err(Error::Decrypt);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

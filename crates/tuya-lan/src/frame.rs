//! Wire framing for the 55AA protocol family.
//!
//! ```text
//! prefix u32 | seq u32 | cmd u32 | len u32 | [retcode u32] payload | crc32 u32 | suffix u32
//! ```
//!
//! All integers are big-endian. `len` counts everything after the header:
//! the optional return code, the payload, the CRC and the suffix. The CRC
//! covers the header and body. Only device-to-client frames carry a return
//! code.

use crate::{Error, Result};

pub const PREFIX: u32 = 0x0000_55AA;
pub const SUFFIX: u32 = 0x0000_AA55;

const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Control,
    /// Unsolicited data point report pushed by the device.
    Status,
    DpQuery,
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Command::Control => 0x07,
            Command::Status => 0x08,
            Command::DpQuery => 0x0a,
        }
    }
}

/// Which side produced a frame. Device responses carry a return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub cmd: u32,
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(seq: u32, cmd: Command, payload: Vec<u8>) -> Self {
        Self {
            seq,
            cmd: cmd.code(),
            retcode: None,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.retcode.map_or(0, |_| 4) + self.payload.len();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len + TRAILER_LEN);

        out.extend_from_slice(&PREFIX.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.cmd.to_be_bytes());
        out.extend_from_slice(&((body_len + TRAILER_LEN) as u32).to_be_bytes());
        if let Some(rc) = self.retcode {
            out.extend_from_slice(&rc.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&SUFFIX.to_be_bytes());
        out
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame, or
    /// `Ok(Some((frame, consumed)))` once it does.
    pub fn decode(buf: &[u8], direction: Direction) -> Result<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let prefix = read_u32(buf, 0);
        if prefix != PREFIX {
            return Err(Error::Frame(format!("bad prefix {prefix:#010x}")));
        }
        let seq = read_u32(buf, 4);
        let cmd = read_u32(buf, 8);
        let len = read_u32(buf, 12) as usize;
        if len < TRAILER_LEN {
            return Err(Error::Frame(format!("declared length {len} is too short")));
        }

        let total = HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }

        let body_end = total - TRAILER_LEN;
        let crc = read_u32(buf, body_end);
        let suffix = read_u32(buf, body_end + 4);
        if suffix != SUFFIX {
            return Err(Error::Frame(format!("bad suffix {suffix:#010x}")));
        }
        let expected = crc32fast::hash(&buf[..body_end]);
        if crc != expected {
            return Err(Error::Frame(format!(
                "crc mismatch: got {crc:#010x}, expected {expected:#010x}"
            )));
        }

        let mut body = &buf[HEADER_LEN..body_end];
        let retcode = match direction {
            Direction::Response if body.len() >= 4 => {
                let rc = read_u32(body, 0);
                body = &body[4..];
                Some(rc)
            }
            Direction::Response => None,
            Direction::Request => None,
        };

        Ok(Some((
            Frame {
                seq,
                cmd,
                retcode,
                payload: body.to_vec(),
            },
            total,
        )))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

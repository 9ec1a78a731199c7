//! Minimal client for the Tuya local LAN protocol, version 3.3.
//!
//! Only what a single-switch smart pump needs: query status and toggle
//! data point `1`. Every call opens its own TCP connection, sends one
//! request frame and reads one response frame.

mod cipher;
mod device;
pub mod frame;

pub use device::{Device, DEFAULT_PORT};

/// Errors raised while talking to a device.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("local key must be 16 bytes, got {0}")]
    InvalidKey(usize),

    #[error("i/o error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out talking to {0}")]
    Timeout(String),

    #[error("connection to {0} closed before a full response arrived")]
    Closed(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("payload could not be decrypted with the local key")]
    Decrypt,

    #[error("device returned a payload that is not json: {0}")]
    Payload(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::cipher::Cipher;
use crate::frame::{Command, Direction, Frame};
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 6668;

const VERSION: &[u8] = b"3.3";
const VERSION_HEADER_LEN: usize = 15;
const SWITCH_DP: &str = "1";

/// A single Tuya device reachable on the local network.
pub struct Device {
    id: String,
    addr: String,
    cipher: Cipher,
    timeout: Duration,
    seq: u32,
}

impl Device {
    pub fn new(id: &str, address: &str, local_key: &str) -> Result<Self> {
        Ok(Self {
            id: id.to_string(),
            addr: format!("{address}:{DEFAULT_PORT}"),
            cipher: Cipher::new(local_key.as_bytes())?,
            timeout: Duration::from_secs(5),
            seq: 0,
        })
    }

    /// Override the `host:port` the device is reached at.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Query all data points.
    pub async fn status(&mut self) -> Result<Value> {
        let body = json!({
            "gwId": self.id,
            "devId": self.id,
            "uid": self.id,
            "t": timestamp(),
        });
        self.exchange(Command::DpQuery, &body).await
    }

    pub async fn turn_on(&mut self) -> Result<Value> {
        self.set_value(SWITCH_DP, Value::Bool(true)).await
    }

    pub async fn turn_off(&mut self) -> Result<Value> {
        self.set_value(SWITCH_DP, Value::Bool(false)).await
    }

    pub async fn set_value(&mut self, dp: &str, value: Value) -> Result<Value> {
        let body = json!({
            "devId": self.id,
            "uid": self.id,
            "t": timestamp(),
            "dps": { dp: value },
        });
        self.exchange(Command::Control, &body).await
    }

    async fn exchange(&mut self, cmd: Command, body: &Value) -> Result<Value> {
        self.seq = self.seq.wrapping_add(1);
        let request = Frame::request(self.seq, cmd, self.seal(cmd, body)).encode();

        let addr = self.addr.clone();
        let response = timeout(self.timeout, round_trip(&addr, &request, cmd.code()))
            .await
            .map_err(|_| Error::Timeout(addr.clone()))??;

        debug!(device = %self.id, cmd = response.cmd, retcode = ?response.retcode, "tuya response");
        self.open(&response.payload)
    }

    fn seal(&self, cmd: Command, body: &Value) -> Vec<u8> {
        let encrypted = self.cipher.encrypt(body.to_string().as_bytes());
        match cmd {
            Command::DpQuery => encrypted,
            _ => {
                let mut out = Vec::with_capacity(VERSION_HEADER_LEN + encrypted.len());
                out.extend_from_slice(VERSION);
                out.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
                out.extend_from_slice(&encrypted);
                out
            }
        }
    }

    fn open(&self, payload: &[u8]) -> Result<Value> {
        let data = if payload.starts_with(VERSION) && payload.len() >= VERSION_HEADER_LEN {
            &payload[VERSION_HEADER_LEN..]
        } else {
            payload
        };

        // Control acks frequently come back with no body at all.
        if data.is_empty() {
            return Ok(Value::Null);
        }

        let plain = match self.cipher.decrypt(data) {
            Ok(p) => p,
            // Some firmware answers errors in clear text.
            Err(_) => data.to_vec(),
        };
        serde_json::from_slice(&plain)
            .map_err(|_| Error::Payload(String::from_utf8_lossy(&plain).into_owned()))
    }
}

/// Send `request` and read frames until one answers `expect_cmd`. Frames for
/// other commands (status pushes after a state change) are dropped.
async fn round_trip(addr: &str, request: &[u8], expect_cmd: u32) -> Result<Frame> {
    let io = |source| Error::Io {
        addr: addr.to_string(),
        source,
    };

    let mut stream = TcpStream::connect(addr).await.map_err(io)?;
    stream.write_all(request).await.map_err(io)?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        while let Some((frame, used)) = Frame::decode(&buf, Direction::Response)? {
            buf.drain(..used);
            if frame.cmd == expect_cmd {
                return Ok(frame);
            }
            if frame.cmd == Command::Status.code() {
                debug!(%addr, seq = frame.seq, "ignoring status push");
            } else {
                debug!(%addr, cmd = frame.cmd, expect_cmd, "ignoring unexpected frame");
            }
        }
        let n = stream.read(&mut chunk).await.map_err(io)?;
        if n == 0 {
            return Err(Error::Closed(addr.to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc().unix_timestamp().to_string()
}

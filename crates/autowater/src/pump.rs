//! Pump actuation: status check, turn on, hold, turn off with retries.
//!
//! Device faults never escape as errors. Each run ends in an [`Outcome`]; the
//! one outcome that needs a human is [`Outcome::ShutoffExhausted`], where the
//! pump may still be running.

use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::store::PlantConfig;

// ---------------------------------------------------------------------------
// Device seam
// ---------------------------------------------------------------------------

/// The three calls the actuator makes on a pump.
pub trait PumpDevice {
    async fn status(&mut self) -> tuya_lan::Result<Value>;
    async fn turn_on(&mut self) -> tuya_lan::Result<Value>;
    async fn turn_off(&mut self) -> tuya_lan::Result<Value>;
}

/// Builds a device handle for a plant's pump.
pub trait PumpConnector {
    type Device: PumpDevice;

    fn connect(&self, cfg: &PlantConfig) -> tuya_lan::Result<Self::Device>;
}

impl PumpDevice for tuya_lan::Device {
    async fn status(&mut self) -> tuya_lan::Result<Value> {
        tuya_lan::Device::status(self).await
    }

    async fn turn_on(&mut self) -> tuya_lan::Result<Value> {
        tuya_lan::Device::turn_on(self).await
    }

    async fn turn_off(&mut self) -> tuya_lan::Result<Value> {
        tuya_lan::Device::turn_off(self).await
    }
}

/// RainPoint pumps on the local network.
pub struct TuyaConnector {
    timeout: Duration,
}

impl TuyaConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PumpConnector for TuyaConnector {
    type Device = tuya_lan::Device;

    fn connect(&self, cfg: &PlantConfig) -> tuya_lan::Result<Self::Device> {
        Ok(tuya_lan::Device::new(&cfg.id, &cfg.ip, &cfg.local_key)?.with_timeout(self.timeout))
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Turn-off attempts before giving up.
    pub attempts: u32,
    /// Pause between failed turn-off attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStep {
    StatusCheck,
    TurnOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Pump ran for the requested time and acknowledged turning off.
    Success,
    /// Gave up at this step; the pump was never switched on.
    DeviceFault(FaultStep),
    /// Duration was not a positive number within the plant's limit.
    Rejected,
    /// Pump was switched on and never acknowledged turning off.
    ShutoffExhausted,
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error(transparent)]
    Transport(#[from] tuya_lan::Error),
    #[error("device reported error: {0}")]
    Reported(Value),
}

/// A reply carrying an `Error` key counts as a failed call.
fn checked(result: tuya_lan::Result<Value>) -> Result<Value, CommandError> {
    let value = result?;
    if let Some(err) = value.get("Error") {
        return Err(CommandError::Reported(err.clone()));
    }
    Ok(value)
}

/// Run one watering cycle of `seconds` on `device`.
pub async fn run<D: PumpDevice>(
    plant: &str,
    device: &mut D,
    seconds: f64,
    max_seconds: f64,
    policy: &RetryPolicy,
) -> Outcome {
    if !(seconds.is_finite() && seconds > 0.0 && seconds <= max_seconds) {
        warn!(plant, seconds, max_seconds, "pump: refusing out-of-range duration");
        return Outcome::Rejected;
    }

    if let Err(e) = checked(device.status().await) {
        error!(plant, "pump: status check failed, not watering: {e}");
        return Outcome::DeviceFault(FaultStep::StatusCheck);
    }

    if let Err(e) = checked(device.turn_on().await) {
        error!(plant, "pump: turn on failed: {e}");
        return Outcome::DeviceFault(FaultStep::TurnOn);
    }
    info!(plant, seconds, "pump: on");

    sleep(Duration::from_secs_f64(seconds)).await;

    for attempt in 1..=policy.attempts {
        match checked(device.turn_off().await) {
            Ok(_) => {
                info!(plant, seconds, attempt, "pump: watered and turned off");
                return Outcome::Success;
            }
            Err(e) => {
                warn!(plant, attempt, attempts = policy.attempts, "pump: turn off failed: {e}");
                if attempt < policy.attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }

    error!(
        plant,
        attempts = policy.attempts,
        "pump: failed to turn off after watering, manual intervention required"
    );
    Outcome::ShutoffExhausted
}

// ===========================================================================
// Tests
// ===========================================================================

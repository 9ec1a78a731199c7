//! Resting (hysteresis) state machine.
//!
//! ```text
//! Watering ──[moisture >= enter_at]──▶ Resting
//!    ▲                                    │
//!    └────────[moisture <= exit_at]───────┘
//! ```
//!
//! While resting the plant is not evaluated at all. A plant with its own
//! `resting_target` rests between `target` and `resting_target`; other plants
//! use the configured default band (40 / 34 unless overridden), or no band at
//! all when the default is disabled.

use crate::store::PlantConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestPolicy {
    /// Start resting at or above this moisture.
    pub enter_at: f64,
    /// Stop resting at or below this moisture.
    pub exit_at: f64,
}

impl RestPolicy {
    pub const LEGACY: RestPolicy = RestPolicy {
        enter_at: 40.0,
        exit_at: 34.0,
    };

    /// The band that applies to `cfg`, if any.
    pub fn for_plant(cfg: &PlantConfig, default: Option<RestPolicy>) -> Option<RestPolicy> {
        match cfg.resting_target {
            Some(exit_at) => Some(RestPolicy {
                enter_at: cfg.target,
                exit_at,
            }),
            None => default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    On,
    Off,
}

impl Transition {
    pub fn as_state(self) -> &'static str {
        match self {
            Transition::On => "on",
            Transition::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestDecision {
    pub skip: bool,
    pub resting: bool,
    pub transition: Option<Transition>,
}

/// Decide whether this pass should leave the plant alone.
pub fn should_skip(cfg: &PlantConfig, policy: Option<RestPolicy>, measurement: f64) -> RestDecision {
    let Some(policy) = policy else {
        // No band: never skip, and drop any stale resting flag.
        return RestDecision {
            skip: false,
            resting: false,
            transition: cfg.resting.then_some(Transition::Off),
        };
    };

    if cfg.resting {
        if measurement <= policy.exit_at {
            RestDecision {
                skip: false,
                resting: false,
                transition: Some(Transition::Off),
            }
        } else {
            RestDecision {
                skip: true,
                resting: true,
                transition: None,
            }
        }
    } else if measurement >= policy.enter_at {
        RestDecision {
            skip: true,
            resting: true,
            transition: Some(Transition::On),
        }
    } else {
        RestDecision {
            skip: false,
            resting: false,
            transition: None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

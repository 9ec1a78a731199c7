//! One control pass over every plant.
//!
//! ```text
//! align moisture + pump history ─▶ for each plant, in file order:
//!     latest sample? ── no ──▶ NoData
//!     fresh enough?  ── no ──▶ Stale
//!     resting?       ── yes ─▶ Resting
//!     PID ─▶ nudge repeated value ─▶ report ─▶ control > 0 ? water : Idle
//! ─▶ persist store + liveness ping (skipped under --dont-water)
//! ```
//!
//! Plants are independent; a fault on one is logged and the pass moves on.
//! Only a failure to persist the store at the end is returned as an error.

use std::time::Duration;

use anyhow::Result;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::hass::Monitor;
use crate::pid::ControllerBank;
use crate::pump::{self, FaultStep, Outcome, PumpConnector, RetryPolicy};
use crate::rest::{self, RestPolicy};
use crate::series::{fetch_and_align, Table};
use crate::store::{PlantConfig, PlantStore};

#[derive(Debug, Clone)]
pub struct PassSettings {
    pub lookback: Duration,
    pub stale_after: Option<Duration>,
    /// Band for plants without their own `resting_target`.
    pub default_rest: Option<RestPolicy>,
    /// Epsilon for the repeated-value nudge, `None` to disable it.
    pub nudge: Option<f64>,
    pub duration_unit: String,
    pub retry: RetryPolicy,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(72 * 3600),
            stale_after: None,
            default_rest: Some(RestPolicy::LEGACY),
            nudge: Some(0.01),
            duration_unit: "s".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// Decide everything, actuate and persist nothing.
    pub dont_water: bool,
    /// Start every controller from a zero integral and last error.
    pub clear_pid_history: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlantResult {
    NoData,
    Stale,
    Resting,
    /// Controller ran; no pump cycle (zero output, or dry run).
    Evaluated { control: f64 },
    Watered { control: f64, outcome: Outcome },
}

#[derive(Debug, Default)]
pub struct PassReport {
    pub results: Vec<(String, PlantResult)>,
    pub persisted: bool,
}

impl PassReport {
    /// Plants whose pump may still be running.
    pub fn needs_attention(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    PlantResult::Watered {
                        outcome: Outcome::ShutoffExhausted,
                        ..
                    }
                )
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run a pass, then persist the store and ping unless this is a dry run.
pub async fn execute<M, C>(
    monitor: &M,
    pumps: &C,
    store: &mut PlantStore,
    settings: &PassSettings,
    opts: PassOptions,
    now: OffsetDateTime,
) -> Result<PassReport>
where
    M: Monitor,
    C: PumpConnector,
{
    let mut report = run(monitor, pumps, store, settings, opts, now).await;

    if opts.dont_water {
        info!("dry run: plant store left untouched, no liveness ping");
        return Ok(report);
    }

    store.save()?;
    report.persisted = true;
    monitor.ping().await;
    Ok(report)
}

/// Evaluate every plant, mutating `store` in memory only.
pub async fn run<M, C>(
    monitor: &M,
    pumps: &C,
    store: &mut PlantStore,
    settings: &PassSettings,
    opts: PassOptions,
    now: OffsetDateTime,
) -> PassReport
where
    M: Monitor,
    C: PumpConnector,
{
    if opts.clear_pid_history {
        info!("clearing pid history for this pass");
        store.clear_pid_history();
    }

    let moisture = fetch_and_align(
        monitor,
        &store.plants,
        |c| Some(c.sensor.as_str()),
        settings.lookback,
        now,
    )
    .await;
    let durations = fetch_and_align(
        monitor,
        &store.plants,
        |c| c.pump_sensor.as_deref(),
        settings.lookback,
        now,
    )
    .await;

    debug!(
        moisture_rows = moisture.len(),
        duration_rows = durations.len(),
        "history aligned"
    );

    let mut bank = ControllerBank::new(&store.plants, opts.clear_pid_history);
    let mut report = PassReport::default();

    for plant in &mut store.plants {
        let result = handle_plant(
            &plant.name,
            &mut plant.config,
            &moisture,
            &durations,
            &mut bank,
            monitor,
            pumps,
            settings,
            opts,
            now,
        )
        .await;
        report.results.push((plant.name.clone(), result));
    }

    report
}

// ---------------------------------------------------------------------------
// Per-plant step
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn handle_plant<M, C>(
    name: &str,
    cfg: &mut PlantConfig,
    moisture: &Table,
    durations: &Table,
    bank: &mut ControllerBank,
    monitor: &M,
    pumps: &C,
    settings: &PassSettings,
    opts: PassOptions,
    now: OffsetDateTime,
) -> PlantResult
where
    M: Monitor,
    C: PumpConnector,
{
    // ── Guard: a usable, fresh sample ────────────────────────────
    let Some((sampled_at, level)) = moisture.latest(name) else {
        error!(plant = %name, sensor = %cfg.sensor, "no moisture data, skipping");
        return PlantResult::NoData;
    };

    if let Some(max_age) = settings.stale_after {
        let age = now - sampled_at;
        if age > max_age {
            warn!(
                plant = %name,
                age_min = age.whole_minutes(),
                stale_after_min = max_age.as_secs() / 60,
                "moisture data is stale, skipping"
            );
            return PlantResult::Stale;
        }
    }

    // ── Resting ──────────────────────────────────────────────────
    let policy = RestPolicy::for_plant(cfg, settings.default_rest);
    let decision = rest::should_skip(cfg, policy, level);
    cfg.resting = decision.resting;

    if let Some(t) = decision.transition {
        info!(plant = %name, moisture = level, resting = decision.resting, "resting changed");
        if let Some(entity) = &cfg.resting_sensor {
            report(monitor, name, entity, t.as_state(), None, opts).await;
        }
    }

    if decision.skip {
        info!(plant = %name, moisture = level, "plant is resting");
        return PlantResult::Resting;
    }

    // ── Controller ───────────────────────────────────────────────
    let Some(raw) = bank.evaluate(name, level) else {
        error!(plant = %name, "no controller for plant");
        return PlantResult::NoData;
    };
    if let Some((integral, last_error)) = bank.snapshot(name) {
        cfg.integral = integral;
        cfg.last_error = last_error;
    }

    let previous = durations.latest(name).map(|(_, v)| v);
    let control = nudge_repeated(raw, previous, cfg.max_watering_time, settings.nudge);
    cfg.control = Some(control);

    if let Some(entity) = &cfg.pump_sensor {
        let unit = Some(settings.duration_unit.as_str());
        report(monitor, name, entity, &control.to_string(), unit, opts).await;
    }

    // ── Actuation ────────────────────────────────────────────────
    if control <= 0.0 {
        info!(plant = %name, moisture = level, control, "no watering needed");
        return PlantResult::Evaluated { control };
    }

    if opts.dont_water {
        info!(plant = %name, moisture = level, control, "dry run: would water");
        return PlantResult::Evaluated { control };
    }

    info!(plant = %name, moisture = level, seconds = control, "watering");
    let outcome = match pumps.connect(cfg) {
        Ok(mut device) => {
            pump::run(name, &mut device, control, cfg.max_watering_time, &settings.retry).await
        }
        Err(e) => {
            error!(plant = %name, "pump: cannot build device handle: {e}");
            Outcome::DeviceFault(FaultStep::StatusCheck)
        }
    };

    PlantResult::Watered { control, outcome }
}

/// The recorder drops a state that equals the current one, which would hide
/// a repeated duration. Shift such a value by `epsilon` so it is stored.
/// The shift goes downward when going up would break the output ceiling.
pub fn nudge_repeated(control: f64, previous: Option<f64>, max: f64, epsilon: Option<f64>) -> f64 {
    match (epsilon, previous) {
        (Some(eps), Some(prev)) if control > 0.0 && control == prev => {
            if control + eps <= max {
                control + eps
            } else {
                (control - eps).max(0.0)
            }
        }
        _ => control,
    }
}

async fn report<M: Monitor>(
    monitor: &M,
    plant: &str,
    entity: &str,
    state: &str,
    unit: Option<&str>,
    opts: PassOptions,
) {
    if opts.dont_water {
        info!(plant, entity, state, "dry run: would report");
        return;
    }
    match monitor.push_state(entity, state, unit).await {
        Ok(pushed) => info!(plant, entity, state, ?pushed, "reported"),
        Err(e) => error!(plant, entity, "report failed: {e}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

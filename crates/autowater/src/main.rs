mod config;
mod hass;
mod pass;
mod pid;
mod pump;
mod rest;
mod series;
mod store;

use anyhow::Result;
use clap::Parser;
use std::env;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hass::HassClient;
use pass::{PassOptions, PlantResult};
use pump::TuyaConnector;
use store::PlantStore;

/// One closed-loop watering pass over every configured plant.
#[derive(Debug, Parser)]
#[command(name = "autowater", version)]
struct Cli {
    /// Compute and log everything; touch no pump, no file, no remote state.
    #[arg(long)]
    dont_water: bool,

    /// Start every controller from zero integral and last error.
    #[arg(long)]
    clear_pid_history: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let opts = PassOptions {
        dont_water: cli.dont_water,
        clear_pid_history: cli.clear_pid_history,
    };

    // ── Settings + credentials ──────────────────────────────────────
    let config_path = env::var("AUTOWATER_CONFIG").unwrap_or_else(|_| "autowater.toml".to_string());
    let settings = config::load(&config_path)?;
    let token = config::load_token(&settings.home_assistant.token_file)?;

    // ── Plant store ─────────────────────────────────────────────────
    let mut store = PlantStore::load(&settings.plants_file)?;
    if store.plants.is_empty() {
        warn!(path = %settings.plants_file.display(), "no plants configured");
    }

    // ── Collaborators ───────────────────────────────────────────────
    let monitor = HassClient::new(
        &settings.home_assistant.url,
        &token,
        settings.ping_url.clone(),
    )?;
    let pumps = TuyaConnector::new(settings.connect_timeout());

    info!(
        plants = store.plants.len(),
        dont_water = opts.dont_water,
        clear_pid_history = opts.clear_pid_history,
        "starting pass"
    );

    let report = pass::execute(
        &monitor,
        &pumps,
        &mut store,
        &settings.pass_settings(),
        opts,
        OffsetDateTime::now_utc(),
    )
    .await?;

    // ── Summary ─────────────────────────────────────────────────────
    let watered = report
        .results
        .iter()
        .filter(|(_, r)| matches!(r, PlantResult::Watered { .. }))
        .count();
    let skipped = report
        .results
        .iter()
        .filter(|(_, r)| {
            matches!(
                r,
                PlantResult::NoData | PlantResult::Stale | PlantResult::Resting
            )
        })
        .count();
    info!(
        plants = report.results.len(),
        watered,
        skipped,
        persisted = report.persisted,
        "pass complete"
    );

    for plant in report.needs_attention() {
        error!(plant, "pump may still be running, check it by hand");
    }

    Ok(())
}

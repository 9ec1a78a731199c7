//! Plant configuration and persisted controller state.
//!
//! The store is a JSON object keyed by plant name. Plant order in the file is
//! the evaluation order. Keys this program does not know about are carried
//! through untouched when the file is rewritten.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Fallback output ceiling for plants that do not set `max_watering_time`.
pub const DEFAULT_MAX_WATERING_TIME: f64 = 25.0;

const LOCAL_KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    /// Moisture sensor entity.
    pub sensor: String,
    /// Entity holding the last pump duration; also where new ones are written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_sensor: Option<String>,
    /// Entity receiving `on`/`off` when the plant starts or stops resting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_sensor: Option<String>,

    pub id: String,
    pub ip: String,
    pub local_key: String,

    #[serde(rename = "Kp")]
    pub kp: f64,
    #[serde(rename = "Ki")]
    pub ki: f64,
    #[serde(rename = "Kd")]
    pub kd: f64,
    pub target: f64,
    #[serde(default = "default_max_watering_time")]
    pub max_watering_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_target: Option<f64>,

    #[serde(default)]
    pub resting: bool,
    #[serde(default)]
    pub integral: f64,
    #[serde(default)]
    pub last_error: f64,
    /// Most recent clamped controller output, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<f64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_max_watering_time() -> f64 {
    DEFAULT_MAX_WATERING_TIME
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plant {
    pub name: String,
    pub config: PlantConfig,
}

#[derive(Debug)]
pub struct PlantStore {
    path: PathBuf,
    pub plants: Vec<Plant>,
}

impl PlantStore {
    /// Read, parse, and validate the plant file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read plant store: {}", path.display()))?;
        let plants = parse(&contents)
            .with_context(|| format!("failed to parse plant store: {}", path.display()))?;
        validate(&plants).with_context(|| format!("invalid plant store: {}", path.display()))?;
        Ok(Self { path, plants })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Zero every plant's integral and last error.
    pub fn clear_pid_history(&mut self) {
        for p in &mut self.plants {
            p.config.integral = 0.0;
            p.config.last_error = 0.0;
        }
    }

    /// Rewrite the whole file. Readers see either the old or the new content,
    /// never a partial write.
    pub fn save(&self) -> Result<()> {
        let text = render(&self.plants)?;
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(text.as_bytes())
            .context("failed to write plant store")?;
        tmp.as_file()
            .sync_all()
            .context("failed to flush plant store")?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        tracing::info!(plants = self.plants.len(), path = %self.path.display(), "plant store saved");
        Ok(())
    }
}

pub fn parse(contents: &str) -> Result<Vec<Plant>> {
    let root: Map<String, Value> = serde_json::from_str(contents)?;
    root.into_iter()
        .map(|(name, value)| {
            let config = serde_json::from_value(value)
                .with_context(|| format!("plant '{name}' is malformed"))?;
            Ok(Plant { name, config })
        })
        .collect()
}

pub fn render(plants: &[Plant]) -> Result<String> {
    let mut root = Map::new();
    for p in plants {
        root.insert(p.name.clone(), serde_json::to_value(&p.config)?);
    }
    let mut text = serde_json::to_string_pretty(&Value::Object(root))?;
    text.push('\n');
    Ok(text)
}

/// Returns `Ok(())` or an error describing every violation found.
pub fn validate(plants: &[Plant]) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for p in plants {
        let c = &p.config;
        let ctx = format!("plant '{}'", p.name);

        // ── Identity ────────────────────────────────────────
        if p.name.trim().is_empty() {
            errors.push("plant name is empty".to_string());
        } else if !seen.insert(&p.name) {
            errors.push(format!("{ctx}: duplicate name"));
        }
        for (field, value) in [("sensor", &c.sensor), ("id", &c.id), ("ip", &c.ip)] {
            if value.trim().is_empty() {
                errors.push(format!("{ctx}: {field} is empty"));
            }
        }
        if c.local_key.len() != LOCAL_KEY_LEN {
            errors.push(format!(
                "{ctx}: local_key must be {LOCAL_KEY_LEN} bytes, got {}",
                c.local_key.len()
            ));
        }

        // ── Tuning ──────────────────────────────────────────
        for (field, value) in [
            ("Kp", c.kp),
            ("Ki", c.ki),
            ("Kd", c.kd),
            ("target", c.target),
            ("integral", c.integral),
            ("last_error", c.last_error),
        ] {
            if !value.is_finite() {
                errors.push(format!("{ctx}: {field} must be a finite number"));
            }
        }
        if !(c.max_watering_time.is_finite() && c.max_watering_time > 0.0) {
            errors.push(format!(
                "{ctx}: max_watering_time must be positive, got {}",
                c.max_watering_time
            ));
        }

        // ── Hysteresis ──────────────────────────────────────
        if let Some(rt) = c.resting_target {
            if !rt.is_finite() || rt >= c.target {
                errors.push(format!(
                    "{ctx}: resting_target ({rt}) must be below target ({})",
                    c.target
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "plant validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! TOML settings file loading and validation, plus the Home Assistant
//! access token.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pass::PassSettings;
use crate::pump::RetryPolicy;
use crate::rest::RestPolicy;

// ---------------------------------------------------------------------------
// Settings file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub home_assistant: HomeAssistant,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub actuator: Actuator,
    #[serde(default)]
    pub resting: Resting,
    #[serde(default)]
    pub reporting: Reporting,
    #[serde(default = "default_plants_file")]
    pub plants_file: PathBuf,
    /// Liveness URL hit once after a successful, persisted pass.
    #[serde(default)]
    pub ping_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HomeAssistant {
    pub url: String,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct History {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    /// Latest sample older than this is treated as missing.
    #[serde(default)]
    pub stale_after_min: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Actuator {
    #[serde(default = "default_off_attempts")]
    pub off_attempts: u32,
    #[serde(default = "default_off_backoff_ms")]
    pub off_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Dead-band used for plants without their own `resting_target`.
#[derive(Debug, Deserialize)]
pub struct Resting {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_enter")]
    pub default_enter: f64,
    #[serde(default = "default_exit")]
    pub default_exit: f64,
}

#[derive(Debug, Deserialize)]
pub struct Reporting {
    /// Nudge a repeated pump duration so the recorder stores it again.
    #[serde(default = "default_true")]
    pub nudge_unchanged: bool,
    #[serde(default = "default_nudge_epsilon")]
    pub nudge_epsilon: f64,
    #[serde(default = "default_duration_unit")]
    pub duration_unit: String,
}

fn default_plants_file() -> PathBuf {
    PathBuf::from("plant_data.json")
}
fn default_token_file() -> PathBuf {
    PathBuf::from("token.json")
}
fn default_lookback_hours() -> u64 {
    72
}
fn default_off_attempts() -> u32 {
    3
}
fn default_off_backoff_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_enter() -> f64 {
    RestPolicy::LEGACY.enter_at
}
fn default_exit() -> f64 {
    RestPolicy::LEGACY.exit_at
}
fn default_nudge_epsilon() -> f64 {
    0.01
}
fn default_duration_unit() -> String {
    "s".to_string()
}

impl Default for History {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            stale_after_min: None,
        }
    }
}

impl Default for Actuator {
    fn default() -> Self {
        Self {
            off_attempts: default_off_attempts(),
            off_backoff_ms: default_off_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for Resting {
    fn default() -> Self {
        Self {
            enabled: true,
            default_enter: default_enter(),
            default_exit: default_exit(),
        }
    }
}

impl Default for Reporting {
    fn default() -> Self {
        Self {
            nudge_unchanged: true,
            nudge_epsilon: default_nudge_epsilon(),
            duration_unit: default_duration_unit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One year of history is far more than any controller pass looks at.
pub const MAX_LOOKBACK_HOURS: u64 = 24 * 365;
pub const MAX_STALE_AFTER_MIN: u64 = MAX_LOOKBACK_HOURS * 60;

impl Settings {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let url = self.home_assistant.url.trim();
        if url.is_empty() {
            errors.push("home_assistant.url is empty".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "home_assistant.url '{url}' must start with http:// or https://"
            ));
        }

        if !(1..=MAX_LOOKBACK_HOURS).contains(&self.history.lookback_hours) {
            errors.push(format!(
                "history.lookback_hours must be between 1 and {MAX_LOOKBACK_HOURS}, got {}",
                self.history.lookback_hours
            ));
        }
        if let Some(min) = self.history.stale_after_min {
            if !(1..=MAX_STALE_AFTER_MIN).contains(&min) {
                errors.push(format!(
                    "history.stale_after_min must be between 1 and {MAX_STALE_AFTER_MIN} when set, got {min}"
                ));
            }
        }

        if self.actuator.off_attempts == 0 {
            errors.push("actuator.off_attempts must be at least 1".to_string());
        }
        if self.actuator.connect_timeout_ms == 0 {
            errors.push("actuator.connect_timeout_ms must be positive".to_string());
        }

        if self.resting.enabled {
            for (field, value) in [
                ("default_enter", self.resting.default_enter),
                ("default_exit", self.resting.default_exit),
            ] {
                if !value.is_finite() {
                    errors.push(format!("resting.{field} must be a finite number, got {value}"));
                }
            }
        }
        if self.resting.enabled && self.resting.default_exit >= self.resting.default_enter {
            errors.push(format!(
                "resting.default_exit ({}) must be below resting.default_enter ({})",
                self.resting.default_exit, self.resting.default_enter
            ));
        }

        if self.reporting.nudge_unchanged
            && !(self.reporting.nudge_epsilon.is_finite() && self.reporting.nudge_epsilon > 0.0)
        {
            errors.push(format!(
                "reporting.nudge_epsilon must be a positive number, got {}",
                self.reporting.nudge_epsilon
            ));
        }

        if let Some(ping) = &self.ping_url {
            if ping.trim().is_empty() {
                errors.push("ping_url is set but empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// The knobs the control pass needs, in the pass's own terms.
    pub fn pass_settings(&self) -> PassSettings {
        PassSettings {
            lookback: Duration::from_secs(self.history.lookback_hours.saturating_mul(3600)),
            stale_after: self
                .history
                .stale_after_min
                .map(|m| Duration::from_secs(m.saturating_mul(60))),
            default_rest: self.resting.enabled.then(|| RestPolicy {
                enter_at: self.resting.default_enter,
                exit_at: self.resting.default_exit,
            }),
            nudge: self
                .reporting
                .nudge_unchanged
                .then_some(self.reporting.nudge_epsilon),
            duration_unit: self.reporting.duration_unit.clone(),
            retry: RetryPolicy {
                attempts: self.actuator.off_attempts,
                backoff: Duration::from_millis(self.actuator.off_backoff_ms),
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.actuator.connect_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read settings: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse settings: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid settings: {path}"))?;
    Ok(settings)
}

#[derive(Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: String,
}

/// Read the long-lived Home Assistant access token from its JSON file.
pub fn load_token(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file: {}", path.display()))?;
    let token: TokenFile = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse token file: {}", path.display()))?;
    let access_token = token.access_token.trim();
    if access_token.is_empty() {
        bail!("access token in {} is empty", path.display());
    }
    Ok(access_token.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_settings() -> Settings {
        toml::from_str(
            r#"
[home_assistant]
url = "http://127.0.0.1:8123"
"#,
        )
        .unwrap()
    }

    fn assert_validation_err(s: &Settings, needle: &str) {
        let err = s.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn minimal_settings_take_defaults() {
        let s = valid_settings();
        assert_eq!(s.home_assistant.token_file, PathBuf::from("token.json"));
        assert_eq!(s.history.lookback_hours, 72);
        assert_eq!(s.history.stale_after_min, None);
        assert_eq!(s.actuator.off_attempts, 3);
        assert_eq!(s.actuator.off_backoff_ms, 1000);
        assert!(s.resting.enabled);
        assert_eq!(s.resting.default_enter, 40.0);
        assert_eq!(s.resting.default_exit, 34.0);
        assert!(s.reporting.nudge_unchanged);
        assert_eq!(s.reporting.nudge_epsilon, 0.01);
        assert_eq!(s.plants_file, PathBuf::from("plant_data.json"));
        assert!(s.ping_url.is_none());
        s.validate().unwrap();
    }

    #[test]
    fn full_settings_parse() {
        let s: Settings = toml::from_str(
            r#"
plants_file = "/var/lib/autowater/plants.json"
ping_url = "https://hc-ping.example/abc"

[home_assistant]
url = "https://ha.local"
token_file = "/etc/autowater/token.json"

[history]
lookback_hours = 24
stale_after_min = 90

[actuator]
off_attempts = 5
off_backoff_ms = 250

[resting]
enabled = false

[reporting]
nudge_unchanged = false
duration_unit = "sec"
"#,
        )
        .unwrap();
        s.validate().unwrap();

        let p = s.pass_settings();
        assert_eq!(p.lookback, Duration::from_secs(24 * 3600));
        assert_eq!(p.stale_after, Some(Duration::from_secs(90 * 60)));
        assert!(p.default_rest.is_none());
        assert!(p.nudge.is_none());
        assert_eq!(p.duration_unit, "sec");
        assert_eq!(p.retry.attempts, 5);
        assert_eq!(p.retry.backoff, Duration::from_millis(250));
    }

    #[test]
    fn missing_home_assistant_section_fails_to_parse() {
        assert!(toml::from_str::<Settings>("plants_file = \"x.json\"").is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn non_http_url_rejected() {
        let mut s = valid_settings();
        s.home_assistant.url = "ftp://nope".into();
        assert_validation_err(&s, "must start with http");
    }

    #[test]
    fn zero_off_attempts_rejected() {
        let mut s = valid_settings();
        s.actuator.off_attempts = 0;
        assert_validation_err(&s, "off_attempts");
    }

    #[test]
    fn inverted_default_band_rejected() {
        let mut s = valid_settings();
        s.resting.default_exit = 45.0;
        assert_validation_err(&s, "must be below resting.default_enter");
    }

    #[test]
    fn lookback_beyond_a_year_rejected() {
        let mut s = valid_settings();
        s.history.lookback_hours = 5_000_000_000;
        assert_validation_err(&s, "history.lookback_hours must be between 1 and 8760");

        s.history.lookback_hours = MAX_LOOKBACK_HOURS;
        s.validate().unwrap();
    }

    #[test]
    fn stale_after_out_of_range_rejected() {
        let mut s = valid_settings();
        s.history.stale_after_min = Some(0);
        assert_validation_err(&s, "history.stale_after_min");
        s.history.stale_after_min = Some(u64::MAX);
        assert_validation_err(&s, "history.stale_after_min");
    }

    #[test]
    fn huge_values_never_overflow_pass_settings() {
        let mut s = valid_settings();
        s.history.lookback_hours = u64::MAX;
        s.history.stale_after_min = Some(u64::MAX);
        let p = s.pass_settings();
        assert_eq!(p.lookback, Duration::from_secs(u64::MAX));
        assert_eq!(p.stale_after, Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn nan_default_band_rejected() {
        let mut s = valid_settings();
        s.resting.default_enter = f64::NAN;
        assert_validation_err(&s, "resting.default_enter must be a finite number");

        let mut s = valid_settings();
        s.resting.default_exit = f64::NAN;
        assert_validation_err(&s, "resting.default_exit must be a finite number");

        let s: Settings = toml::from_str(
            r#"
[home_assistant]
url = "http://127.0.0.1:8123"

[resting]
default_exit = nan
"#,
        )
        .unwrap();
        assert_validation_err(&s, "resting.default_exit must be a finite number");
    }

    #[test]
    fn nan_band_ignored_when_disabled() {
        let mut s = valid_settings();
        s.resting.enabled = false;
        s.resting.default_enter = f64::NAN;
        s.validate().unwrap();
    }

    #[test]
    fn inverted_band_ignored_when_disabled() {
        let mut s = valid_settings();
        s.resting.enabled = false;
        s.resting.default_exit = 45.0;
        s.validate().unwrap();
    }

    #[test]
    fn all_errors_reported_together() {
        let mut s = valid_settings();
        s.home_assistant.url = "".into();
        s.history.lookback_hours = 0;
        s.reporting.nudge_epsilon = -1.0;
        let msg = format!("{:#}", s.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "{msg}");
    }

    // -- Token ------------------------------------------------------------

    #[test]
    fn token_is_read_and_trimmed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"access_token": "  abc.def  "}}"#).unwrap();
        assert_eq!(load_token(f.path()).unwrap(), "abc.def");
    }

    #[test]
    fn empty_token_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"access_token": ""}}"#).unwrap();
        let msg = format!("{:#}", load_token(f.path()).unwrap_err());
        assert!(msg.contains("is empty"), "{msg}");
    }

    #[test]
    fn missing_token_key_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{}}").unwrap();
        assert!(load_token(f.path()).is_err());
    }

    #[test]
    fn missing_token_file_is_fatal() {
        assert!(load_token(Path::new("/definitely/not/here/token.json")).is_err());
    }
}

//! Fetching per-plant sensor history and aligning it into one table keyed by
//! minute-rounded timestamp.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error};

use crate::hass::{Monitor, StateRecord};
use crate::store::{Plant, PlantConfig};

/// State reported by Home Assistant when a sensor has dropped off.
pub const UNAVAILABLE: &str = "unavailable";

const MINUTE_NANOS: i128 = 60_000_000_000;

/// Wide table: one row per distinct rounded timestamp, one column per plant.
/// Cells are absent where a plant had no sample at that minute.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: BTreeMap<OffsetDateTime, HashMap<String, f64>>,
}

impl Table {
    /// Full outer join of one plant's series onto the table. If two samples
    /// round to the same minute the later one wins.
    pub fn merge_column(&mut self, plant: &str, samples: Vec<(OffsetDateTime, f64)>) {
        if !self.columns.iter().any(|c| c == plant) {
            self.columns.push(plant.to_string());
        }
        for (ts, value) in samples {
            self.rows.entry(ts).or_default().insert(plant.to_string(), value);
        }
    }

    /// Most recent non-missing value for a plant.
    pub fn latest(&self, plant: &str) -> Option<(OffsetDateTime, f64)> {
        self.rows
            .iter()
            .rev()
            .find_map(|(ts, row)| row.get(plant).map(|v| (*ts, *v)))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Round to the nearest whole minute; exact half-minutes go to the even
/// minute.
pub fn round_to_minute(ts: OffsetDateTime) -> OffsetDateTime {
    let nanos = ts.unix_timestamp_nanos();
    let mut q = nanos.div_euclid(MINUTE_NANOS);
    let r = nanos.rem_euclid(MINUTE_NANOS);
    if r * 2 > MINUTE_NANOS || (r * 2 == MINUTE_NANOS && q % 2 != 0) {
        q += 1;
    }
    OffsetDateTime::from_unix_timestamp_nanos(q * MINUTE_NANOS).unwrap_or(ts)
}

/// Drop unavailable, non-numeric and undated records; round what is left.
pub fn clean(records: &[StateRecord]) -> Vec<(OffsetDateTime, f64)> {
    records
        .iter()
        .filter(|r| r.state != UNAVAILABLE)
        .filter_map(|r| {
            let value: f64 = r.state.trim().parse().ok()?;
            if !value.is_finite() {
                return None;
            }
            Some((round_to_minute(r.timestamp()?), value))
        })
        .collect()
}

/// Fetch `window` of history for every plant that has an entity for this
/// signal and join the cleaned series. A failed fetch is logged and leaves
/// that plant without data; it does not stop the others.
pub async fn fetch_and_align<M, F>(
    monitor: &M,
    plants: &[Plant],
    select: F,
    window: Duration,
    now: OffsetDateTime,
) -> Table
where
    M: Monitor,
    F: Fn(&PlantConfig) -> Option<&str>,
{
    let mut table = Table::default();
    let Some(start) = time::Duration::try_from(window)
        .ok()
        .and_then(|w| now.checked_sub(w))
    else {
        error!(window_secs = window.as_secs(), "history window reaches past the calendar, nothing fetched");
        return table;
    };

    for plant in plants {
        let Some(entity) = select(&plant.config) else {
            continue;
        };

        match monitor.history(entity, start, now).await {
            Ok(records) => {
                let samples = clean(&records);
                debug!(
                    plant = %plant.name,
                    entity,
                    raw = records.len(),
                    kept = samples.len(),
                    "history cleaned"
                );
                table.merge_column(&plant.name, samples);
            }
            Err(e) => {
                error!(plant = %plant.name, entity, "history fetch failed: {e}");
            }
        }
    }

    table
}

// ===========================================================================
// Tests
// ===========================================================================

//! Measurement records, timestamp formatting and the persistence drift check.
//!
//! Every accepted sample is persisted as a [`MeasurementRecord`]: the absolute
//! timestamp of the tick, the seconds elapsed since acquisition start, and one
//! formatted field per column. Before a record is written the device calls
//! [`check_drift`], which compares the tick's timestamp with the wall clock and
//! warns when persistence is lagging more than [`DRIFT_WARN_THRESHOLD_S`].
//! The warning never blocks the write.

mod sample;

pub use sample::{Readings, Sample, UnitFrame, MISSING};

use chrono::{DateTime, FixedOffset, Local, Utc};

/// Absolute timestamp of a tick, with the local UTC offset.
pub type Timestamp = DateTime<FixedOffset>;

/// Drift (seconds) above which `save_measurement` emits a warning.
pub const DRIFT_WARN_THRESHOLD_S: f64 = 1.0;

/// One row of a measurement log. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// Absolute timestamp of the tick.
    pub time_abs: Timestamp,
    /// Seconds since acquisition start.
    pub time_rel: f64,
    /// One formatted field per data column, in column order.
    pub fields: Vec<String>,
}

impl MeasurementRecord {
    /// Build a record from already formatted fields.
    pub fn new(time_abs: Timestamp, time_rel: f64, fields: Vec<String>) -> Self {
        Self {
            time_abs,
            time_rel,
            fields,
        }
    }

    /// Build a record from scalar values.
    pub fn from_values(time_abs: Timestamp, time_rel: f64, values: &[f64]) -> Self {
        Self::new(
            time_abs,
            time_rel,
            values.iter().copied().map(format_value).collect(),
        )
    }
}

/// Current local time with its UTC offset.
pub fn now() -> Timestamp {
    Local::now().fixed_offset()
}

/// ISO-8601 with millisecond precision and a space between date and time,
/// e.g. `2024-03-01 12:30:05.123+01:00`.
pub fn format_timestamp(timestamp: &Timestamp) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.3f%:z").to_string()
}

/// Format a value for a log column.
///
/// Integral values keep a trailing `.0` (`0.0`, `50.0`) and failed reads
/// render as `NaN`.
pub fn format_value(value: f64) -> String {
    format!("{value:?}")
}

/// Seconds between `time_abs` and now. Positive when persistence lags behind.
pub fn drift_seconds(time_abs: &Timestamp) -> f64 {
    let lag = Utc::now().signed_duration_since(time_abs.with_timezone(&Utc));
    lag.num_microseconds()
        .map(|us| us as f64 / 1e6)
        .unwrap_or_else(|| lag.num_milliseconds() as f64 / 1e3)
}

/// Warn when the acquisition-to-persistence pipeline is falling behind.
///
/// Returns the measured drift in seconds. This is an observability signal only;
/// callers write the record regardless of the result.
pub fn check_drift(device: &str, time_abs: &Timestamp, time_rel: f64) -> f64 {
    let drift = drift_seconds(time_abs);
    if drift > DRIFT_WARN_THRESHOLD_S {
        tracing::warn!(
            device,
            drift_s = drift,
            time_rel,
            "{device} save_measurement: time difference between event and saving of {drift:.3} seconds for sampling timestep {} - {time_rel}",
            format_timestamp(time_abs)
        );
    }
    drift
}

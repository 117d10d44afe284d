//! Pure alert evaluation.
//!
//! Maps a corrected record, the threshold configured for one alert type and
//! the sensor's current context to an [`AlertState`]. Nothing here touches
//! the pipeline or the clock; `now` arrives through [`AlertContext`].

use chrono::{DateTime, Duration, Utc};

use super::{AlertState, AlertType, PerAlert};
use crate::models::SensorRecord;

// ---

/// Threshold registered for one alert type.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdConfig {
    /// Degrees Celsius.
    Temperature { lower: f64, upper: f64 },
    /// Relative humidity, percent.
    Humidity { lower: f64, upper: f64 },
    /// Hectopascal.
    Pressure { lower: f64, upper: f64 },
    /// Fires when RSSI drops below `lower` dBm.
    Signal { lower: i32 },
    /// Fires when an expected connection is lost.
    Connection,
    /// Fires when the movement counter drifts more than `sensitivity` from
    /// `baseline`.
    Movement { baseline: u32, sensitivity: u32 },
    /// Fires when no cloud record arrived within `unseen`.
    CloudConnection { unseen: Duration },
}

/// Everything besides the record that decides an alert's state.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertContext {
    // ---
    /// The sensor may surface `firing` right now.
    pub fireable: bool,
    /// The alert type has an unexpired mute window.
    pub muted: bool,
    pub now: DateTime<Utc>,
    pub connected: bool,
    pub keep_connection: bool,
    pub last_cloud_update: Option<DateTime<Utc>>,
}

impl ThresholdConfig {
    // ---
    pub fn alert_type(&self) -> AlertType {
        match self {
            ThresholdConfig::Temperature { .. } => AlertType::Temperature,
            ThresholdConfig::Humidity { .. } => AlertType::Humidity,
            ThresholdConfig::Pressure { .. } => AlertType::Pressure,
            ThresholdConfig::Signal { .. } => AlertType::Signal,
            ThresholdConfig::Connection => AlertType::Connection,
            ThresholdConfig::Movement { .. } => AlertType::Movement,
            ThresholdConfig::CloudConnection { .. } => AlertType::CloudConnection,
        }
    }

    /// Whether the raw threshold is crossed. A missing measurement never is.
    pub fn exceeded(&self, record: Option<&SensorRecord>, ctx: &AlertContext) -> bool {
        // ---
        let outside = |value: Option<f64>, lower: f64, upper: f64| {
            value.is_some_and(|v| v < lower || v > upper)
        };

        match *self {
            ThresholdConfig::Temperature { lower, upper } => {
                outside(record.and_then(|r| r.temperature), lower, upper)
            }
            ThresholdConfig::Humidity { lower, upper } => {
                outside(record.and_then(|r| r.humidity), lower, upper)
            }
            ThresholdConfig::Pressure { lower, upper } => {
                outside(record.and_then(|r| r.pressure), lower, upper)
            }
            ThresholdConfig::Signal { lower } => {
                record.and_then(|r| r.rssi).is_some_and(|rssi| rssi < lower)
            }
            ThresholdConfig::Connection => ctx.keep_connection && !ctx.connected,
            ThresholdConfig::Movement {
                baseline,
                sensitivity,
            } => record
                .and_then(|r| r.movement_counter)
                .is_some_and(|counter| counter.abs_diff(baseline) > sensitivity),
            ThresholdConfig::CloudConnection { unseen } => match ctx.last_cloud_update {
                Some(seen) => ctx.now - seen > unseen,
                None => true,
            },
        }
    }
}

/// Evaluate one alert type.
///
/// `Empty` without a configuration; `Firing` only when the threshold is
/// exceeded while the sensor is fireable and the type is not muted;
/// `Registered` otherwise.
pub fn evaluate(
    record: Option<&SensorRecord>,
    config: Option<&ThresholdConfig>,
    ctx: &AlertContext,
) -> AlertState {
    // ---
    let Some(config) = config else {
        return AlertState::Empty;
    };

    if config.exceeded(record, ctx) && ctx.fireable && !ctx.muted {
        AlertState::Firing
    } else {
        AlertState::Registered
    }
}

/// Overall status of a sensor: the most severe per-type state.
pub fn rollup(states: &PerAlert<AlertState>) -> AlertState {
    states.values().copied().max().unwrap_or_default()
}

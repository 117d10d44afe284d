//! Data models for the sensor fleet: identities, registry entries,
//! calibration settings and measurement records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Stable internal identifier of a registered sensor.
///
/// Derived from the identity: the cloud MAC when known, otherwise the local
/// radio id. Persisted manual orderings are lists of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub String);

impl SensorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SensorId {
    fn from(s: &str) -> Self {
        SensorId(s.to_string())
    }
}

/// Physical and/or cloud identity of a sensor.
///
/// At least one of the two ids must be present; a sensor with neither is a
/// contract violation and is refused by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity {
    // ---
    /// Local radio id assigned by the Bluetooth stack.
    pub luid: Option<String>,

    /// Cloud MAC id.
    pub mac: Option<String>,
}

impl SensorIdentity {
    // ---
    pub fn local(luid: impl Into<String>) -> Self {
        Self {
            luid: Some(luid.into()),
            mac: None,
        }
    }

    pub fn cloud(mac: impl Into<String>) -> Self {
        Self {
            luid: None,
            mac: Some(mac.into()),
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.luid.is_some() || self.mac.is_some()
    }

    /// Two identities refer to the same sensor when any id present on both
    /// sides is equal.
    pub fn matches(&self, other: &SensorIdentity) -> bool {
        // ---
        let luid_match = matches!((&self.luid, &other.luid), (Some(a), Some(b)) if a == b);
        let mac_match = matches!((&self.mac, &other.mac), (Some(a), Some(b)) if a == b);
        luid_match || mac_match
    }

    /// The stable id for this identity, `None` when the identity is invalid.
    pub fn sensor_id(&self) -> Option<SensorId> {
        self.mac
            .as_ref()
            .or(self.luid.as_ref())
            .map(|id| SensorId(id.clone()))
    }
}

/// A sensor as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    // ---
    pub identity: SensorIdentity,
    pub name: String,

    /// Owned by a cloud account; its records also arrive from the cloud feed.
    #[serde(default)]
    pub is_cloud: bool,

    /// A persistent Bluetooth connection is expected to be held.
    #[serde(default)]
    pub keep_connection: bool,

    /// Service UUID when the tag exposes a service-level channel.
    #[serde(default)]
    pub service_uuid: Option<String>,
}

impl Sensor {
    // ---
    pub fn new(identity: SensorIdentity, name: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
            is_cloud: false,
            keep_connection: false,
            service_uuid: None,
        }
    }

    pub fn cloud(mut self) -> Self {
        self.is_cloud = true;
        self
    }

    pub fn keep_connection(mut self) -> Self {
        self.keep_connection = true;
        self
    }

    pub fn with_service_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.service_uuid = Some(uuid.into());
        self
    }
}

/// Per-sensor calibration offsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSettings {
    // ---
    pub identity: SensorIdentity,
    pub temperature_offset: Option<f64>,
    pub humidity_offset: Option<f64>,
    pub pressure_offset: Option<f64>,
}

impl SensorSettings {
    pub fn new(identity: SensorIdentity) -> Self {
        Self {
            identity,
            ..Default::default()
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    Advertisement,
    Heartbeat,
    Cloud,
}

/// One timestamped measurement snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    // ---
    pub date: DateTime<Utc>,
    pub source: RecordSource,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    /// Hectopascal.
    pub pressure: Option<f64>,
    pub movement_counter: Option<u32>,
    /// dBm.
    pub rssi: Option<i32>,
    #[serde(default)]
    pub battery_low: bool,
}

impl SensorRecord {
    // ---
    pub fn new(date: DateTime<Utc>, source: RecordSource) -> Self {
        Self {
            date,
            source,
            temperature: None,
            humidity: None,
            pressure: None,
            movement_counter: None,
            rssi: None,
            battery_low: false,
        }
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature = Some(celsius);
        self
    }

    pub fn with_humidity(mut self, percent: f64) -> Self {
        self.humidity = Some(percent);
        self
    }

    pub fn with_pressure(mut self, hpa: f64) -> Self {
        self.pressure = Some(hpa);
        self
    }

    pub fn with_movement_counter(mut self, counter: u32) -> Self {
        self.movement_counter = Some(counter);
        self
    }

    pub fn with_rssi(mut self, dbm: i32) -> Self {
        self.rssi = Some(dbm);
        self
    }

    /// Apply calibration offsets, producing the corrected record every
    /// downstream consumer sees. Humidity stays within `[0, 100]`.
    pub fn calibrated(&self, settings: Option<&SensorSettings>) -> SensorRecord {
        // ---
        let Some(settings) = settings else {
            return self.clone();
        };

        let mut corrected = self.clone();
        if let (Some(t), Some(offset)) = (self.temperature, settings.temperature_offset) {
            corrected.temperature = Some(t + offset);
        }
        if let (Some(h), Some(offset)) = (self.humidity, settings.humidity_offset) {
            corrected.humidity = Some((h + offset).clamp(0.0, 100.0));
        }
        if let (Some(p), Some(offset)) = (self.pressure, settings.pressure_offset) {
            corrected.pressure = Some(p + offset);
        }
        corrected
    }
}

//! Alert vocabulary shared by the evaluator, the mute tracker and the view
//! state: the closed set of alert types, their states, and `PerAlert<T>`,
//! the fixed-size table keyed by alert type that replaces per-type branching.

use std::ops::{Index, IndexMut};

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Temperature,
    Humidity,
    Pressure,
    Signal,
    Connection,
    Movement,
    CloudConnection,
}

impl AlertType {
    // ---
    pub const ALL: [AlertType; 7] = [
        AlertType::Temperature,
        AlertType::Humidity,
        AlertType::Pressure,
        AlertType::Signal,
        AlertType::Connection,
        AlertType::Movement,
        AlertType::CloudConnection,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Temperature => "temperature",
            AlertType::Humidity => "humidity",
            AlertType::Pressure => "pressure",
            AlertType::Signal => "signal",
            AlertType::Connection => "connection",
            AlertType::Movement => "movement",
            AlertType::CloudConnection => "cloud_connection",
        }
    }
}

/// State of one alert type for one sensor.
///
/// Variants are declared in increasing severity so the roll-up is a `max`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// No threshold configured.
    #[default]
    Empty,
    /// Configured but not currently firing.
    Registered,
    /// Exceeded, fireable and not muted.
    Firing,
}

/// One value per [`AlertType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerAlert<T>([T; 7]);

impl<T: Default> Default for PerAlert<T> {
    fn default() -> Self {
        PerAlert(std::array::from_fn(|_| T::default()))
    }
}

impl<T> PerAlert<T> {
    // ---
    pub fn from_fn(mut f: impl FnMut(AlertType) -> T) -> Self {
        PerAlert(std::array::from_fn(|i| f(AlertType::ALL[i])))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AlertType, &T)> {
        AlertType::ALL.iter().copied().zip(self.0.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T> Index<AlertType> for PerAlert<T> {
    type Output = T;

    fn index(&self, alert_type: AlertType) -> &T {
        &self.0[alert_type.index()]
    }
}

impl<T> IndexMut<AlertType> for PerAlert<T> {
    fn index_mut(&mut self, alert_type: AlertType) -> &mut T {
        &mut self.0[alert_type.index()]
    }
}

impl<T: Serialize> Serialize for PerAlert<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // ---
        let mut map = serializer.serialize_map(Some(AlertType::ALL.len()))?;
        for (alert_type, value) in self.iter() {
            map.serialize_entry(alert_type.as_str(), value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_follows_declaration_order() {
        for (i, alert_type) in AlertType::ALL.iter().enumerate() {
            assert_eq!(alert_type.index(), i);
        }
    }

    #[test]
    fn per_alert_serializes_as_named_map() {
        let mut states = PerAlert::<AlertState>::default();
        states[AlertType::Movement] = AlertState::Firing;

        let json = serde_json::to_value(states).unwrap();
        assert_eq!(json["movement"], "firing");
        assert_eq!(json["temperature"], "empty");
        assert_eq!(json.as_object().unwrap().len(), 7);
    }
}

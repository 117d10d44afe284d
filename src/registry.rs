//! Identity & Registry: the canonical list of known sensors.
//!
//! Resolves any identity sharing an id with a registered sensor to that
//! sensor's stable [`SensorId`]. The id is fixed at insertion, so a local tag
//! that later gains a cloud MAC keeps the id it was registered under.

use std::collections::BTreeMap;

use crate::error::{EngineError, Result};
use crate::models::{Sensor, SensorId, SensorIdentity};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug, Clone)]
struct Entry {
    sensor: Sensor,
    seq: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<SensorId, Entry>,
    next_seq: u64,
}

impl Registry {
    // ---
    pub fn resolve(&self, identity: &SensorIdentity) -> Option<&SensorId> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.sensor.identity.matches(identity))
            .map(|(id, _)| id)
    }

    /// Insert `sensor`, or replace the registered sensor it matches.
    pub fn upsert(&mut self, sensor: Sensor) -> Result<(SensorId, Upsert)> {
        // ---
        if let Some(id) = self.resolve(&sensor.identity).cloned() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.sensor = sensor;
            }
            return Ok((id, Upsert::Updated));
        }

        let id = sensor
            .identity
            .sensor_id()
            .ok_or(EngineError::InvalidIdentity)?;
        self.next_seq += 1;
        self.entries.insert(
            id.clone(),
            Entry {
                sensor,
                seq: self.next_seq,
            },
        );
        Ok((id, Upsert::Inserted))
    }

    pub fn remove(&mut self, id: &SensorId) -> Option<Sensor> {
        self.entries.remove(id).map(|entry| entry.sensor)
    }

    pub fn get(&self, id: &SensorId) -> Option<&Sensor> {
        self.entries.get(id).map(|entry| &entry.sensor)
    }

    /// Insertion sequence, used to break ordering ties.
    pub fn seq(&self, id: &SensorId) -> Option<u64> {
        self.entries.get(id).map(|entry| entry.seq)
    }

    pub fn contains(&self, id: &SensorId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SensorId, &Sensor)> {
        self.entries.iter().map(|(id, entry)| (id, &entry.sensor))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_matches_on_shared_id() {
        let mut registry = Registry::default();
        let (id, change) = registry
            .upsert(Sensor::new(SensorIdentity::local("L1"), "Cellar"))
            .unwrap();
        assert_eq!((id.as_str(), change), ("L1", Upsert::Inserted));

        let claimed = Sensor::new(SensorIdentity::local("L1").with_mac("M1"), "Wine cellar");
        let (id, change) = registry.upsert(claimed).unwrap();
        assert_eq!((id.as_str(), change), ("L1", Upsert::Updated));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "Wine cellar");
        assert_eq!(
            registry.resolve(&SensorIdentity::cloud("M1")),
            Some(&SensorId::from("L1"))
        );
    }

    #[test]
    fn invalid_identity_is_refused() {
        let mut registry = Registry::default();
        let result = registry.upsert(Sensor::new(SensorIdentity::default(), "Ghost"));
        assert_eq!(result, Err(EngineError::InvalidIdentity));
        assert!(registry.is_empty());
    }

    #[test]
    fn seq_grows_with_insertion() {
        let mut registry = Registry::default();
        registry.upsert(Sensor::new(SensorIdentity::local("B"), "b")).unwrap();
        registry.upsert(Sensor::new(SensorIdentity::local("A"), "a")).unwrap();
        assert!(registry.seq(&SensorId::from("B")) < registry.seq(&SensorId::from("A")));
        assert!(registry.remove(&SensorId::from("B")).is_some());
        assert!(!registry.contains(&SensorId::from("B")));
    }
}

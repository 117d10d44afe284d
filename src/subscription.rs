//! Subscription Manager.
//!
//! Keeps exactly one live observation per (sensor, source) for the current
//! registry. `resync` diffs the desired set against the active one, so calling
//! it twice without a registry change opens and closes nothing the second
//! time. Every observation carries a generation number; the pipeline drops
//! deliveries whose generation is no longer current, which covers events that
//! were queued before a cancel returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::models::{Sensor, SensorId, SensorIdentity, SensorRecord};
use crate::registry::Registry;
use crate::sources::{
    AdvertisementSource, Callback, CloudRecordFeed, ErrorSink, HeartbeatEvent, HeartbeatSource,
    ObservationToken, SettingsEvent, SettingsFeed,
};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Advertisement,
    Heartbeat,
    CloudRecord,
    Settings,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Advertisement,
        SourceKind::Heartbeat,
        SourceKind::CloudRecord,
        SourceKind::Settings,
    ];
}

/// Payload of one source event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Advertisement(SensorRecord),
    Heartbeat(HeartbeatEvent),
    Cloud(Option<SensorRecord>),
    Settings(SettingsEvent),
}

/// A source event tagged with the subscription it came through.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub sensor: SensorId,
    pub source: SourceKind,
    pub generation: u64,
    pub payload: Payload,
}

/// The stream sources subscriptions are opened against.
#[derive(Clone)]
pub struct Sources {
    pub advertisements: Arc<dyn AdvertisementSource>,
    pub heartbeats: Arc<dyn HeartbeatSource>,
    pub cloud: Arc<dyn CloudRecordFeed>,
    pub settings: Arc<dyn SettingsFeed>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub opened: usize,
    pub closed: usize,
    /// Sensors whose heartbeat observation was closed; nobody watches their
    /// connection any more.
    pub disconnected: Vec<SensorId>,
}

impl ResyncReport {
    pub fn is_noop(&self) -> bool {
        self.opened == 0 && self.closed == 0
    }
}

struct Active {
    generation: u64,
    /// The part of the identity the observation was opened for.
    target: SensorIdentity,
    token: ObservationToken,
}

type Key = (SensorId, SourceKind);

pub struct SubscriptionManager {
    // ---
    sources: Sources,
    errors: Arc<dyn ErrorSink>,
    deliver: Callback<Delivery>,
    active: BTreeMap<Key, Active>,
    next_generation: u64,
}

/// The subscriptions `sensor` should have, with the identity each is
/// opened for.
///
/// Radio sources are skipped for cloud sensors while cloud mode is on: the
/// cloud feed supersedes them.
pub fn desired_for(sensor: &Sensor, cloud_mode: bool) -> Vec<(SourceKind, SensorIdentity)> {
    // ---
    let mut desired = Vec::with_capacity(SourceKind::ALL.len());
    let radio_allowed = !(cloud_mode && sensor.is_cloud);

    if let (Some(luid), true) = (&sensor.identity.luid, radio_allowed) {
        desired.push((SourceKind::Advertisement, SensorIdentity::local(luid.clone())));
        if sensor.keep_connection {
            desired.push((SourceKind::Heartbeat, SensorIdentity::local(luid.clone())));
        }
    }
    if let (Some(mac), true) = (&sensor.identity.mac, sensor.is_cloud) {
        desired.push((SourceKind::CloudRecord, SensorIdentity::cloud(mac.clone())));
    }
    desired.push((SourceKind::Settings, sensor.identity.clone()));
    desired
}

impl SubscriptionManager {
    // ---
    pub fn new(sources: Sources, errors: Arc<dyn ErrorSink>, deliver: Callback<Delivery>) -> Self {
        Self {
            sources,
            errors,
            deliver,
            active: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Bring active subscriptions in line with `registry`.
    pub fn resync(&mut self, registry: &Registry, cloud_mode: bool) -> ResyncReport {
        // ---
        let desired: BTreeMap<Key, SensorIdentity> = registry
            .iter()
            .flat_map(|(id, sensor)| {
                desired_for(sensor, cloud_mode)
                    .into_iter()
                    .map(move |(source, target)| ((id.clone(), source), target))
            })
            .collect();

        let mut report = ResyncReport::default();

        let stale: Vec<Key> = self
            .active
            .iter()
            .filter(|(key, active)| desired.get(*key) != Some(&active.target))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if self.close(&key) {
                report.closed += 1;
                if key.1 == SourceKind::Heartbeat {
                    report.disconnected.push(key.0);
                }
            }
        }

        for (key, target) in desired {
            if !self.active.contains_key(&key) {
                let active = self.open(&key, target);
                self.active.insert(key, active);
                report.opened += 1;
            }
        }

        if !report.is_noop() {
            debug!(
                "Resync opened {} and closed {} subscriptions ({} active)",
                report.opened,
                report.closed,
                self.active.len()
            );
        }
        report
    }

    /// Cancel every subscription of `sensor`; returns how many were closed.
    pub fn cancel_sensor(&mut self, sensor: &SensorId) -> usize {
        // ---
        let keys: Vec<Key> = self
            .active
            .keys()
            .filter(|(id, _)| id == sensor)
            .cloned()
            .collect();
        keys.iter().filter(|key| self.close(key)).count()
    }

    /// Release every live subscription at once.
    pub fn close_all(&mut self) -> usize {
        // ---
        let count = self.active.len();
        for (_, mut active) in std::mem::take(&mut self.active) {
            active.token.cancel();
        }
        count
    }

    /// Whether a delivery still belongs to a live subscription.
    pub fn is_current(&self, sensor: &SensorId, source: SourceKind, generation: u64) -> bool {
        self.active
            .get(&(sensor.clone(), source))
            .is_some_and(|active| active.generation == generation)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_sources(&self, sensor: &SensorId) -> Vec<SourceKind> {
        self.active
            .keys()
            .filter(|(id, _)| id == sensor)
            .map(|(_, source)| *source)
            .collect()
    }

    fn close(&mut self, key: &Key) -> bool {
        // ---
        match self.active.remove(key) {
            Some(mut active) => {
                active.token.cancel();
                debug!("Closed {:?} subscription for {}", key.1, key.0);
                true
            }
            None => false,
        }
    }

    fn open(&mut self, key: &Key, target: SensorIdentity) -> Active {
        // ---
        self.next_generation += 1;
        let generation = self.next_generation;
        let (sensor, source) = (key.0.clone(), key.1);

        let token = match source {
            SourceKind::Advertisement => {
                let callback = self.route(sensor, source, generation, Payload::Advertisement);
                let luid = target.luid.as_deref().unwrap_or_default();
                self.sources.advertisements.observe(luid, callback)
            }
            SourceKind::Heartbeat => {
                let callback = self.route(sensor, source, generation, Payload::Heartbeat);
                let luid = target.luid.as_deref().unwrap_or_default();
                self.sources.heartbeats.observe(luid, callback)
            }
            SourceKind::CloudRecord => {
                let callback = self.route(sensor, source, generation, Payload::Cloud);
                let mac = target.mac.as_deref().unwrap_or_default();
                self.sources.cloud.observe_latest(mac, callback)
            }
            SourceKind::Settings => {
                let callback = self.route(sensor, source, generation, Payload::Settings);
                self.sources.settings.observe(&target, callback)
            }
        };

        debug!("Opened {:?} subscription for {} (generation {})", source, key.0, generation);
        Active {
            generation,
            target,
            token,
        }
    }

    /// Callback tagging every payload with its subscription and routing
    /// failures to the error sink.
    fn route<T: 'static>(
        &self,
        sensor: SensorId,
        source: SourceKind,
        generation: u64,
        wrap: fn(T) -> Payload,
    ) -> Callback<Result<T, SourceError>> {
        // ---
        let deliver = Arc::clone(&self.deliver);
        let errors = Arc::clone(&self.errors);
        Arc::new(move |result| match result {
            Ok(value) => deliver(Delivery {
                sensor: sensor.clone(),
                source,
                generation,
                payload: wrap(value),
            }),
            Err(error) => {
                warn!("{:?} source reported an error: {}", source, error);
                errors.report(&error);
            }
        })
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::memory::MemoryBackend;
    use std::sync::Mutex;

    fn manager(backend: &MemoryBackend) -> (SubscriptionManager, Arc<Mutex<Vec<Delivery>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let sources = Sources {
            advertisements: backend.sources.clone(),
            heartbeats: backend.sources.clone(),
            cloud: backend.sources.clone(),
            settings: backend.sources.clone(),
        };
        let manager = SubscriptionManager::new(
            sources,
            backend.errors.clone(),
            Arc::new(move |delivery| sink.lock().unwrap().push(delivery)),
        );
        (manager, delivered)
    }

    fn registry(sensors: Vec<Sensor>) -> Registry {
        let mut registry = Registry::default();
        for sensor in sensors {
            registry.upsert(sensor).unwrap();
        }
        registry
    }

    #[test]
    fn resync_is_idempotent() {
        let backend = MemoryBackend::default();
        let (mut manager, _) = manager(&backend);
        let registry = registry(vec![
            Sensor::new(SensorIdentity::local("L1"), "Sauna").keep_connection(),
            Sensor::new(SensorIdentity::cloud("M2"), "Garage").cloud(),
        ]);

        let first = manager.resync(&registry, false);
        assert_eq!((first.opened, first.closed), (5, 0));
        assert!(manager.resync(&registry, false).is_noop());
        assert_eq!(backend.sources.opened(SourceKind::Advertisement), 1);
        assert_eq!(backend.sources.active(SourceKind::Settings), 2);
    }

    #[test]
    fn cloud_mode_drops_radio_for_cloud_sensors() {
        let backend = MemoryBackend::default();
        let (mut manager, _) = manager(&backend);
        let both = SensorIdentity::local("L1").with_mac("M1");
        let registry = registry(vec![Sensor::new(both, "Kitchen").cloud().keep_connection()]);
        let id = SensorId::from("M1");

        manager.resync(&registry, false);
        assert_eq!(manager.active_sources(&id).len(), 4);

        let report = manager.resync(&registry, true);
        assert_eq!(
            report,
            ResyncReport {
                opened: 0,
                closed: 2,
                disconnected: vec![id.clone()],
            }
        );
        assert_eq!(
            manager.active_sources(&id),
            vec![SourceKind::CloudRecord, SourceKind::Settings]
        );
        assert_eq!(backend.sources.active(SourceKind::Advertisement), 0);
        assert_eq!(backend.sources.active(SourceKind::Heartbeat), 0);
    }

    #[test]
    fn changed_identity_reopens_with_new_generation() {
        let backend = MemoryBackend::default();
        let (mut manager, delivered) = manager(&backend);
        let mut registry = registry(vec![Sensor::new(SensorIdentity::local("L1"), "Attic")]);
        manager.resync(&registry, false);
        let id = SensorId::from("L1");

        backend.sources.push_advertisement("L1", sample());
        let old_generation = delivered.lock().unwrap()[1].generation;
        assert!(manager.is_current(&id, SourceKind::Advertisement, old_generation));

        registry
            .upsert(Sensor::new(SensorIdentity::local("L1").with_mac("M1"), "Attic"))
            .unwrap();
        let report = manager.resync(&registry, false);
        // Settings target changed; the advertisement target did not.
        assert_eq!((report.opened, report.closed), (1, 1));
        assert!(report.disconnected.is_empty());
        assert!(manager.is_current(&id, SourceKind::Advertisement, old_generation));
    }

    #[test]
    fn cancel_sensor_stops_delivery() {
        let backend = MemoryBackend::default();
        let (mut manager, delivered) = manager(&backend);
        let registry = registry(vec![Sensor::new(SensorIdentity::local("L1"), "Porch")]);
        manager.resync(&registry, false);

        assert_eq!(manager.cancel_sensor(&SensorId::from("L1")), 2);
        let before = delivered.lock().unwrap().len();
        assert_eq!(backend.sources.push_advertisement("L1", sample()), 0);
        assert_eq!(delivered.lock().unwrap().len(), before);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn source_errors_go_to_the_sink() {
        let backend = MemoryBackend::default();
        let (mut manager, delivered) = manager(&backend);
        let registry = registry(vec![Sensor::new(SensorIdentity::local("L1"), "Porch")]);
        manager.resync(&registry, false);
        let before = delivered.lock().unwrap().len();

        backend
            .sources
            .fail(SourceError::Advertisement("adapter powered off".into()));
        assert_eq!(delivered.lock().unwrap().len(), before);
        assert_eq!(backend.errors.reported().len(), 1);
        assert_eq!(manager.active_count(), 2);
    }

    fn sample() -> SensorRecord {
        SensorRecord::new(chrono::Utc::now(), crate::models::RecordSource::Advertisement)
            .with_temperature(21.0)
    }
}

//! Aggregation Pipeline.
//!
//! The single writer of sensor view states. Every inbound update (sample,
//! registry change, settings change, connectivity change, alert-config
//! change, mute and order commands, sweep tick) goes through [`Pipeline::apply`],
//! one at a time, and either leaves the states untouched or replaces whole
//! `SensorViewState` values. The engine owns the pipeline on one task, so
//! observers only ever see fully merged snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::alert::{evaluate, rollup, AlertContext, AlertType, MuteWindows, PerAlert};
use crate::models::{Sensor, SensorId, SensorRecord, SensorSettings};
use crate::ordering::{self, SortOrder};
use crate::registry::{Registry, Upsert};
use crate::sources::{AlertConfigStore, HeartbeatEvent, RegistryEvent, SettingsEvent};
use crate::subscription::{Delivery, Payload, SubscriptionManager};
use crate::view::SensorViewState;

// ---

/// Everything the pipeline merges.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Delivery(Delivery),
    Registry(RegistryEvent),
    /// Remove a sensor by id (UI command).
    Remove(SensorId),
    Connectivity { sensor: SensorId, connected: bool },
    /// Thresholds changed for one sensor, or for all when `None`.
    AlertConfigChanged(Option<SensorId>),
    Mute {
        sensor: SensorId,
        alert_type: AlertType,
        duration: Duration,
    },
    Unmute {
        sensor: SensorId,
        alert_type: AlertType,
    },
    SetOrder(SortOrder),
    SetCloudMode(bool),
    Sweep,
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// A new snapshot must be published.
    pub changed: bool,
    /// The display order changed and must be persisted.
    pub order_changed: bool,
    /// The last sensor was removed.
    pub fleet_emptied: bool,
}

impl Outcome {
    fn changed(changed: bool) -> Self {
        Self {
            changed,
            ..Default::default()
        }
    }
}

/// Per-sensor state beyond what the view shows.
#[derive(Debug, Clone)]
struct Tracked {
    view: SensorViewState,
    /// Last record before calibration, re-corrected on settings changes.
    raw: Option<SensorRecord>,
    settings: Option<SensorSettings>,
    mutes: MuteWindows,
    connected: bool,
    last_cloud_update: Option<DateTime<Utc>>,
}

pub struct Pipeline {
    // ---
    registry: Registry,
    tracked: BTreeMap<SensorId, Tracked>,
    subscriptions: SubscriptionManager,
    alert_config: Arc<dyn AlertConfigStore>,
    order: SortOrder,
    cloud_mode: bool,
}

/// Expiry of a mute window starting at `now`. Durations past the calendar
/// range saturate instead of overflowing.
fn mute_expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(duration).unwrap_or(if duration > Duration::zero() {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

/// The canonical fireability rule: a cloud sensor that has delivered cloud
/// data, a held Bluetooth connection, or a service-level channel.
fn is_fireable(sensor: &Sensor, tracked: &Tracked) -> bool {
    (sensor.is_cloud && tracked.last_cloud_update.is_some())
        || tracked.connected
        || sensor.service_uuid.is_some()
}

impl Pipeline {
    // ---
    pub fn new(
        subscriptions: SubscriptionManager,
        alert_config: Arc<dyn AlertConfigStore>,
        order: SortOrder,
        cloud_mode: bool,
    ) -> Self {
        Self {
            registry: Registry::default(),
            tracked: BTreeMap::new(),
            subscriptions,
            alert_config,
            order,
            cloud_mode,
        }
    }

    /// Merge one update.
    pub fn apply(&mut self, update: Update, now: DateTime<Utc>) -> Outcome {
        // ---
        match update {
            Update::Delivery(delivery) => self.apply_delivery(delivery, now),
            Update::Registry(event) => self.apply_registry(event, now),
            Update::Remove(id) => self.remove(&id),
            Update::Connectivity { sensor, connected } => {
                let Some(tracked) = self.tracked.get_mut(&sensor) else {
                    debug!("Connectivity change for unknown sensor {}", sensor);
                    return Outcome::default();
                };
                tracked.connected = connected;
                Outcome::changed(self.recompute(&sensor, now))
            }
            Update::AlertConfigChanged(Some(id)) => Outcome::changed(self.recompute(&id, now)),
            Update::AlertConfigChanged(None) => Outcome::changed(self.recompute_all(now)),
            Update::Mute {
                sensor,
                alert_type,
                duration,
            } => self.mute(&sensor, alert_type, mute_expiry(now, duration), now),
            Update::Unmute { sensor, alert_type } => self.unmute(&sensor, alert_type, now),
            Update::SetOrder(order) => {
                let changed = order != self.order;
                self.order = order;
                Outcome {
                    changed,
                    order_changed: changed,
                    fleet_emptied: false,
                }
            }
            Update::SetCloudMode(cloud_mode) => {
                self.cloud_mode = cloud_mode;
                info!("Cloud mode {}", if cloud_mode { "enabled" } else { "disabled" });
                Outcome::changed(self.resync(now))
            }
            Update::Sweep => self.sweep(now),
        }
    }

    /// Ordered copy of every view state.
    pub fn snapshot(&self) -> Vec<SensorViewState> {
        let states = self.tracked.values().map(|t| t.view.clone()).collect();
        ordering::order(states, &self.order)
    }

    pub fn order(&self) -> &SortOrder {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Recompute the desired subscription set. A sensor whose heartbeat
    /// observation closes counts as disconnected from then on. Returns
    /// whether any view state changed.
    fn resync(&mut self, now: DateTime<Utc>) -> bool {
        // ---
        let report = self.subscriptions.resync(&self.registry, self.cloud_mode);
        if !report.is_noop() {
            info!(
                "Resync opened {}, closed {} subscriptions",
                report.opened, report.closed
            );
        }

        let mut changed = false;
        for id in &report.disconnected {
            let Some(tracked) = self.tracked.get_mut(id) else {
                continue;
            };
            if tracked.connected {
                debug!("Heartbeat closed for {}, marking disconnected", id);
                tracked.connected = false;
                changed |= self.recompute(id, now);
            }
        }
        changed
    }

    /// Release every live subscription.
    pub fn shutdown(&mut self) {
        let closed = self.subscriptions.close_all();
        info!("Pipeline shut down, released {} subscriptions", closed);
    }

    fn apply_delivery(&mut self, delivery: Delivery, now: DateTime<Utc>) -> Outcome {
        // ---
        let Delivery {
            sensor,
            source,
            generation,
            payload,
        } = delivery;

        if !self.subscriptions.is_current(&sensor, source, generation) {
            debug!(
                "Dropping stale {:?} event for {} (generation {})",
                source, sensor, generation
            );
            return Outcome::default();
        }
        let Some(tracked) = self.tracked.get_mut(&sensor) else {
            debug!("Dropping {:?} event for unknown sensor {}", source, sensor);
            return Outcome::default();
        };

        match payload {
            Payload::Advertisement(record) => Self::accept_record(tracked, record),
            Payload::Heartbeat(HeartbeatEvent::Sample(record)) => {
                tracked.connected = true;
                Self::accept_record(tracked, record);
            }
            Payload::Heartbeat(HeartbeatEvent::Connected) => tracked.connected = true,
            Payload::Heartbeat(HeartbeatEvent::Disconnected) => tracked.connected = false,
            Payload::Cloud(Some(record)) => {
                tracked.last_cloud_update = Some(
                    tracked
                        .last_cloud_update
                        .map_or(record.date, |seen| seen.max(record.date)),
                );
                Self::accept_record(tracked, record);
            }
            Payload::Cloud(None) => return Outcome::default(),
            Payload::Settings(event) => {
                let identity = self
                    .registry
                    .get(&sensor)
                    .map(|s| s.identity.clone())
                    .unwrap_or_default();
                tracked.settings = match event {
                    SettingsEvent::Initial(list) => list
                        .into_iter()
                        .find(|s| s.identity.matches(&identity)),
                    SettingsEvent::Insert(settings) | SettingsEvent::Update(settings) => {
                        Some(settings)
                    }
                    SettingsEvent::Delete(_) => None,
                };
            }
        }

        Outcome::changed(self.recompute(&sensor, now))
    }

    /// Last value wins by record date; an older record never replaces a
    /// newer one already shown.
    fn accept_record(tracked: &mut Tracked, record: SensorRecord) {
        if tracked.raw.as_ref().map_or(true, |raw| record.date >= raw.date) {
            tracked.raw = Some(record);
        }
    }

    fn apply_registry(&mut self, event: RegistryEvent, now: DateTime<Utc>) -> Outcome {
        // ---
        match event {
            RegistryEvent::Initial(sensors) => self.replace_all(sensors, now),
            RegistryEvent::Insert(sensor) | RegistryEvent::Update(sensor) => {
                let mut outcome = Outcome::default();
                if let Some(id) = self.upsert(sensor, now, &mut outcome) {
                    outcome.changed |= self.resync(now);
                    outcome.changed |= self.recompute(&id, now);
                }
                outcome
            }
            RegistryEvent::Delete(sensor) => {
                match self.registry.resolve(&sensor.identity).cloned() {
                    Some(id) => self.remove(&id),
                    None => {
                        debug!("Delete for unregistered sensor {:?}", sensor.identity);
                        Outcome::default()
                    }
                }
            }
            // Reported to the error sink where the feed is observed.
            RegistryEvent::Error(_) => Outcome::default(),
        }
    }

    /// Replace the registry with `sensors`: unlisted sensors are removed,
    /// listed ones inserted or updated.
    fn replace_all(&mut self, sensors: Vec<Sensor>, now: DateTime<Utc>) -> Outcome {
        // ---
        let mut outcome = Outcome {
            changed: true,
            ..Default::default()
        };

        let stale: Vec<SensorId> = self
            .registry
            .iter()
            .filter(|(_, known)| !sensors.iter().any(|s| s.identity.matches(&known.identity)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.drop_sensor(id, &mut outcome);
        }

        let mut upserted = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            if let Some(id) = self.upsert(sensor, now, &mut outcome) {
                upserted.push(id);
            }
        }

        self.resync(now);
        for id in &upserted {
            self.recompute(id, now);
        }

        outcome.fleet_emptied = self.tracked.is_empty();
        info!(
            "Registry loaded: {} sensors ({} removed)",
            self.tracked.len(),
            stale.len()
        );
        outcome
    }

    /// Register or update one sensor. Returns its id, or `None` when the
    /// sensor was refused.
    fn upsert(
        &mut self,
        sensor: Sensor,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) -> Option<SensorId> {
        // ---
        if !sensor.identity.is_valid() {
            debug_assert!(false, "sensor {:?} has neither a local nor a cloud id", sensor.name);
            warn!("Ignoring sensor {:?} without any id", sensor.name);
            return None;
        }

        let name = sensor.name.clone();
        let cloud = sensor.is_cloud;
        let identity = sensor.identity.clone();
        let (id, change) = match self.registry.upsert(sensor) {
            Ok(upserted) => upserted,
            Err(error) => {
                warn!("Ignoring sensor {:?}: {}", name, error);
                return None;
            }
        };

        match change {
            Upsert::Inserted => {
                let seq = self.registry.seq(&id).unwrap_or_default();
                let mut mutes = MuteWindows::default();
                for alert_type in AlertType::ALL {
                    if let Some(until) = self.alert_config.muted_until(alert_type, &id) {
                        mutes.set(alert_type, until, now);
                    }
                }
                self.tracked.insert(
                    id.clone(),
                    Tracked {
                        view: SensorViewState::new(id.clone(), identity, name.clone(), cloud, seq),
                        raw: None,
                        settings: None,
                        mutes,
                        connected: false,
                        last_cloud_update: None,
                    },
                );
                outcome.order_changed |= self.order.prepend(&id);
                outcome.changed = true;
                info!("Registered sensor {} ({:?})", id, name);
            }
            Upsert::Updated => debug!("Updated sensor {} ({:?})", id, name),
        }
        Some(id)
    }

    fn remove(&mut self, id: &SensorId) -> Outcome {
        // ---
        if !self.registry.contains(id) {
            debug!("Remove for unknown sensor {}", id);
            return Outcome::default();
        }
        let mut outcome = Outcome::default();
        self.drop_sensor(id, &mut outcome);
        outcome.fleet_emptied = self.tracked.is_empty();
        outcome
    }

    fn drop_sensor(&mut self, id: &SensorId, outcome: &mut Outcome) {
        // ---
        let closed = self.subscriptions.cancel_sensor(id);
        self.registry.remove(id);
        self.tracked.remove(id);
        outcome.order_changed |= self.order.forget(id);
        outcome.changed = true;
        info!("Removed sensor {} ({} subscriptions closed)", id, closed);
    }

    fn mute(
        &mut self,
        sensor: &SensorId,
        alert_type: AlertType,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Outcome {
        // ---
        let Some(tracked) = self.tracked.get_mut(sensor) else {
            debug!("Mute for unknown sensor {}", sensor);
            return Outcome::default();
        };
        if !tracked.mutes.set(alert_type, until, now) {
            debug!("Mute for {} {} already expired", sensor, alert_type.as_str());
            return Outcome::default();
        }
        self.alert_config
            .store_muted_until(alert_type, sensor, Some(until));
        Outcome::changed(self.recompute(sensor, now))
    }

    fn unmute(&mut self, sensor: &SensorId, alert_type: AlertType, now: DateTime<Utc>) -> Outcome {
        // ---
        let Some(tracked) = self.tracked.get_mut(sensor) else {
            debug!("Unmute for unknown sensor {}", sensor);
            return Outcome::default();
        };
        if !tracked.mutes.clear(alert_type) {
            return Outcome::default();
        }
        self.alert_config.store_muted_until(alert_type, sensor, None);
        Outcome::changed(self.recompute(sensor, now))
    }

    /// Expire elapsed mute windows and re-evaluate every sensor against its
    /// last record; time-based alerts change here without new data.
    fn sweep(&mut self, now: DateTime<Utc>) -> Outcome {
        // ---
        let mut changed = false;
        let ids: Vec<SensorId> = self.tracked.keys().cloned().collect();
        for id in &ids {
            let expired = match self.tracked.get_mut(id) {
                Some(tracked) => tracked.mutes.sweep(now),
                None => continue,
            };
            for alert_type in &expired {
                self.alert_config.store_muted_until(*alert_type, id, None);
            }
            if !expired.is_empty() {
                debug!("Mute windows expired for {}: {:?}", id, expired);
            }
            changed |= self.recompute(id, now);
        }
        Outcome::changed(changed)
    }

    fn recompute_all(&mut self, now: DateTime<Utc>) -> bool {
        let ids: Vec<SensorId> = self.tracked.keys().cloned().collect();
        ids.iter()
            .fold(false, |changed, id| self.recompute(id, now) || changed)
    }

    /// Rebuild a sensor's view state from its raw record, settings, mutes
    /// and connectivity. Returns whether it differs from the published one.
    fn recompute(&mut self, id: &SensorId, now: DateTime<Utc>) -> bool {
        // ---
        let (Some(sensor), Some(tracked)) = (self.registry.get(id), self.tracked.get_mut(id)) else {
            return false;
        };

        let corrected = tracked
            .raw
            .as_ref()
            .map(|raw| raw.calibrated(tracked.settings.as_ref()));
        let fireable = is_fireable(sensor, tracked);

        let alert_config = &self.alert_config;
        let alerts = PerAlert::from_fn(|alert_type| {
            let config = alert_config.thresholds(id, alert_type);
            let ctx = AlertContext {
                fireable,
                muted: tracked.mutes.is_muted(alert_type, now),
                now,
                connected: tracked.connected,
                keep_connection: sensor.keep_connection,
                last_cloud_update: tracked.last_cloud_update,
            };
            evaluate(corrected.as_ref(), config.as_ref(), &ctx)
        });
        let overall = rollup(&alerts);

        let next = SensorViewState {
            id: id.clone(),
            identity: sensor.identity.clone(),
            name: sensor.name.clone(),
            record: corrected,
            alerts,
            mutes: *tracked.mutes.expiries(),
            rollup: overall,
            connected: tracked.connected,
            cloud: sensor.is_cloud,
            fireable,
            seq: tracked.view.seq,
        };
        if next == tracked.view {
            return false;
        }
        tracked.view = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertState, ThresholdConfig};
    use crate::models::{RecordSource, SensorIdentity};
    use crate::sources::memory::MemoryBackend;
    use crate::subscription::{SourceKind, Sources};
    use std::sync::Mutex;

    struct Harness {
        backend: MemoryBackend,
        queue: Arc<Mutex<Vec<Delivery>>>,
        pipeline: Pipeline,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new(order: SortOrder) -> Self {
            let backend = MemoryBackend::default();
            let queue = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&queue);
            let subscriptions = SubscriptionManager::new(
                Sources {
                    advertisements: backend.sources.clone(),
                    heartbeats: backend.sources.clone(),
                    cloud: backend.sources.clone(),
                    settings: backend.sources.clone(),
                },
                backend.errors.clone(),
                Arc::new(move |delivery| sink.lock().unwrap().push(delivery)),
            );
            let pipeline = Pipeline::new(
                subscriptions,
                backend.alert_config.clone(),
                order,
                false,
            );
            Self {
                backend,
                queue,
                pipeline,
                now: Utc::now(),
            }
        }

        fn apply(&mut self, update: Update) -> Outcome {
            self.pipeline.apply(update, self.now)
        }

        /// Merge everything the sources have queued so far.
        fn drain(&mut self) {
            let queued: Vec<Delivery> = std::mem::take(&mut *self.queue.lock().unwrap());
            for delivery in queued {
                self.pipeline.apply(Update::Delivery(delivery), self.now);
            }
        }

        fn insert(&mut self, sensor: Sensor) -> Outcome {
            let outcome = self.apply(Update::Registry(RegistryEvent::Insert(sensor)));
            self.drain();
            outcome
        }

        fn state(&self, id: &str) -> SensorViewState {
            self.pipeline
                .snapshot()
                .into_iter()
                .find(|s| s.id.as_str() == id)
                .expect("sensor in snapshot")
        }

        fn ids(&self) -> Vec<String> {
            self.pipeline
                .snapshot()
                .iter()
                .map(|s| s.id.to_string())
                .collect()
        }

        fn advertise(&mut self, luid: &str, temperature: f64) {
            let record = SensorRecord::new(self.now, RecordSource::Advertisement)
                .with_temperature(temperature);
            self.backend.sources.push_advertisement(luid, record);
            self.drain();
        }
    }

    fn tag(luid: &str, name: &str) -> Sensor {
        Sensor::new(SensorIdentity::local(luid), name).with_service_uuid("6e400001")
    }

    fn temperature_band(h: &Harness, id: &str) {
        h.backend.alert_config.set_threshold(
            &SensorId::from(id),
            ThresholdConfig::Temperature {
                lower: 18.0,
                upper: 25.0,
            },
        );
    }

    #[test]
    fn new_sensor_starts_empty() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        let outcome = h.insert(Sensor::new(SensorIdentity::local("A"), "Attic"));
        assert!(outcome.changed);

        let a = h.state("A");
        assert!(a.alerts.values().all(|s| *s == AlertState::Empty));
        assert_eq!(a.rollup, AlertState::Empty);
        assert_eq!(a.record, None);
    }

    #[test]
    fn exceeding_sample_fires_and_mute_suppresses_until_sweep() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        temperature_band(&h, "A");
        h.apply(Update::AlertConfigChanged(Some("A".into())));
        assert_eq!(h.state("A").alerts[AlertType::Temperature], AlertState::Registered);

        h.advertise("A", 30.0);
        assert_eq!(h.state("A").alerts[AlertType::Temperature], AlertState::Firing);
        assert_eq!(h.state("A").rollup, AlertState::Firing);

        h.apply(Update::Mute {
            sensor: "A".into(),
            alert_type: AlertType::Temperature,
            duration: Duration::seconds(60),
        });
        assert_eq!(h.state("A").alerts[AlertType::Temperature], AlertState::Registered);
        assert_eq!(h.state("A").rollup, AlertState::Registered);

        // Still muted: new exceeding data cannot fire.
        h.now += Duration::seconds(30);
        h.advertise("A", 31.0);
        assert_eq!(h.state("A").alerts[AlertType::Temperature], AlertState::Registered);

        h.now += Duration::seconds(31);
        assert!(h.apply(Update::Sweep).changed);
        let a = h.state("A");
        assert_eq!(a.alerts[AlertType::Temperature], AlertState::Firing);
        assert_eq!(a.mutes[AlertType::Temperature], None);
        assert_eq!(
            h.backend
                .alert_config
                .muted_until(AlertType::Temperature, &"A".into()),
            None
        );
    }

    #[test]
    fn unmute_restores_firing_immediately() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        temperature_band(&h, "A");
        h.advertise("A", 30.0);
        h.apply(Update::Mute {
            sensor: "A".into(),
            alert_type: AlertType::Temperature,
            duration: Duration::minutes(10),
        });
        assert_eq!(h.state("A").rollup, AlertState::Registered);

        h.apply(Update::Unmute {
            sensor: "A".into(),
            alert_type: AlertType::Temperature,
        });
        assert_eq!(h.state("A").rollup, AlertState::Firing);
    }

    #[test]
    fn mute_in_the_past_is_noop() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        let outcome = h.apply(Update::Mute {
            sensor: "A".into(),
            alert_type: AlertType::Humidity,
            duration: Duration::seconds(-5),
        });
        assert_eq!(outcome, Outcome::default());
        assert_eq!(h.state("A").mutes[AlertType::Humidity], None);
    }

    #[test]
    fn not_fireable_sensor_stays_registered() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(Sensor::new(SensorIdentity::local("A"), "Attic"));
        temperature_band(&h, "A");
        h.advertise("A", 30.0);

        let a = h.state("A");
        assert!(!a.fireable);
        assert_eq!(a.alerts[AlertType::Temperature], AlertState::Registered);
    }

    #[test]
    fn settings_change_recorrects_last_record() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.advertise("A", 20.0);
        assert_eq!(h.state("A").record.unwrap().temperature, Some(20.0));

        h.backend.sources.upsert_settings(SensorSettings {
            temperature_offset: Some(-1.5),
            ..SensorSettings::new(SensorIdentity::local("A"))
        });
        h.drain();
        assert_eq!(h.state("A").record.unwrap().temperature, Some(18.5));

        h.backend.sources.delete_settings(&SensorIdentity::local("A"));
        h.drain();
        assert_eq!(h.state("A").record.unwrap().temperature, Some(20.0));
    }

    #[test]
    fn calibration_can_push_value_into_alert() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        temperature_band(&h, "A");
        h.advertise("A", 24.0);
        assert_eq!(h.state("A").rollup, AlertState::Registered);

        h.backend.sources.upsert_settings(SensorSettings {
            temperature_offset: Some(2.0),
            ..SensorSettings::new(SensorIdentity::local("A"))
        });
        h.drain();
        assert_eq!(h.state("A").rollup, AlertState::Firing);
    }

    #[test]
    fn queued_events_for_removed_sensor_are_dropped() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.insert(tag("B", "Barn"));

        // Sample is queued but not merged before the removal.
        h.backend.sources.push_advertisement(
            "A",
            SensorRecord::new(h.now, RecordSource::Advertisement).with_temperature(40.0),
        );
        let outcome = h.apply(Update::Remove("A".into()));
        assert!(outcome.changed);
        assert!(!outcome.fleet_emptied);

        h.drain();
        assert_eq!(h.ids(), vec!["B"]);
        assert_eq!(h.backend.sources.active(SourceKind::Advertisement), 1);
    }

    #[test]
    fn stale_generation_is_rejected_after_cloud_mode_switch() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        let identity = SensorIdentity::local("L1").with_mac("M1");
        h.insert(Sensor::new(identity, "Kitchen").cloud());

        h.backend.sources.push_advertisement(
            "L1",
            SensorRecord::new(h.now, RecordSource::Advertisement).with_temperature(22.0),
        );
        h.apply(Update::SetCloudMode(true));
        h.drain();

        assert_eq!(h.state("M1").record, None);
        assert_eq!(
            h.pipeline.subscriptions().active_sources(&"M1".into()),
            vec![SourceKind::CloudRecord, SourceKind::Settings]
        );
    }

    #[test]
    fn cloud_record_makes_cloud_sensor_fireable() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(Sensor::new(SensorIdentity::cloud("M1"), "Greenhouse").cloud());
        temperature_band(&h, "M1");
        assert!(!h.state("M1").fireable);

        let record = SensorRecord::new(h.now, RecordSource::Cloud).with_temperature(35.0);
        h.backend.sources.push_cloud("M1", record);
        h.drain();

        let state = h.state("M1");
        assert!(state.fireable);
        assert!(state.cloud);
        assert_eq!(state.rollup, AlertState::Firing);
    }

    #[test]
    fn older_record_does_not_replace_newer() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.advertise("A", 21.0);

        let old = SensorRecord::new(h.now - Duration::minutes(5), RecordSource::Advertisement)
            .with_temperature(5.0);
        h.backend.sources.push_advertisement("A", old);
        h.drain();
        assert_eq!(h.state("A").record.unwrap().temperature, Some(21.0));
    }

    #[test]
    fn heartbeat_drives_connection_alert() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic").keep_connection());
        h.backend
            .alert_config
            .set_threshold(&"A".into(), ThresholdConfig::Connection);
        h.apply(Update::AlertConfigChanged(None));
        assert_eq!(h.state("A").alerts[AlertType::Connection], AlertState::Firing);

        h.backend.sources.push_heartbeat("A", HeartbeatEvent::Connected);
        h.drain();
        assert!(h.state("A").connected);
        assert_eq!(h.state("A").alerts[AlertType::Connection], AlertState::Registered);

        h.backend.sources.push_heartbeat("A", HeartbeatEvent::Disconnected);
        h.drain();
        assert_eq!(h.state("A").alerts[AlertType::Connection], AlertState::Firing);
    }

    #[test]
    fn one_state_per_identity_across_registry_events() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.insert(tag("B", "Barn"));
        h.insert(tag("A", "Attic renamed"));
        h.apply(Update::Registry(RegistryEvent::Update(tag("C", "Cabin"))));
        assert_eq!(h.pipeline.len(), 3);
        assert_eq!(h.state("A").name, "Attic renamed");

        h.apply(Update::Registry(RegistryEvent::Delete(tag("B", "Barn"))));
        h.apply(Update::Registry(RegistryEvent::Delete(tag("B", "Barn"))));
        assert_eq!(h.pipeline.len(), 2);

        let outcome = h.apply(Update::Registry(RegistryEvent::Initial(vec![
            tag("C", "Cabin"),
            tag("D", "Dock"),
        ])));
        assert!(outcome.changed);
        assert_eq!(h.ids(), vec!["C", "D"]);
        assert_eq!(h.pipeline.subscriptions().active_count(), 4);
    }

    #[test]
    fn removing_last_sensor_empties_fleet() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        let outcome = h.apply(Update::Remove("A".into()));
        assert!(outcome.fleet_emptied);
        assert!(h.pipeline.is_empty());
        assert_eq!(h.pipeline.subscriptions().active_count(), 0);
    }

    #[test]
    fn manual_order_prepends_new_sensors() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.insert(tag("B", "Barn"));
        let outcome = h.apply(Update::SetOrder(SortOrder::Manual(vec!["B".into(), "A".into()])));
        assert!(outcome.order_changed);
        assert_eq!(h.ids(), vec!["B", "A"]);

        let outcome = h.insert(tag("C", "Cabin"));
        assert!(outcome.order_changed);
        assert_eq!(h.ids(), vec!["C", "B", "A"]);

        let outcome = h.apply(Update::Remove("B".into()));
        assert!(outcome.order_changed);
        assert_eq!(
            h.pipeline.order(),
            &SortOrder::Manual(vec!["C".into(), "A".into()])
        );
    }

    #[test]
    fn rename_reorders_alphabetically() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        h.insert(tag("B", "Barn"));
        assert_eq!(h.ids(), vec!["A", "B"]);

        h.insert(tag("A", "zebra room"));
        assert_eq!(h.ids(), vec!["B", "A"]);
    }

    #[test]
    fn persisted_mute_is_restored_on_insert() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        let until = h.now + Duration::minutes(30);
        h.backend
            .alert_config
            .store_muted_until(AlertType::Pressure, &"A".into(), Some(until));
        h.insert(tag("A", "Attic"));
        assert_eq!(h.state("A").mutes[AlertType::Pressure], Some(until));
    }

    #[test]
    fn registry_error_leaves_states_untouched() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        let error = crate::error::SourceError::Registry("database locked".into());
        let outcome = h.apply(Update::Registry(RegistryEvent::Error(error)));
        assert_eq!(outcome, Outcome::default());
        assert_eq!(h.ids(), vec!["A"]);
    }

    #[test]
    fn mute_beyond_calendar_range_saturates() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(tag("A", "Attic"));
        temperature_band(&h, "A");
        h.advertise("A", 30.0);

        let outcome = h.apply(Update::Mute {
            sensor: "A".into(),
            alert_type: AlertType::Temperature,
            duration: Duration::MAX,
        });
        assert!(outcome.changed);
        let a = h.state("A");
        assert_eq!(a.alerts[AlertType::Temperature], AlertState::Registered);
        assert_eq!(a.mutes[AlertType::Temperature], Some(DateTime::<Utc>::MAX_UTC));

        let outcome = h.apply(Update::Mute {
            sensor: "A".into(),
            alert_type: AlertType::Humidity,
            duration: Duration::MIN,
        });
        assert_eq!(outcome, Outcome::default());
    }

    #[test]
    fn closed_heartbeat_clears_connection() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(Sensor::new(SensorIdentity::local("A"), "Attic").keep_connection());
        temperature_band(&h, "A");
        h.backend
            .sources
            .push_heartbeat("A", HeartbeatEvent::Connected);
        h.drain();
        assert!(h.state("A").fireable);

        let outcome = h.apply(Update::Registry(RegistryEvent::Update(Sensor::new(
            SensorIdentity::local("A"),
            "Attic",
        ))));
        assert!(outcome.changed);
        assert_eq!(h.backend.sources.active(SourceKind::Heartbeat), 0);

        h.advertise("A", 30.0);
        let a = h.state("A");
        assert!(!a.connected);
        assert!(!a.fireable);
        assert_eq!(a.alerts[AlertType::Temperature], AlertState::Registered);
    }

    #[test]
    fn cloud_mode_clears_connection_of_cloud_sensor() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        let both = SensorIdentity::local("L1").with_mac("M1");
        h.insert(Sensor::new(both, "Kitchen").cloud().keep_connection());
        h.backend
            .sources
            .push_heartbeat("L1", HeartbeatEvent::Connected);
        h.drain();
        assert!(h.state("M1").connected);

        let outcome = h.apply(Update::SetCloudMode(true));
        assert!(outcome.changed);
        assert!(!h.state("M1").connected);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "neither a local nor a cloud id"))]
    fn sensor_without_ids_is_refused() {
        let mut h = Harness::new(SortOrder::Alphabetical);
        h.insert(Sensor::new(SensorIdentity::default(), "Ghost"));
        assert!(h.pipeline.is_empty());
    }
}

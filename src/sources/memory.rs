//! In-process collaborators.
//!
//! `MemorySources` implements every stream contract on top of plain
//! observer tables: callers push samples and feed events, observers receive
//! them synchronously. Delivery holds the table lock, so a token cancelled on
//! another thread returns only after any in-flight delivery has finished and
//! the callback can never fire afterwards. Callbacks must not re-enter the
//! same source.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use super::{
    AdvertisementSource, AlertConfigStore, Callback, Clock, CloudRecordFeed, Collaborators,
    ErrorSink, HeartbeatEvent, HeartbeatSource, ObservationToken, OrderStore, RegistryEvent,
    RegistryFeed, SettingsEvent, SettingsFeed,
};
use crate::alert::{AlertType, ThresholdConfig};
use crate::error::SourceError;
use crate::models::{Sensor, SensorId, SensorIdentity, SensorRecord, SensorSettings};
use crate::ordering::SortOrder;
use crate::subscription::SourceKind;

// ---

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Observers<K, T> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, (K, Callback<T>)>>,
    opened: AtomicUsize,
    cancelled: AtomicUsize,
}

impl<K, T> Default for Observers<K, T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
            opened: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }
}

impl<K: Send + 'static, T: Clone + 'static> Observers<K, T> {
    // ---
    fn observe(self: &Arc<Self>, key: K, callback: Callback<T>) -> ObservationToken {
        // ---
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).insert(id, (key, callback));
        self.opened.fetch_add(1, Ordering::Relaxed);

        let observers = Arc::downgrade(self);
        ObservationToken::new(move || {
            if let Some(observers) = observers.upgrade() {
                if lock(&observers.entries).remove(&id).is_some() {
                    observers.cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }

    /// Deliver `value` to every observer whose key satisfies `wanted`.
    fn emit(&self, wanted: impl Fn(&K) -> bool, value: T) -> usize {
        // ---
        let entries = lock(&self.entries);
        let mut delivered = 0;
        for (key, callback) in entries.values() {
            if wanted(key) {
                callback(value.clone());
                delivered += 1;
            }
        }
        delivered
    }

    fn active(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Stream sources backed by memory.
#[derive(Default)]
pub struct MemorySources {
    // ---
    advertisements: Arc<Observers<String, Result<SensorRecord, SourceError>>>,
    heartbeats: Arc<Observers<String, Result<HeartbeatEvent, SourceError>>>,
    cloud: Arc<Observers<String, Result<Option<SensorRecord>, SourceError>>>,
    registry: Arc<Observers<(), RegistryEvent>>,
    settings: Arc<Observers<SensorIdentity, Result<SettingsEvent, SourceError>>>,

    sensors: Mutex<Vec<Sensor>>,
    stored_settings: Mutex<Vec<SensorSettings>>,
    latest_cloud: Mutex<HashMap<String, SensorRecord>>,
}

impl MemorySources {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry contents delivered as `Initial` to new registry observers.
    pub fn with_sensors(sensors: Vec<Sensor>) -> Self {
        let sources = Self::default();
        *lock(&sources.sensors) = sensors;
        sources
    }

    pub fn push_advertisement(&self, luid: &str, record: SensorRecord) -> usize {
        self.advertisements.emit(|key| key == luid, Ok(record))
    }

    pub fn push_heartbeat(&self, luid: &str, event: HeartbeatEvent) -> usize {
        self.heartbeats.emit(|key| key == luid, Ok(event))
    }

    pub fn push_cloud(&self, mac: &str, record: SensorRecord) -> usize {
        lock(&self.latest_cloud).insert(mac.to_string(), record.clone());
        self.cloud.emit(|key| key == mac, Ok(Some(record)))
    }

    /// Report `error` to every observer of the stream it belongs to.
    pub fn fail(&self, error: SourceError) -> usize {
        // ---
        match error {
            SourceError::Advertisement(_) => self.advertisements.emit(|_| true, Err(error)),
            SourceError::Heartbeat(_) => self.heartbeats.emit(|_| true, Err(error)),
            SourceError::Cloud(_) => self.cloud.emit(|_| true, Err(error)),
            SourceError::Settings(_) => self.settings.emit(|_| true, Err(error)),
            SourceError::Registry(_) => self.registry.emit(|_| true, RegistryEvent::Error(error)),
        }
    }

    pub fn insert_sensor(&self, sensor: Sensor) {
        lock(&self.sensors).push(sensor.clone());
        self.registry.emit(|_| true, RegistryEvent::Insert(sensor));
    }

    pub fn update_sensor(&self, sensor: Sensor) {
        // ---
        {
            let mut sensors = lock(&self.sensors);
            if let Some(existing) = sensors
                .iter_mut()
                .find(|s| s.identity.matches(&sensor.identity))
            {
                *existing = sensor.clone();
            }
        }
        self.registry.emit(|_| true, RegistryEvent::Update(sensor));
    }

    pub fn delete_sensor(&self, identity: &SensorIdentity) {
        // ---
        let removed = {
            let mut sensors = lock(&self.sensors);
            let position = sensors.iter().position(|s| s.identity.matches(identity));
            position.map(|i| sensors.remove(i))
        };
        if let Some(sensor) = removed {
            self.registry.emit(|_| true, RegistryEvent::Delete(sensor));
        }
    }

    /// Replace the whole registry and announce it as a fresh `Initial` list.
    pub fn reset_sensors(&self, sensors: Vec<Sensor>) {
        *lock(&self.sensors) = sensors.clone();
        self.registry.emit(|_| true, RegistryEvent::Initial(sensors));
    }

    pub fn upsert_settings(&self, settings: SensorSettings) {
        // ---
        let event = {
            let mut stored = lock(&self.stored_settings);
            match stored
                .iter_mut()
                .find(|s| s.identity.matches(&settings.identity))
            {
                Some(existing) => {
                    *existing = settings.clone();
                    SettingsEvent::Update(settings.clone())
                }
                None => {
                    stored.push(settings.clone());
                    SettingsEvent::Insert(settings.clone())
                }
            }
        };
        self.settings
            .emit(|key| key.matches(&settings.identity), Ok(event));
    }

    pub fn delete_settings(&self, identity: &SensorIdentity) {
        // ---
        let removed = {
            let mut stored = lock(&self.stored_settings);
            let position = stored.iter().position(|s| s.identity.matches(identity));
            position.map(|i| stored.remove(i))
        };
        if let Some(settings) = removed {
            self.settings
                .emit(|key| key.matches(identity), Ok(SettingsEvent::Delete(settings)));
        }
    }

    /// Live observations of one source kind.
    pub fn active(&self, kind: SourceKind) -> usize {
        match kind {
            SourceKind::Advertisement => self.advertisements.active(),
            SourceKind::Heartbeat => self.heartbeats.active(),
            SourceKind::CloudRecord => self.cloud.active(),
            SourceKind::Settings => self.settings.active(),
        }
    }

    /// Observations ever opened for one source kind.
    pub fn opened(&self, kind: SourceKind) -> usize {
        let counter = match kind {
            SourceKind::Advertisement => &self.advertisements.opened,
            SourceKind::Heartbeat => &self.heartbeats.opened,
            SourceKind::CloudRecord => &self.cloud.opened,
            SourceKind::Settings => &self.settings.opened,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Observations cancelled for one source kind.
    pub fn cancelled(&self, kind: SourceKind) -> usize {
        let counter = match kind {
            SourceKind::Advertisement => &self.advertisements.cancelled,
            SourceKind::Heartbeat => &self.heartbeats.cancelled,
            SourceKind::CloudRecord => &self.cloud.cancelled,
            SourceKind::Settings => &self.settings.cancelled,
        };
        counter.load(Ordering::Relaxed)
    }

    pub fn registry_observers(&self) -> usize {
        self.registry.active()
    }
}

impl AdvertisementSource for MemorySources {
    fn observe(
        &self,
        luid: &str,
        on_sample: Callback<Result<SensorRecord, SourceError>>,
    ) -> ObservationToken {
        self.advertisements.observe(luid.to_string(), on_sample)
    }
}

impl HeartbeatSource for MemorySources {
    fn observe(
        &self,
        luid: &str,
        on_event: Callback<Result<HeartbeatEvent, SourceError>>,
    ) -> ObservationToken {
        self.heartbeats.observe(luid.to_string(), on_event)
    }
}

impl CloudRecordFeed for MemorySources {
    fn observe_latest(
        &self,
        mac: &str,
        on_change: Callback<Result<Option<SensorRecord>, SourceError>>,
    ) -> ObservationToken {
        // ---
        let latest = lock(&self.latest_cloud).get(mac).cloned();
        let token = self.cloud.observe(mac.to_string(), Arc::clone(&on_change));
        on_change(Ok(latest));
        token
    }
}

impl RegistryFeed for MemorySources {
    fn observe(&self, on_change: Callback<RegistryEvent>) -> ObservationToken {
        // ---
        let initial = lock(&self.sensors).clone();
        let token = self.registry.observe((), Arc::clone(&on_change));
        on_change(RegistryEvent::Initial(initial));
        token
    }
}

impl SettingsFeed for MemorySources {
    fn observe(
        &self,
        identity: &SensorIdentity,
        on_change: Callback<Result<SettingsEvent, SourceError>>,
    ) -> ObservationToken {
        // ---
        let initial: Vec<SensorSettings> = lock(&self.stored_settings)
            .iter()
            .filter(|s| s.identity.matches(identity))
            .cloned()
            .collect();
        let token = self.settings.observe(identity.clone(), Arc::clone(&on_change));
        on_change(Ok(SettingsEvent::Initial(initial)));
        token
    }
}

/// Thresholds and mute expiries held in memory.
#[derive(Default)]
pub struct MemoryAlertConfig {
    thresholds: Mutex<HashMap<(SensorId, AlertType), ThresholdConfig>>,
    mutes: Mutex<HashMap<(SensorId, AlertType), DateTime<Utc>>>,
}

impl MemoryAlertConfig {
    // ---
    pub fn set_threshold(&self, sensor: &SensorId, config: ThresholdConfig) {
        lock(&self.thresholds).insert((sensor.clone(), config.alert_type()), config);
    }
}

impl AlertConfigStore for MemoryAlertConfig {
    // ---
    fn thresholds(&self, sensor: &SensorId, alert_type: AlertType) -> Option<ThresholdConfig> {
        lock(&self.thresholds)
            .get(&(sensor.clone(), alert_type))
            .cloned()
    }

    fn muted_until(&self, alert_type: AlertType, sensor: &SensorId) -> Option<DateTime<Utc>> {
        lock(&self.mutes).get(&(sensor.clone(), alert_type)).copied()
    }

    fn store_muted_until(
        &self,
        alert_type: AlertType,
        sensor: &SensorId,
        until: Option<DateTime<Utc>>,
    ) {
        let key = (sensor.clone(), alert_type);
        match until {
            Some(until) => lock(&self.mutes).insert(key, until),
            None => lock(&self.mutes).remove(&key),
        };
    }
}

/// Keeps every reported error for later inspection.
#[derive(Default)]
pub struct MemoryErrorSink {
    reported: Mutex<Vec<SourceError>>,
}

impl MemoryErrorSink {
    pub fn reported(&self) -> Vec<SourceError> {
        lock(&self.reported).clone()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, error: &SourceError) {
        lock(&self.reported).push(error.clone());
    }
}

#[derive(Default)]
pub struct MemoryOrderStore {
    order: Mutex<SortOrder>,
}

impl MemoryOrderStore {
    pub fn new(order: SortOrder) -> Self {
        Self {
            order: Mutex::new(order),
        }
    }
}

impl OrderStore for MemoryOrderStore {
    fn load(&self) -> SortOrder {
        lock(&self.order).clone()
    }

    fn save(&self, order: &SortOrder) {
        *lock(&self.order) = order.clone();
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    // ---
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Every in-memory collaborator, wired together.
#[derive(Default, Clone)]
pub struct MemoryBackend {
    // ---
    pub sources: Arc<MemorySources>,
    pub alert_config: Arc<MemoryAlertConfig>,
    pub errors: Arc<MemoryErrorSink>,
    pub order: Arc<MemoryOrderStore>,
}

impl MemoryBackend {
    // ---
    pub fn new(order: SortOrder) -> Self {
        Self {
            order: Arc::new(MemoryOrderStore::new(order)),
            ..Default::default()
        }
    }

    pub fn collaborators(&self, clock: Arc<dyn Clock>) -> Collaborators {
        Collaborators {
            advertisements: self.sources.clone(),
            heartbeats: self.sources.clone(),
            cloud: self.sources.clone(),
            registry: self.sources.clone(),
            settings: self.sources.clone(),
            alert_config: self.alert_config.clone(),
            errors: self.errors.clone(),
            order_store: self.order.clone(),
            clock,
        }
    }
}

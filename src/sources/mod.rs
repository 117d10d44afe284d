//! Contracts of the external collaborators feeding the engine.
//!
//! Radio scanning, cloud transport and storage live elsewhere; the engine
//! only sees these traits. Every `observe` registers a callback and returns
//! immediately with an [`ObservationToken`]. Cancelling the token must be
//! synchronous: once `cancel` returns, the callback never fires again.
//!
//! [`memory`] holds in-process implementations used by the HTTP bridge and
//! the tests.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::alert::{AlertType, ThresholdConfig};
use crate::error::SourceError;
use crate::models::{Sensor, SensorId, SensorIdentity, SensorRecord, SensorSettings};
use crate::ordering::SortOrder;

pub mod memory;

// ---

pub type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Handle to a live registration. Cancels on drop.
pub struct ObservationToken {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ObservationToken {
    // ---
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop delivery. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for ObservationToken {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ObservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Events on a held Bluetooth connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    Connected,
    Disconnected,
    Sample(SensorRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Initial(Vec<Sensor>),
    Insert(Sensor),
    Update(Sensor),
    Delete(Sensor),
    Error(SourceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsEvent {
    Initial(Vec<SensorSettings>),
    Insert(SensorSettings),
    Update(SensorSettings),
    Delete(SensorSettings),
}

pub trait AdvertisementSource: Send + Sync {
    fn observe(
        &self,
        luid: &str,
        on_sample: Callback<Result<SensorRecord, SourceError>>,
    ) -> ObservationToken;
}

pub trait HeartbeatSource: Send + Sync {
    fn observe(
        &self,
        luid: &str,
        on_event: Callback<Result<HeartbeatEvent, SourceError>>,
    ) -> ObservationToken;
}

pub trait CloudRecordFeed: Send + Sync {
    fn observe_latest(
        &self,
        mac: &str,
        on_change: Callback<Result<Option<SensorRecord>, SourceError>>,
    ) -> ObservationToken;
}

pub trait RegistryFeed: Send + Sync {
    fn observe(&self, on_change: Callback<RegistryEvent>) -> ObservationToken;
}

pub trait SettingsFeed: Send + Sync {
    fn observe(
        &self,
        identity: &SensorIdentity,
        on_change: Callback<Result<SettingsEvent, SourceError>>,
    ) -> ObservationToken;
}

pub trait AlertConfigStore: Send + Sync {
    // ---
    fn thresholds(&self, sensor: &SensorId, alert_type: AlertType) -> Option<ThresholdConfig>;

    fn muted_until(&self, alert_type: AlertType, sensor: &SensorId) -> Option<DateTime<Utc>>;

    /// Persist a mute expiry; `None` clears it.
    fn store_muted_until(
        &self,
        _alert_type: AlertType,
        _sensor: &SensorId,
        _until: Option<DateTime<Utc>>,
    ) {
    }
}

/// Fire-and-forget sink for source failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &SourceError);
}

/// Persistence of the display order.
pub trait OrderStore: Send + Sync {
    fn load(&self) -> SortOrder;
    fn save(&self, order: &SortOrder);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Every collaborator the engine needs, bundled for [`crate::Engine::start`].
#[derive(Clone)]
pub struct Collaborators {
    // ---
    pub advertisements: Arc<dyn AdvertisementSource>,
    pub heartbeats: Arc<dyn HeartbeatSource>,
    pub cloud: Arc<dyn CloudRecordFeed>,
    pub registry: Arc<dyn RegistryFeed>,
    pub settings: Arc<dyn SettingsFeed>,
    pub alert_config: Arc<dyn AlertConfigStore>,
    pub errors: Arc<dyn ErrorSink>,
    pub order_store: Arc<dyn OrderStore>,
    pub clock: Arc<dyn Clock>,
}

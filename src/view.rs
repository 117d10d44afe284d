//! View-State Store types: the per-sensor aggregate handed to the UI layer
//! and the listener table that pushes every committed snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alert::{AlertState, PerAlert};
use crate::models::{SensorId, SensorIdentity, SensorRecord};
use crate::sources::ObservationToken;

// ---

/// The UI-facing aggregate for one sensor. Readers only ever get copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorViewState {
    // ---
    pub id: SensorId,
    pub identity: SensorIdentity,
    pub name: String,

    /// Latest record with calibration applied.
    pub record: Option<SensorRecord>,

    pub alerts: PerAlert<AlertState>,
    pub mutes: PerAlert<Option<DateTime<Utc>>>,

    /// Most severe of `alerts`.
    pub rollup: AlertState,

    pub connected: bool,
    pub cloud: bool,
    pub fireable: bool,

    #[serde(skip)]
    pub seq: u64,
}

impl SensorViewState {
    /// A freshly registered sensor: no record, every alert empty.
    pub fn new(
        id: SensorId,
        identity: SensorIdentity,
        name: String,
        cloud: bool,
        seq: u64,
    ) -> Self {
        Self {
            id,
            identity,
            name,
            record: None,
            alerts: PerAlert::default(),
            mutes: PerAlert::default(),
            rollup: AlertState::Empty,
            connected: false,
            cloud,
            fireable: false,
            seq,
        }
    }
}

pub type Snapshot = Arc<[SensorViewState]>;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callbacks notified on the pipeline task.
///
/// Listeners are invoked outside the table lock, so a callback may drop its
/// own token.
pub struct Listeners<T: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Listener<T>>>,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: ?Sized + 'static> Listeners<T> {
    // ---
    pub fn add(self: &Arc<Self>, listener: Listener<T>) -> ObservationToken {
        // ---
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);

        let listeners = Arc::downgrade(self);
        ObservationToken::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners
                    .entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }

    pub fn notify(&self, value: &T) {
        // ---
        let listeners: Vec<Listener<T>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! The engine: owns the pipeline task, the mute sweep timer and the registry
//! observation, and exposes snapshots and commands to the UI layer.
//!
//! Producers (source callbacks, the registry feed, the timer and commands)
//! send into one unbounded queue; a single task drains it into the
//! [`Pipeline`]. After each committed merge the ordered snapshot is published
//! on a `watch` channel and pushed to listeners. Commands resolve only after
//! the pipeline has applied them, so e.g. once `remove_sensor` returns no
//! later snapshot contains the sensor.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::AlertType;
use crate::error::{EngineError, Result};
use crate::models::{Sensor, SensorId};
use crate::ordering::SortOrder;
use crate::pipeline::{Pipeline, Update};
use crate::sources::{
    Clock, Collaborators, ErrorSink, ObservationToken, OrderStore, RegistryEvent, RegistryFeed,
};
use crate::subscription::{Sources, SubscriptionManager};
use crate::view::{Listeners, SensorViewState, Snapshot};

// ---

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the mute window sweep.
    pub mute_sweep_interval: Duration,
    /// Skip radio subscriptions for cloud sensors.
    pub cloud_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mute_sweep_interval: Duration::from_secs(5),
            cloud_mode: false,
        }
    }
}

enum Inbound {
    Update(Update),
    Command(Update, oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct Engine {
    // ---
    tx: mpsc::UnboundedSender<Inbound>,
    snapshots: watch::Receiver<Snapshot>,
    snapshot_listeners: Arc<Listeners<[SensorViewState]>>,
    emptied_listeners: Arc<Listeners<()>>,
    registry_token: Mutex<Option<ObservationToken>>,
    pipeline_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl Engine {
    /// Start the engine on the current tokio runtime.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Self {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();

        let deliver_tx = tx.clone();
        let subscriptions = SubscriptionManager::new(
            Sources {
                advertisements: collaborators.advertisements.clone(),
                heartbeats: collaborators.heartbeats.clone(),
                cloud: collaborators.cloud.clone(),
                settings: collaborators.settings.clone(),
            },
            collaborators.errors.clone(),
            Arc::new(move |delivery| {
                let _ = deliver_tx.send(Inbound::Update(Update::Delivery(delivery)));
            }),
        );

        let pipeline = Pipeline::new(
            subscriptions,
            collaborators.alert_config.clone(),
            collaborators.order_store.load(),
            config.cloud_mode,
        );

        let (snapshot_tx, snapshots) = watch::channel(Snapshot::from(Vec::new()));
        let snapshot_listeners: Arc<Listeners<[SensorViewState]>> = Arc::default();
        let emptied_listeners: Arc<Listeners<()>> = Arc::default();

        // Registry errors are source-level; they go straight to the sink.
        let registry_tx = tx.clone();
        let errors = collaborators.errors.clone();
        let registry_token = collaborators.registry.observe(Arc::new(move |event| {
            if let RegistryEvent::Error(error) = &event {
                warn!("Registry feed reported an error: {}", error);
                errors.report(error);
                return;
            }
            let _ = registry_tx.send(Inbound::Update(Update::Registry(event)));
        }));

        let pipeline_task = tokio::spawn(run_pipeline(
            pipeline,
            rx,
            snapshot_tx,
            Arc::clone(&snapshot_listeners),
            Arc::clone(&emptied_listeners),
            collaborators.order_store.clone(),
            collaborators.clock.clone(),
        ));
        let sweep_task = tokio::spawn(run_sweep(tx.clone(), config.mute_sweep_interval));

        info!(
            "Engine started (sweep every {:?}, cloud mode {})",
            config.mute_sweep_interval, config.cloud_mode
        );

        Self {
            tx,
            snapshots,
            snapshot_listeners,
            emptied_listeners,
            registry_token: Mutex::new(Some(registry_token)),
            pipeline_task,
            sweep_task,
        }
    }

    /// The latest committed snapshot, in display order.
    pub fn current_states(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that wakes on every committed snapshot.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Call `listener` with every committed snapshot until the token is
    /// dropped or cancelled.
    pub fn subscribe(
        &self,
        listener: impl Fn(&[SensorViewState]) + Send + Sync + 'static,
    ) -> ObservationToken {
        self.snapshot_listeners.add(Arc::new(listener))
    }

    /// Call `listener` whenever the last sensor is removed.
    pub fn on_fleet_emptied(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> ObservationToken {
        self.emptied_listeners.add(Arc::new(move |_: &()| listener()))
    }

    pub async fn add_sensor(&self, sensor: Sensor) -> Result<()> {
        if !sensor.identity.is_valid() {
            return Err(EngineError::InvalidIdentity);
        }
        self.command(Update::Registry(RegistryEvent::Insert(sensor))).await
    }

    pub async fn update_sensor(&self, sensor: Sensor) -> Result<()> {
        if !sensor.identity.is_valid() {
            return Err(EngineError::InvalidIdentity);
        }
        self.command(Update::Registry(RegistryEvent::Update(sensor))).await
    }

    pub async fn remove_sensor(&self, id: &SensorId) -> Result<()> {
        self.command(Update::Remove(id.clone())).await
    }

    /// Suppress `alert_type` on `sensor` for `duration`.
    pub async fn set_mute(
        &self,
        sensor: &SensorId,
        alert_type: AlertType,
        duration: TimeDelta,
    ) -> Result<()> {
        self.command(Update::Mute {
            sensor: sensor.clone(),
            alert_type,
            duration,
        })
        .await
    }

    pub async fn clear_mute(&self, sensor: &SensorId, alert_type: AlertType) -> Result<()> {
        self.command(Update::Unmute {
            sensor: sensor.clone(),
            alert_type,
        })
        .await
    }

    pub async fn set_order(&self, order: SortOrder) -> Result<()> {
        self.command(Update::SetOrder(order)).await
    }

    pub async fn set_cloud_mode(&self, enabled: bool) -> Result<()> {
        self.command(Update::SetCloudMode(enabled)).await
    }

    /// Thresholds changed in the alert-config store; `None` means all sensors.
    pub async fn alert_config_changed(&self, sensor: Option<SensorId>) -> Result<()> {
        self.command(Update::AlertConfigChanged(sensor)).await
    }

    pub async fn set_connected(&self, sensor: &SensorId, connected: bool) -> Result<()> {
        self.command(Update::Connectivity {
            sensor: sensor.clone(),
            connected,
        })
        .await
    }

    /// Resolves once every update queued before the call has been merged.
    pub async fn settle(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Inbound::Barrier(ack))
            .map_err(|_| EngineError::Closed)?;
        done.await.map_err(|_| EngineError::Closed)
    }

    /// Stop the timer, release the registry observation and every live
    /// subscription, and end the pipeline task.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        self.sweep_task.abort();
        if let Some(mut token) = self
            .registry_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }

        let (ack, done) = oneshot::channel();
        self.tx
            .send(Inbound::Shutdown(ack))
            .map_err(|_| EngineError::Closed)?;
        done.await.map_err(|_| EngineError::Closed)?;
        info!("Engine shut down");
        Ok(())
    }

    async fn command(&self, update: Update) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Inbound::Command(update, ack))
            .map_err(|_| EngineError::Closed)?;
        done.await.map_err(|_| EngineError::Closed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Subscription callbacks hold queue senders, so the pipeline task
        // would otherwise never see the channel close.
        self.sweep_task.abort();
        self.pipeline_task.abort();
    }
}

async fn run_pipeline(
    mut pipeline: Pipeline,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    snapshot_tx: watch::Sender<Snapshot>,
    snapshot_listeners: Arc<Listeners<[SensorViewState]>>,
    emptied_listeners: Arc<Listeners<()>>,
    order_store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
) {
    // ---
    let commit = |pipeline: &mut Pipeline, update: Update| {
        let outcome = pipeline.apply(update, clock.now());
        if outcome.order_changed {
            order_store.save(pipeline.order());
        }
        if outcome.changed {
            let snapshot: Snapshot = pipeline.snapshot().into();
            snapshot_tx.send_replace(Arc::clone(&snapshot));
            snapshot_listeners.notify(&snapshot);
        }
        if outcome.fleet_emptied {
            debug!("Fleet is empty");
            emptied_listeners.notify(&());
        }
    };

    while let Some(inbound) = rx.recv().await {
        match inbound {
            Inbound::Update(update) => commit(&mut pipeline, update),
            Inbound::Command(update, ack) => {
                commit(&mut pipeline, update);
                let _ = ack.send(());
            }
            Inbound::Barrier(ack) => {
                let _ = ack.send(());
            }
            Inbound::Shutdown(ack) => {
                pipeline.shutdown();
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn run_sweep(tx: mpsc::UnboundedSender<Inbound>, period: Duration) {
    // ---
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if tx.send(Inbound::Update(Update::Sweep)).is_err() {
            break;
        }
    }
}

//! Live state aggregation and alert engine for a fleet of environmental
//! sensor tags.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! directory module is a gateway that re-exports what its siblings offer, and
//! this crate root re-exports the types a UI layer needs.

pub mod alert;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod ordering;
pub mod pipeline;
pub mod registry;
pub mod routes;
pub mod sources;
pub mod subscription;
pub mod view;

pub use alert::{AlertState, AlertType, PerAlert, ThresholdConfig};
pub use config::Config;
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, SourceError};
pub use models::{RecordSource, Sensor, SensorId, SensorIdentity, SensorRecord, SensorSettings};
pub use ordering::SortOrder;
pub use sources::{Collaborators, ObservationToken};
pub use view::{SensorViewState, Snapshot};

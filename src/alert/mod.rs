//! Alert evaluation and mute tracking.
//!
//! Gateway module (EMBP): siblings stay private, the rest of the crate only
//! sees what is re-exported here.

mod evaluator;
mod mute;
mod types;

pub use evaluator::{evaluate, rollup, AlertContext, ThresholdConfig};
pub use mute::MuteWindows;
pub use types::{AlertState, AlertType, PerAlert};

//! Error types for the engine and its collaborators.

use thiserror::Error;

/// Failure reported by an external source.
///
/// Source-level, not sensor-specific: these go to the `ErrorSink` and never
/// into the merge path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("Bluetooth scanning failed: {0}")]
    Advertisement(String),

    #[error("Bluetooth connection failed: {0}")]
    Heartbeat(String),

    #[error("Cloud record feed failed: {0}")]
    Cloud(String),

    #[error("Settings feed failed: {0}")]
    Settings(String),

    #[error("Sensor registry feed failed: {0}")]
    Registry(String),
}

/// Errors returned by engine commands.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine is shut down")]
    Closed,

    #[error("Sensor identity has neither a local nor a cloud id")]
    InvalidIdentity,
}

pub type Result<T> = std::result::Result<T, EngineError>;

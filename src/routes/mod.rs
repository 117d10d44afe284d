//! HTTP bridge gateway (EMBP).
//!
//! Sibling modules each export a subrouter; this gateway merges them and
//! attaches the shared [`AppState`], so `main.rs` only sees [`router`].

use std::sync::Arc;

use axum::Router;

use crate::engine::Engine;
use crate::sources::memory::MemoryBackend;

mod health;
mod sensors;

// ---

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// In-memory sources the bridge feeds registry changes and samples into.
    pub backend: MemoryBackend,
}

pub fn router(engine: Arc<Engine>, backend: MemoryBackend) -> Router {
    // ---
    Router::new()
        .merge(sensors::router())
        .merge(health::router())
        .with_state(AppState { engine, backend })
}

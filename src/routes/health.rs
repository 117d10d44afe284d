// src/routes/health.rs
//! Liveness endpoint for the tagwatch HTTP bridge.
//!
//! Sibling module in `routes` following EMBP: the handler stays private and
//! the gateway merges the exported subrouter.

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Handle `GET /health`. Does not touch the engine.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Generic over the state so it merges with any gateway router.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}

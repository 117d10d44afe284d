// src/routes/sensors.rs
//! Sensor endpoints: read the ordered view-state snapshot and drive the
//! engine from a UI.
//!
//! Registry changes and samples go through the in-memory sources so the
//! engine sees them exactly as it would see a real registry or radio. Each
//! handler settles the engine before answering, so the response reflects
//! the committed state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::AppState;
use crate::alert::{AlertType, ThresholdConfig};
use crate::error::EngineError;
use crate::models::{RecordSource, Sensor, SensorId, SensorIdentity, SensorRecord};
use crate::ordering::SortOrder;
use crate::view::SensorViewState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sensors", get(list).post(add))
        .route("/sensors/{id}", delete(remove))
        .route("/sensors/{id}/mute", post(mute))
        .route("/sensors/{id}/thresholds", put(set_threshold))
        .route("/sensors/{id}/records", post(push_record))
        .route("/order", put(set_order))
}

/// Body of `POST /sensors`.
#[derive(Debug, Deserialize)]
pub struct NewSensor {
    luid: Option<String>,
    mac: Option<String>,
    name: String,
    #[serde(default)]
    cloud: bool,
    #[serde(default)]
    keep_connection: bool,
    service_uuid: Option<String>,
}

impl NewSensor {
    fn into_sensor(self) -> Sensor {
        let identity = SensorIdentity {
            luid: self.luid,
            mac: self.mac,
        };
        let mut sensor = Sensor::new(identity, self.name);
        sensor.is_cloud = self.cloud;
        sensor.keep_connection = self.keep_connection;
        sensor.service_uuid = self.service_uuid;
        sensor
    }
}

/// Body of `POST /sensors/{id}/mute`. Zero minutes clears the mute.
#[derive(Debug, Deserialize)]
pub struct MuteRequest {
    alert_type: AlertType,
    minutes: u32,
}

/// Body of `PUT /sensors/{id}/thresholds`.
#[derive(Debug, Deserialize)]
#[serde(tag = "alert_type", rename_all = "snake_case")]
pub enum ThresholdRequest {
    Temperature { lower: f64, upper: f64 },
    Humidity { lower: f64, upper: f64 },
    Pressure { lower: f64, upper: f64 },
    Signal { lower: i32 },
    Connection,
    Movement { baseline: u32, sensitivity: u32 },
    CloudConnection { unseen_minutes: u32 },
}

impl From<ThresholdRequest> for ThresholdConfig {
    fn from(request: ThresholdRequest) -> Self {
        match request {
            ThresholdRequest::Temperature { lower, upper } => {
                ThresholdConfig::Temperature { lower, upper }
            }
            ThresholdRequest::Humidity { lower, upper } => {
                ThresholdConfig::Humidity { lower, upper }
            }
            ThresholdRequest::Pressure { lower, upper } => {
                ThresholdConfig::Pressure { lower, upper }
            }
            ThresholdRequest::Signal { lower } => ThresholdConfig::Signal { lower },
            ThresholdRequest::Connection => ThresholdConfig::Connection,
            ThresholdRequest::Movement {
                baseline,
                sensitivity,
            } => ThresholdConfig::Movement {
                baseline,
                sensitivity,
            },
            ThresholdRequest::CloudConnection { unseen_minutes } => {
                ThresholdConfig::CloudConnection {
                    unseen: TimeDelta::minutes(i64::from(unseen_minutes)),
                }
            }
        }
    }
}

/// Body of `POST /sensors/{id}/records`. Missing `date` means now.
#[derive(Debug, Deserialize)]
pub struct NewRecord {
    date: Option<DateTime<Utc>>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    movement_counter: Option<u32>,
    rssi: Option<i32>,
}

#[derive(Debug, Serialize)]
struct Delivered {
    delivered: usize,
}

async fn list(State(state): State<AppState>) -> Json<Vec<SensorViewState>> {
    // ---
    let states = state.engine.current_states();
    debug!("GET /sensors - {} sensors", states.len());
    Json(states.to_vec())
}

async fn add(State(state): State<AppState>, Json(body): Json<NewSensor>) -> Response {
    // ---
    let sensor = body.into_sensor();
    if !sensor.identity.is_valid() {
        return bad_request(EngineError::InvalidIdentity);
    }

    let identity = sensor.identity.clone();
    let existing = find_by_identity(&state, &identity).is_some();
    if existing {
        state.backend.sources.update_sensor(sensor);
    } else {
        state.backend.sources.insert_sensor(sensor);
    }
    if let Err(e) = state.engine.settle().await {
        return unavailable(e);
    }

    let (status, verb) = if existing {
        (StatusCode::OK, "updated")
    } else {
        (StatusCode::CREATED, "added")
    };
    info!("POST /sensors - {} {}", verb, identity_label(&identity));
    match find_by_identity(&state, &identity) {
        Some(view) => (status, Json(view)).into_response(),
        None => status.into_response(),
    }
}

async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    // ---
    let id = SensorId(id);
    let Some(view) = find(&state, &id) else {
        return not_found(&id);
    };

    state.backend.sources.delete_sensor(&view.identity);
    if let Err(e) = state.engine.remove_sensor(&id).await {
        return unavailable(e);
    }
    info!("DELETE /sensors/{} - removed", id);
    StatusCode::NO_CONTENT.into_response()
}

async fn mute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MuteRequest>,
) -> Response {
    // ---
    let id = SensorId(id);
    if find(&state, &id).is_none() {
        return not_found(&id);
    }

    let result = if body.minutes == 0 {
        state.engine.clear_mute(&id, body.alert_type).await
    } else {
        let duration = TimeDelta::minutes(i64::from(body.minutes));
        state.engine.set_mute(&id, body.alert_type, duration).await
    };
    if let Err(e) = result {
        return unavailable(e);
    }

    debug!(
        "POST /sensors/{}/mute - {} for {} minutes",
        id,
        body.alert_type.as_str(),
        body.minutes
    );
    respond_with_state(&state, &id)
}

async fn set_threshold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ThresholdRequest>,
) -> Response {
    // ---
    let id = SensorId(id);
    if find(&state, &id).is_none() {
        return not_found(&id);
    }

    let config = ThresholdConfig::from(body);
    debug!("PUT /sensors/{}/thresholds - {:?}", id, config);
    state.backend.alert_config.set_threshold(&id, config);
    if let Err(e) = state.engine.alert_config_changed(Some(id.clone())).await {
        return unavailable(e);
    }
    respond_with_state(&state, &id)
}

async fn push_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<NewRecord>,
) -> Response {
    // ---
    let id = SensorId(id);
    let Some(view) = find(&state, &id) else {
        return not_found(&id);
    };

    let date = body.date.unwrap_or_else(Utc::now);
    let (source, delivered) = match (&view.identity.luid, &view.identity.mac) {
        (Some(luid), _) => {
            let record = record_from(&body, date, RecordSource::Advertisement);
            (RecordSource::Advertisement, state.backend.sources.push_advertisement(luid, record))
        }
        (None, Some(mac)) => {
            let record = record_from(&body, date, RecordSource::Cloud);
            (RecordSource::Cloud, state.backend.sources.push_cloud(mac, record))
        }
        (None, None) => return bad_request(EngineError::InvalidIdentity),
    };
    if let Err(e) = state.engine.settle().await {
        return unavailable(e);
    }

    debug!(
        "POST /sensors/{}/records - {:?} record reached {} observers",
        id, source, delivered
    );
    (StatusCode::ACCEPTED, Json(Delivered { delivered })).into_response()
}

async fn set_order(State(state): State<AppState>, Json(order): Json<SortOrder>) -> Response {
    // ---
    if let Err(e) = state.engine.set_order(order).await {
        return unavailable(e);
    }
    info!("PUT /order - order updated");
    StatusCode::NO_CONTENT.into_response()
}

// ---

fn record_from(body: &NewRecord, date: DateTime<Utc>, source: RecordSource) -> SensorRecord {
    SensorRecord {
        temperature: body.temperature,
        humidity: body.humidity,
        pressure: body.pressure,
        movement_counter: body.movement_counter,
        rssi: body.rssi,
        ..SensorRecord::new(date, source)
    }
}

fn find(state: &AppState, id: &SensorId) -> Option<SensorViewState> {
    state
        .engine
        .current_states()
        .iter()
        .find(|view| &view.id == id)
        .cloned()
}

fn find_by_identity(state: &AppState, identity: &SensorIdentity) -> Option<SensorViewState> {
    state
        .engine
        .current_states()
        .iter()
        .find(|view| view.identity.matches(identity))
        .cloned()
}

fn identity_label(identity: &SensorIdentity) -> String {
    identity
        .sensor_id()
        .map(|id| id.to_string())
        .unwrap_or_default()
}

fn respond_with_state(state: &AppState, id: &SensorId) -> Response {
    match find(state, id) {
        Some(view) => (StatusCode::OK, Json(view)).into_response(),
        None => not_found(id),
    }
}

fn not_found(id: &SensorId) -> Response {
    debug!("Unknown sensor {}", id);
    (StatusCode::NOT_FOUND, Json(format!("Unknown sensor {}", id))).into_response()
}

fn bad_request(e: EngineError) -> Response {
    debug!("Rejected request: {}", e);
    (StatusCode::BAD_REQUEST, Json(e.to_string())).into_response()
}

fn unavailable(e: EngineError) -> Response {
    error!("Engine unavailable: {}", e);
    (StatusCode::SERVICE_UNAVAILABLE, Json(e.to_string())).into_response()
}

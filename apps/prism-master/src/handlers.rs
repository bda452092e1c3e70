//! HTTP surface of the master.
//!
//! Responses are structured JSON (or raw JPEG on render success). A
//! missing session is a normal response variant, never an HTTP error; 500
//! is reserved for store unavailability and internal failures.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use prism_store::Store;

use crate::aggregate::aggregate_jpegs;
use crate::dispatch::{Dispatcher, RenderOutcome};

const MAX_PARALLEL: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Deserialize)]
pub struct NewSessionRequest {
    #[serde(rename = "InputJson")]
    pub input_json: String,
}

#[derive(Debug, Serialize)]
pub struct NewSessionResponse {
    #[serde(rename = "SessionId")]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "Status")]
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ResourceResponse {
    #[serde(rename = "Status")]
    pub status: &'static str,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hash")]
    pub hash: String,
    #[serde(rename = "Size")]
    pub size: usize,
}

#[derive(Debug, Serialize)]
pub struct LinkErrorResponse {
    #[serde(rename = "Status")]
    pub status: &'static str,
    #[serde(rename = "Log")]
    pub log: String,
}

#[derive(Debug, Deserialize)]
pub struct RenderQuery {
    /// Parsed leniently: anything non-numeric falls back to one sample.
    pub parallel: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

fn session_does_not_exist() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "SessionDoesNotExist",
    })
}

/// POST /sessions - create a session around a scene reference.
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<NewSessionRequest>,
) -> Result<Json<NewSessionResponse>, StatusCode> {
    match state.store.create_session(&payload.input_json).await {
        Ok(session_id) => {
            debug!(session = %session_id, "session created");
            Ok(Json(NewSessionResponse { session_id }))
        }
        Err(err) => {
            error!(%err, "failed to create session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /sessions/{id} - delete a session, releasing its resources.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, StatusCode> {
    match state.store.session_exists(&session_id).await {
        Ok(true) => {}
        Ok(false) => return Ok(session_does_not_exist()),
        Err(err) => {
            error!(%err, "failed to check session existence");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    match state.store.delete_session(&session_id).await {
        Ok(()) => {
            debug!(session = %session_id, "session deleted");
            Ok(Json(StatusResponse { status: "Ok" }))
        }
        Err(err) => {
            error!(session = %session_id, %err, "failed to delete session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /sessions/{id}/resources/{name} - bind raw bytes under a name.
pub async fn put_resource(
    State(state): State<AppState>,
    Path((session_id, name)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ResourceResponse>, StatusCode> {
    match state.store.session_exists(&session_id).await {
        Ok(true) => {}
        Ok(false) => {
            return Ok(Json(ResourceResponse {
                status: "SessionDoesNotExist",
                name: String::new(),
                hash: String::new(),
                size: 0,
            }))
        }
        Err(err) => {
            error!(%err, "failed to check session existence");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    debug!(session = %session_id, %name, size = body.len(), "binding resource");

    match state.store.bind_resource(&session_id, &name, &body).await {
        Ok(bound) => Ok(Json(ResourceResponse {
            status: "Ok",
            name,
            hash: bound.hash,
            size: bound.size,
        })),
        Err(err) => {
            error!(session = %session_id, %name, %err, "failed to bind resource");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /sessions/{id}/renders?parallel=N - render and block until the
/// averaged image (or the first link error) is ready.
pub async fn render(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RenderQuery>,
) -> Response {
    let samples = query
        .parallel
        .as_deref()
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_PARALLEL);

    match state.store.session_exists(&session_id).await {
        Ok(true) => {}
        Ok(false) => return session_does_not_exist().into_response(),
        Err(err) => {
            error!(%err, "failed to check session existence");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    debug!(session = %session_id, samples, "render request");

    let outcome = match state.dispatcher.render(&session_id, samples).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(session = %session_id, %err, "render failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match outcome {
        RenderOutcome::LinkError(log) => Json(LinkErrorResponse {
            status: "LinkError",
            log,
        })
        .into_response(),
        RenderOutcome::Images(images) => match aggregate_jpegs(&images) {
            Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
            Err(err) => {
                error!(session = %session_id, %err, "sample aggregation failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::body::parse_request;
use crate::api::routes::request_meta;
use crate::api::state::AppState;
use crate::api::{error_response, ApiError};
use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;
use crate::ingest::{self, IngestOutcome};

#[derive(Debug, Deserialize)]
struct LogRequest {
    node_key: Option<String>,
    #[serde(default)]
    data: Vec<Value>,
    log_type: Option<String>,
}

/// POST /log — long-running relative to the polling endpoints; runs
/// on its own connection outside any wider transaction scope.
pub async fn log(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: LogRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let db = state.open_db().map_err(error_response)?;
    let node_key = request
        .node_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| NodeGateError::BadRequest("missing node_key".to_string()))
        .map_err(error_response)?;
    let machine = EnrolledMachine::authenticate(&db, node_key).map_err(error_response)?;
    state
        .events
        .post_request(&machine.serial_number, &meta, "log");

    let outcome = ingest::ingest(
        &db,
        &machine,
        request.log_type.as_deref().unwrap_or(""),
        request.data,
        &meta,
        state.events.as_ref(),
        state.inventory.as_ref(),
    )
    .map_err(error_response)?;

    // An identity conflict is a soft flag, not an HTTP failure; the
    // agent reacts by re-enrolling.
    match outcome {
        IngestOutcome::Ok => Ok(Json(json!({}))),
        IngestOutcome::NodeInvalid => Ok(Json(json!({ "node_invalid": true }))),
    }
}

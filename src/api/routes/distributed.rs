use std::collections::HashMap;
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
use crate::collector;
use crate::enrollments::{EnrolledMachine, MachineTags};
use crate::error::NodeGateError;
use crate::selector;

#[derive(Debug, Deserialize)]
struct ReadRequest {
    node_key: Option<String>,
}

/// POST /distributed_read — hands out up to the configured limit of
/// eligible runs, keyed by delivery id.
pub async fn distributed_read(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ReadRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let db = state.open_db().map_err(error_response)?;
    let machine = authenticate(&db, request.node_key.as_deref()).map_err(error_response)?;
    state
        .events
        .post_request(&machine.serial_number, &meta, "distributed_read");

    let tags = MachineTags::for_serial(&db, &machine.serial_number).map_err(error_response)?;
    let selected = selector::select_for_machine(&db, &machine, &tags, state.read_limit)
        .map_err(error_response)?;

    let queries: HashMap<String, String> = selected
        .into_iter()
        .map(|(run, delivery_id)| (delivery_id.to_string(), run.sql))
        .collect();

    Ok(Json(json!({ "queries": queries })))
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    node_key: Option<String>,
    #[serde(default)]
    queries: HashMap<String, Vec<Value>>,
    #[serde(default)]
    statuses: HashMap<String, Value>,
    #[serde(default)]
    messages: HashMap<String, String>,
}

/// POST /distributed_write — records statuses and result rows for the
/// referenced deliveries. Unknown ids are skipped, not errors.
pub async fn distributed_write(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: WriteRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let mut db = state.open_db().map_err(error_response)?;
    let machine = authenticate(&db, request.node_key.as_deref()).map_err(error_response)?;
    state
        .events
        .post_request(&machine.serial_number, &meta, "distributed_write");

    collector::record(
        &mut db,
        &request.queries,
        &request.statuses,
        &request.messages,
        state.result_batch_size,
    )
    .map_err(error_response)?;

    Ok(Json(json!({})))
}

fn authenticate(
    db: &crate::database::Database,
    node_key: Option<&str>,
) -> Result<EnrolledMachine, NodeGateError> {
    let node_key = node_key
        .filter(|k| !k.is_empty())
        .ok_or_else(|| NodeGateError::BadRequest("missing node_key".to_string()))?;
    EnrolledMachine::authenticate(db, node_key)
}

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::body::parse_request;
use crate::api::routes::request_meta;
use crate::api::state::AppState;
use crate::api::{error_response, ApiError};
use crate::carving::{resolve_origin, CarveSession};
use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;

#[derive(Debug, Deserialize)]
struct CarveStartRequest {
    node_key: Option<String>,
    request_id: Option<String>,
    carve_id: Option<String>,
    carve_size: Option<i64>,
    block_size: Option<i64>,
    block_count: Option<i64>,
}

fn require<T>(value: Option<T>, field: &str) -> Result<T, NodeGateError> {
    value.ok_or_else(|| NodeGateError::BadRequest(format!("missing {field}")))
}

/// POST /carve_start
pub async fn carve_start(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: CarveStartRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let db = state.open_db().map_err(error_response)?;
    let node_key = require(request.node_key.as_deref(), "node_key").map_err(error_response)?;
    let machine = EnrolledMachine::authenticate(&db, node_key).map_err(error_response)?;
    state
        .events
        .post_request(&machine.serial_number, &meta, "carve_start");

    let request_id = require(request.request_id.as_deref(), "request_id")
        .map_err(error_response)?;
    let origin = resolve_origin(&db, request_id).map_err(error_response)?;

    let session = CarveSession::start(
        &db,
        origin,
        &machine.serial_number,
        require(request.carve_id.as_deref(), "carve_id").map_err(error_response)?,
        require(request.carve_size, "carve_size").map_err(error_response)?,
        require(request.block_size, "block_size").map_err(error_response)?,
        require(request.block_count, "block_count").map_err(error_response)?,
    )
    .map_err(error_response)?;

    state.events.post_carve_events(
        &machine.serial_number,
        &meta,
        &[json!({ "action": "start", "session_id": session.id })],
    );

    Ok(Json(json!({ "session_id": session.id })))
}

#[derive(Debug, Deserialize)]
struct CarveContinueRequest {
    session_id: Option<String>,
    block_id: Option<Value>,
    data: Option<String>,
}

/// POST /carve_continue — authenticated by session id rather than
/// node key; the machine is resolved through the session's serial
/// number.
pub async fn carve_continue(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: CarveContinueRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let session_id = require(request.session_id.as_deref(), "session_id")
        .map_err(error_response)?;
    let block_id = parse_block_id(request.block_id.as_ref()).map_err(error_response)?;
    let data = decode_block_data(request.data.as_deref()).map_err(error_response)?;

    let db = state.open_db().map_err(error_response)?;
    let session = CarveSession::get(&db, session_id)
        .map_err(error_response)?
        .ok_or_else(|| NodeGateError::NotFound("unknown session_id".to_string()))
        .map_err(error_response)?;

    let machine = EnrolledMachine::latest_for_serial(&db, &session.serial_number)
        .map_err(error_response)?
        .ok_or_else(|| NodeGateError::Auth("unknown machine".to_string()))
        .map_err(error_response)?;
    state
        .events
        .post_request(&machine.serial_number, &meta, "carve_continue");

    // Exclusive per-session access for the write-and-count sequence;
    // other sessions proceed in parallel.
    let outcome = {
        let _guard = state.carve_locks.acquire(&session.id).await;
        session
            .receive_block(&db, &state.data_dir, block_id, &data)
            .map_err(error_response)?
    };

    state.events.post_carve_events(
        &machine.serial_number,
        &meta,
        &[json!({
            "action": "continue",
            "block_id": block_id,
            "session_finished": outcome.session_finished,
            "session_id": session.id,
        })],
    );

    // Commit, then dispatch: the completion is already durable here.
    if outcome.newly_completed {
        state.archives.dispatch(&session.id);
    }

    Ok(Json(json!({})))
}

fn parse_block_id(value: Option<&Value>) -> Result<i64, NodeGateError> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| NodeGateError::BadRequest("invalid block_id".to_string())),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| NodeGateError::BadRequest("invalid block_id".to_string())),
        _ => Err(NodeGateError::BadRequest("missing block_id".to_string())),
    }
}

fn decode_block_data(data: Option<&str>) -> Result<Vec<u8>, NodeGateError> {
    let data = data.ok_or_else(|| NodeGateError::BadRequest("missing block data".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|_| NodeGateError::BadRequest("could not read block data".to_string()))
}

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::api::body::parse_request;
use crate::api::routes::request_meta;
use crate::api::state::AppState;
use crate::api::{error_response, ApiError};
use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;

#[derive(Debug, Deserialize)]
pub(crate) struct NodeRequest {
    node_key: Option<String>,
}

impl NodeRequest {
    pub(crate) fn node_key(&self) -> Result<&str, NodeGateError> {
        self.node_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| NodeGateError::BadRequest("missing node_key".to_string()))
    }
}

/// POST /config — the configuration itself is assembled by an
/// external collaborator; this endpoint only authenticates and
/// forwards.
pub async fn agent_config(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: NodeRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let db = state.open_db().map_err(error_response)?;
    let machine = EnrolledMachine::authenticate(&db, request.node_key().map_err(error_response)?)
        .map_err(error_response)?;

    state
        .events
        .post_request(&machine.serial_number, &meta, "config");

    Ok(Json(state.agent_config.build(&machine)))
}

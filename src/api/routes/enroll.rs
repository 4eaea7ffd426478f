use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use log::error;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::body::parse_request;
use crate::api::routes::request_meta;
use crate::api::state::AppState;
use crate::api::{error_response, ApiError};
use crate::enrollments::{enroll_machine, EnrollmentAction};
use crate::error::NodeGateError;

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    enroll_secret: Option<String>,
    host_identifier: Option<String>,
    #[serde(default)]
    host_details: Value,
    platform_type: Option<Value>,
}

impl EnrollRequest {
    fn enroll_secret(&self) -> Result<&str, NodeGateError> {
        self.enroll_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NodeGateError::BadRequest("missing 'enroll_secret' key".to_string()))
    }

    /// Hardware serial from the host details, falling back to the
    /// host identifier (the usual setup for linux machines).
    fn serial_number(&self) -> Result<String, NodeGateError> {
        let from_details = self.host_details["system_info"]["hardware_serial"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        from_details
            .or_else(|| {
                self.host_identifier
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .map(str::to_string)
            .ok_or_else(|| NodeGateError::BadRequest("missing serial number".to_string()))
    }

    fn uuid(&self) -> Option<String> {
        self.host_details["system_info"]["uuid"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn platform_mask(&self) -> u32 {
        let mask = match &self.platform_type {
            Some(Value::String(s)) => s.parse().ok(),
            Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
            _ => None,
        };
        mask.unwrap_or_else(|| {
            error!("enroll: could not get platform mask from enrollment data");
            0
        })
    }

    fn agent_version(&self) -> Option<&str> {
        let version = self.host_details["osquery_info"]["version"].as_str();
        if version.is_none() {
            error!("enroll: could not get agent version from enrollment data");
        }
        version
    }
}

/// POST /enroll
pub async fn enroll(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: EnrollRequest = parse_request(&headers, &body).map_err(error_response)?;
    let meta = request_meta(&headers, &addr);

    let serial_number = request.serial_number().map_err(error_response)?;
    let ctx = state
        .verifier
        .verify(
            request.enroll_secret().map_err(error_response)?,
            &serial_number,
            request.uuid().as_deref(),
        )
        .map_err(error_response)?;

    let db = state.open_db().map_err(error_response)?;
    let (machine, action) = enroll_machine(
        &db,
        &ctx,
        &serial_number,
        request.platform_mask(),
        request.agent_version(),
    )
    .map_err(error_response)?;

    state
        .events
        .post_enrollment(&serial_number, &meta, action.as_str());

    // A fresh enrollment seeds the inventory with the machine's
    // identity; full snapshots arrive later through /log.
    if action == EnrollmentAction::Enrollment {
        state
            .inventory
            .commit(&json!({
                "source": { "module": "nodegate", "name": "nodegate" },
                "serial_number": machine.serial_number,
                "reference": machine.node_key,
                "public_ip_address": meta.remote_addr,
            }))
            .map_err(error_response)?;
    }

    Ok(Json(json!({ "node_key": machine.node_key })))
}

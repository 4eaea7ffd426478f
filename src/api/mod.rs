pub mod body;
pub mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::Json;
use log::error;
use serde::Serialize;

use crate::error::NodeGateError;

/// Error response structure returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Maps domain errors onto the protocol's status-code taxonomy. Auth
/// failures intentionally carry no detail about which check failed.
pub fn error_response(err: NodeGateError) -> ApiError {
    let (status, message) = match &err {
        NodeGateError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        NodeGateError::Auth(_) => (StatusCode::FORBIDDEN, "authentication failed".to_string()),
        NodeGateError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        _ => {
            error!("request failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            )
        }
    };
    (status, Json(ErrorResponse { error: message }))
}

pub mod agent_config;
pub mod carve;
pub mod distributed;
pub mod enroll;
pub mod log;

use std::net::SocketAddr;

use axum::http::{header, HeaderMap};

use crate::collaborators::RequestMeta;

/// User agent and remote address, attached to every posted event.
pub(crate) fn request_meta(headers: &HeaderMap, addr: &SocketAddr) -> RequestMeta {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string());
    RequestMeta {
        user_agent,
        remote_addr,
    }
}

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::api::routes;
use crate::api::state::AppState;
use crate::database::Database;
use crate::error::NodeGateError;

pub struct NodeServer {
    host: String,
    port: u16,
    state: AppState,
}

impl NodeServer {
    pub fn new(host: String, port: u16, state: AppState) -> Self {
        Self { host, port, state }
    }

    pub async fn start(&self) -> Result<(), NodeGateError> {
        // Fail early if the schema cannot be created.
        Database::open(&self.state.db_path)?;
        std::fs::create_dir_all(&self.state.data_dir)?;

        let app = self.create_router();

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| NodeGateError::Error(format!("Invalid address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeGateError::Error(format!("Failed to bind to {addr}: {e}")))?;

        log::info!("nodegate listening on http://{addr}");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| NodeGateError::Error(format!("Server error: {e}")))?;

        log::info!("Server shutdown complete");
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            // Health check
            .route("/health", get(health_check))
            // Node check-in protocol, one endpoint per request type
            .route("/enroll", post(routes::enroll::enroll))
            .route("/config", post(routes::agent_config::agent_config))
            .route(
                "/distributed_read",
                post(routes::distributed::distributed_read),
            )
            .route(
                "/distributed_write",
                post(routes::distributed::distributed_write),
            )
            .route("/log", post(routes::log::log))
            .route("/carve_start", post(routes::carve::carve_start))
            .route("/carve_continue", post(routes::carve::carve_continue))
            .with_state(self.state.clone())
    }
}

async fn health_check() -> Result<(StatusCode, Html<String>), StatusCode> {
    Ok((
        StatusCode::OK,
        Html("<h1>nodegate</h1><p>Server is running</p>".to_string()),
    ))
}


/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}

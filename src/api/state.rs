use std::path::PathBuf;
use std::sync::Arc;

use crate::carving::SessionLocks;
use crate::collaborators::{
    ArchiveDispatcher, ConfigBuilder, DefaultConfigBuilder, EventSink, InventoryCommitter,
    LogArchiveDispatcher, LogEventSink, LogInventoryCommitter, SecretVerifier,
    StaticSecretVerifier,
};
use crate::config::Config;
use crate::database::Database;
use crate::error::NodeGateError;

/// Shared application state passed to all Axum handlers via
/// `.with_state()`. Holds no per-request data; every handler opens
/// its own database connection.
#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub read_limit: usize,
    pub result_batch_size: usize,
    pub verifier: Arc<dyn SecretVerifier>,
    pub events: Arc<dyn EventSink>,
    pub inventory: Arc<dyn InventoryCommitter>,
    pub archives: Arc<dyn ArchiveDispatcher>,
    pub agent_config: Arc<dyn ConfigBuilder>,
    pub carve_locks: Arc<SessionLocks>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Self {
        Self {
            db_path: config.storage.db_path(),
            data_dir: config.storage.data_dir(),
            read_limit: config.protocol.read_limit,
            result_batch_size: config.protocol.result_batch_size,
            verifier: Arc::new(StaticSecretVerifier::new(config.secret_table())),
            events: Arc::new(LogEventSink),
            inventory: Arc::new(LogInventoryCommitter),
            archives: Arc::new(LogArchiveDispatcher),
            agent_config: Arc::new(DefaultConfigBuilder),
            carve_locks: Arc::new(SessionLocks::new()),
        }
    }

    pub fn open_db(&self) -> Result<Database, NodeGateError> {
        Database::open(&self.db_path)
    }
}

//! Narrow interfaces to the external collaborators of the check-in
//! protocol: secret verification, event posting, inventory commits,
//! archive building, and agent configuration assembly. Their real
//! implementations live elsewhere in the backend; the defaults here
//! log what they would do, which is enough for a standalone server
//! and for tests.

use std::collections::HashMap;

use log::info;
use serde_json::Value;

use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;

/// Outcome of a successful enrollment-secret verification: which
/// enrollment relationship the machine belongs to, plus the tags the
/// secret assigns to it.
#[derive(Debug, Clone)]
pub struct EnrollmentRef {
    pub enrollment_id: i64,
    pub tags: Vec<String>,
}

/// Transport metadata attached to every posted event.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_agent: String,
    pub remote_addr: String,
}

pub trait SecretVerifier: Send + Sync {
    /// `authenticate(secret, identity) -> enrollment-context | error`.
    /// A wrong secret is an auth error, indistinguishable from other
    /// auth failures to the caller.
    fn verify(
        &self,
        secret: &str,
        serial_number: &str,
        uuid: Option<&str>,
    ) -> Result<EnrollmentRef, NodeGateError>;
}

/// Secret table loaded from the configuration file. Stands in for the
/// backend's enrollment service.
pub struct StaticSecretVerifier {
    secrets: HashMap<String, EnrollmentRef>,
}

impl StaticSecretVerifier {
    pub fn new(secrets: HashMap<String, EnrollmentRef>) -> Self {
        Self { secrets }
    }
}

impl SecretVerifier for StaticSecretVerifier {
    fn verify(
        &self,
        secret: &str,
        _serial_number: &str,
        _uuid: Option<&str>,
    ) -> Result<EnrollmentRef, NodeGateError> {
        self.secrets
            .get(secret)
            .cloned()
            .ok_or_else(|| NodeGateError::Auth("wrong enrollment secret".to_string()))
    }
}

pub trait EventSink: Send + Sync {
    fn post_enrollment(&self, serial_number: &str, meta: &RequestMeta, action: &str);
    fn post_request(&self, serial_number: &str, meta: &RequestMeta, request_type: &str);
    fn post_carve_events(&self, serial_number: &str, meta: &RequestMeta, events: &[Value]);
    fn post_results(&self, serial_number: &str, meta: &RequestMeta, records: &[Value]);
    fn post_status_logs(&self, serial_number: &str, meta: &RequestMeta, records: &[Value]);
    fn post_machine_conflict(
        &self,
        reported_serial: &str,
        enrolled_serial: &str,
        decorations: &Value,
    );
}

pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn post_enrollment(&self, serial_number: &str, _meta: &RequestMeta, action: &str) {
        info!("event: {action} for {serial_number}");
    }

    fn post_request(&self, serial_number: &str, _meta: &RequestMeta, request_type: &str) {
        info!("event: request {request_type} from {serial_number}");
    }

    fn post_carve_events(&self, serial_number: &str, _meta: &RequestMeta, events: &[Value]) {
        info!("event: {} carve event(s) from {serial_number}", events.len());
    }

    fn post_results(&self, serial_number: &str, _meta: &RequestMeta, records: &[Value]) {
        info!("event: {} result record(s) from {serial_number}", records.len());
    }

    fn post_status_logs(&self, serial_number: &str, _meta: &RequestMeta, records: &[Value]) {
        info!("event: {} status record(s) from {serial_number}", records.len());
    }

    fn post_machine_conflict(
        &self,
        reported_serial: &str,
        enrolled_serial: &str,
        _decorations: &Value,
    ) {
        info!("event: machine conflict, reported {reported_serial}, enrolled {enrolled_serial}");
    }
}

pub trait InventoryCommitter: Send + Sync {
    /// Commits an inventory snapshot tree for a machine and triggers
    /// whatever downstream events the inventory service owns.
    fn commit(&self, tree: &Value) -> Result<(), NodeGateError>;
}

pub struct LogInventoryCommitter;

impl InventoryCommitter for LogInventoryCommitter {
    fn commit(&self, tree: &Value) -> Result<(), NodeGateError> {
        let serial = tree
            .get("serial_number")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>");
        info!("inventory: committing snapshot for {serial}");
        Ok(())
    }
}

pub trait ArchiveDispatcher: Send + Sync {
    /// Enqueues the archive build for a completed carve session. Only
    /// ever invoked after the completion was durably recorded.
    fn dispatch(&self, session_id: &str);
}

pub struct LogArchiveDispatcher;

impl ArchiveDispatcher for LogArchiveDispatcher {
    fn dispatch(&self, session_id: &str) {
        info!("carve: archive build requested for session {session_id}");
    }
}

pub trait ConfigBuilder: Send + Sync {
    /// Assembles the agent configuration returned by the `config`
    /// endpoint. The real builder merges packs, options, and file
    /// categories; out of scope here.
    fn build(&self, machine: &EnrolledMachine) -> Value;
}

pub struct DefaultConfigBuilder;

impl ConfigBuilder for DefaultConfigBuilder {
    fn build(&self, _machine: &EnrolledMachine) -> Value {
        serde_json::json!({
            "options": {
                "distributed_interval": 60,
                "logger_tls_period": 60,
                "logger_tls_compress": true,
            },
            "schedule": {},
        })
    }
}

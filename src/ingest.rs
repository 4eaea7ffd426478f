//! Log batch ingestion: orders records, verifies the agent's
//! self-reported identity, refreshes the stored agent version, and
//! routes inventory snapshots and results/status records to their
//! collaborators. Runs outside any broader transaction scope since
//! batches can be large.

use log::{error, warn};
use serde_json::Value;

use crate::collaborators::{EventSink, InventoryCommitter, RequestMeta};
use crate::database::Database;
use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;

/// Name of the scheduled query whose snapshot records carry the full
/// inventory; those are committed, not forwarded as results.
pub const INVENTORY_QUERY_NAME: &str = "nodegate-inventory";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ok,
    /// The batch reported a serial number that disagrees with the
    /// authenticated machine; the caller should tell the agent to
    /// re-enroll.
    NodeInvalid,
}

pub fn ingest(
    db: &Database,
    machine: &EnrolledMachine,
    log_type: &str,
    mut records: Vec<Value>,
    meta: &RequestMeta,
    events: &dyn EventSink,
    inventory: &dyn InventoryCommitter,
) -> Result<IngestOutcome, NodeGateError> {
    if records.is_empty() {
        warn!("log: empty batch from {}", machine.serial_number);
        return Ok(IngestOutcome::Ok);
    }

    // Agent-supplied order is not trusted; a missing timestamp sorts
    // first.
    records.sort_by_key(|r| r.get("unixTime").and_then(Value::as_i64).unwrap_or(0));

    if let Some(decorations) = records.last().and_then(|r| r.get("decorations")).cloned() {
        let reported_serial = decorations.get("serial_number").and_then(Value::as_str);
        if let Some(reported) = reported_serial {
            if reported != machine.serial_number {
                warn!(
                    "log: agent reported serial {reported} differs from enrolled {}",
                    machine.serial_number
                );
                events.post_machine_conflict(reported, &machine.serial_number, &decorations);
                return Ok(IngestOutcome::NodeInvalid);
            }
        }

        // Best-effort version refresh, last write wins.
        if let Some(reported_version) = decorations.get("version").and_then(Value::as_str) {
            if machine.agent_version.as_deref() != Some(reported_version) {
                EnrolledMachine::update_agent_version(db, machine.id, reported_version)?;
            }
        }
    }

    match log_type {
        "result" => {
            let mut results = Vec::new();
            let mut last_inventory_snapshot = None;
            for record in records {
                if record.get("name").and_then(Value::as_str) == Some(INVENTORY_QUERY_NAME) {
                    // Only the last snapshot is authoritative.
                    if let Some(snapshot) = record.get("snapshot") {
                        last_inventory_snapshot = Some(snapshot.clone());
                    }
                } else {
                    results.push(record);
                }
            }
            if let Some(snapshot) = last_inventory_snapshot {
                inventory.commit(&inventory_tree(machine, meta, snapshot))?;
            }
            events.post_results(&machine.serial_number, meta, &results);
        }
        "status" => {
            events.post_status_logs(&machine.serial_number, meta, &records);
        }
        other => {
            // Not fatal to the request.
            error!("log: unknown log type '{other}' from {}", machine.serial_number);
        }
    }

    Ok(IngestOutcome::Ok)
}

/// Snapshot tree handed to the inventory collaborator, carrying the
/// machine identity and network metadata alongside the payload.
fn inventory_tree(machine: &EnrolledMachine, meta: &RequestMeta, snapshot: Value) -> Value {
    serde_json::json!({
        "source": { "module": "nodegate", "name": "nodegate" },
        "serial_number": machine.serial_number,
        "reference": machine.node_key,
        "public_ip_address": meta.remote_addr,
        "snapshot": snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::EnrollmentRef;
    use crate::enrollments::enroll_machine;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records everything it is handed, for assertions.
    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<Value>>,
        statuses: Mutex<Vec<Value>>,
        conflicts: Mutex<Vec<(String, String)>>,
    }

    impl EventSink for RecordingSink {
        fn post_enrollment(&self, _: &str, _: &RequestMeta, _: &str) {}
        fn post_request(&self, _: &str, _: &RequestMeta, _: &str) {}
        fn post_carve_events(&self, _: &str, _: &RequestMeta, _: &[Value]) {}

        fn post_results(&self, _: &str, _: &RequestMeta, records: &[Value]) {
            self.results.lock().unwrap().extend_from_slice(records);
        }

        fn post_status_logs(&self, _: &str, _: &RequestMeta, records: &[Value]) {
            self.statuses.lock().unwrap().extend_from_slice(records);
        }

        fn post_machine_conflict(&self, reported: &str, enrolled: &str, _: &Value) {
            self.conflicts
                .lock()
                .unwrap()
                .push((reported.to_string(), enrolled.to_string()));
        }
    }

    #[derive(Default)]
    struct RecordingInventory {
        trees: Mutex<Vec<Value>>,
    }

    impl InventoryCommitter for RecordingInventory {
        fn commit(&self, tree: &Value) -> Result<(), NodeGateError> {
            self.trees.lock().unwrap().push(tree.clone());
            Ok(())
        }
    }

    fn machine(db: &Database, serial: &str) -> EnrolledMachine {
        let ctx = EnrollmentRef {
            enrollment_id: 1,
            tags: vec![],
        };
        let (m, _) = enroll_machine(db, &ctx, serial, 0, Some("5.0.0")).unwrap();
        m
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            user_agent: "osquery/5.0.0".to_string(),
            remote_addr: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn serial_conflict_rejects_batch_without_forwarding() {
        let db = Database::open_in_memory().unwrap();
        let m = machine(&db, "SN2");
        let sink = RecordingSink::default();
        let inv = RecordingInventory::default();

        let records = vec![json!({
            "unixTime": 10,
            "name": INVENTORY_QUERY_NAME,
            "snapshot": [{"hostname": "evil"}],
            "decorations": {"serial_number": "SN1"},
        })];

        let outcome =
            ingest(&db, &m, "result", records, &meta(), &sink, &inv).unwrap();
        assert_eq!(outcome, IngestOutcome::NodeInvalid);
        assert!(inv.trees.lock().unwrap().is_empty());
        assert!(sink.results.lock().unwrap().is_empty());
        assert_eq!(
            sink.conflicts.lock().unwrap()[0],
            ("SN1".to_string(), "SN2".to_string())
        );
    }

    #[test]
    fn inventory_snapshot_is_split_from_results_last_wins() {
        let db = Database::open_in_memory().unwrap();
        let m = machine(&db, "SN1");
        let sink = RecordingSink::default();
        let inv = RecordingInventory::default();

        // Out of order on purpose; the later unixTime must win.
        let records = vec![
            json!({"unixTime": 30, "name": INVENTORY_QUERY_NAME, "snapshot": [{"v": "new"}]}),
            json!({"unixTime": 10, "name": INVENTORY_QUERY_NAME, "snapshot": [{"v": "old"}]}),
            json!({"unixTime": 20, "name": "other-query", "snapshot": [{"uid": "0"}]}),
        ];

        let outcome = ingest(&db, &m, "result", records, &meta(), &sink, &inv).unwrap();
        assert_eq!(outcome, IngestOutcome::Ok);

        let trees = inv.trees.lock().unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0]["snapshot"], json!([{"v": "new"}]));
        assert_eq!(trees[0]["serial_number"], json!("SN1"));
        assert_eq!(trees[0]["reference"], json!(m.node_key));

        let results = sink.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["name"], json!("other-query"));
    }

    #[test]
    fn status_batch_is_forwarded_unfiltered() {
        let db = Database::open_in_memory().unwrap();
        let m = machine(&db, "SN1");
        let sink = RecordingSink::default();
        let inv = RecordingInventory::default();

        let records = vec![
            json!({"unixTime": 2, "severity": "0", "message": "b"}),
            json!({"severity": "1", "message": "a"}),
        ];
        ingest(&db, &m, "status", records, &meta(), &sink, &inv).unwrap();

        let statuses = sink.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 2);
        // Missing unixTime sorts first.
        assert_eq!(statuses[0]["message"], json!("a"));
    }

    #[test]
    fn unknown_log_type_is_logged_not_fatal() {
        let db = Database::open_in_memory().unwrap();
        let m = machine(&db, "SN1");
        let sink = RecordingSink::default();
        let inv = RecordingInventory::default();

        let outcome = ingest(
            &db,
            &m,
            "telemetry",
            vec![json!({"x": 1})],
            &meta(),
            &sink,
            &inv,
        )
        .unwrap();
        assert_eq!(outcome, IngestOutcome::Ok);
        assert!(sink.results.lock().unwrap().is_empty());
        assert!(sink.statuses.lock().unwrap().is_empty());
    }

    #[test]
    fn version_drift_refreshes_stored_version() {
        let db = Database::open_in_memory().unwrap();
        let m = machine(&db, "SN1");
        let sink = RecordingSink::default();
        let inv = RecordingInventory::default();

        let records = vec![json!({
            "unixTime": 1,
            "name": "q",
            "decorations": {"serial_number": "SN1", "version": "5.3.0"},
        })];
        ingest(&db, &m, "result", records, &meta(), &sink, &inv).unwrap();

        let reloaded = EnrolledMachine::authenticate(&db, &m.node_key).unwrap();
        assert_eq!(reloaded.agent_version.as_deref(), Some("5.3.0"));
    }
}

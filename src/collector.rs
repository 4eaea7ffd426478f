//! Recording of distributed query results and delivery statuses from
//! `distributed_write`. Unknown delivery ids are skipped, a missing
//! status is logged and replaced by a sentinel, and result rows are
//! bulk-inserted in fixed-size batches.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use serde_json::Value;

use crate::database::Database;
use crate::distributed::{Delivery, DistributedQueryResult};
use crate::error::NodeGateError;

/// Sentinel stored when the agent reported results without a status.
pub const MISSING_STATUS: i64 = 999;

/// Default number of result rows per insert batch.
pub const DEFAULT_RESULT_BATCH_SIZE: usize = 100;

/// Records statuses, error messages, and result rows for every known
/// delivery id referenced by any of the three maps. Result rows are
/// tagged with the delivery's serial number, not the caller's, so a
/// stale session cannot misattribute rows.
pub fn record(
    db: &mut Database,
    results: &HashMap<String, Vec<Value>>,
    statuses: &HashMap<String, Value>,
    messages: &HashMap<String, String>,
    batch_size: usize,
) -> Result<(), NodeGateError> {
    let mut referenced: BTreeSet<&str> = BTreeSet::new();
    referenced.extend(results.keys().map(String::as_str));
    referenced.extend(statuses.keys().map(String::as_str));
    referenced.extend(messages.keys().map(String::as_str));
    if referenced.is_empty() {
        return Ok(());
    }

    let mut rows: Vec<(i64, String, String)> = Vec::new();

    for key in referenced {
        let Some(delivery) = parse_delivery_id(key)
            .map(|id| Delivery::get(db, id))
            .transpose()?
            .flatten()
        else {
            // Agents may report ids that were cleaned up server-side.
            warn!("distributed_write: unknown delivery id {key}, skipping");
            continue;
        };

        let status = match statuses.get(key).and_then(coerce_status) {
            Some(status) => status,
            None => {
                warn!("distributed_write: missing status for delivery {key}");
                MISSING_STATUS
            }
        };
        Delivery::set_status(db, delivery.id, status, messages.get(key).map(String::as_str))?;

        for row in results.get(key).into_iter().flatten() {
            rows.push((
                delivery.distributed_query_id,
                delivery.serial_number.clone(),
                serde_json::to_string(&strip_nul(row))?,
            ));
        }
    }

    DistributedQueryResult::bulk_insert(db, &rows, batch_size)
}

fn parse_delivery_id(key: &str) -> Option<i64> {
    key.parse().ok()
}

/// osquery reports statuses as either numbers or numeric strings.
fn coerce_status(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// NUL characters are not storable in SQLite TEXT columns shared with
/// downstream consumers; strip them from every string in the row.
fn strip_nul(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace('\u{0000}', "")),
        Value::Array(items) => Value::Array(items.iter().map(strip_nul).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.replace('\u{0000}', ""), strip_nul(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::unix_now;
    use crate::distributed::{DistributedQuery, Query, RunSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn delivery(db: &Database, serial: &str) -> (i64, i64) {
        let query = Query::create(db, &format!("q{}", unix_now_nanos()), "select 1;", &[], None)
            .unwrap();
        let run = DistributedQuery::launch(db, &query, unix_now() - 1, &RunSpec::default()).unwrap();
        let delivery_id = Delivery::create(db, run.id, serial).unwrap().unwrap();
        (run.id, delivery_id)
    }

    fn unix_now_nanos() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
    }

    #[test]
    fn records_status_message_and_rows() {
        let mut db = Database::open_in_memory().unwrap();
        let (run_id, delivery_id) = delivery(&db, "SN1");
        let key = delivery_id.to_string();

        let results = HashMap::from([(
            key.clone(),
            vec![json!({"uid": "0"}), json!({"uid": "501"})],
        )]);
        let statuses = HashMap::from([(key.clone(), json!(0))]);
        let messages = HashMap::from([(key.clone(), "ok".to_string())]);

        record(&mut db, &results, &statuses, &messages, 100).unwrap();

        let stored = Delivery::get(&db, delivery_id).unwrap().unwrap();
        assert_eq!(stored.status, Some(0));
        assert_eq!(stored.error_message.as_deref(), Some("ok"));
        assert_eq!(DistributedQueryResult::count_for_query(&db, run_id).unwrap(), 2);

        let rows = DistributedQueryResult::rows_for_query(&db, run_id).unwrap();
        assert!(rows.iter().all(|(serial, _)| serial == "SN1"));
    }

    #[test]
    fn unknown_delivery_ids_are_skipped() {
        let mut db = Database::open_in_memory().unwrap();
        let (run_id, delivery_id) = delivery(&db, "SN1");

        let results = HashMap::from([
            (delivery_id.to_string(), vec![json!({"a": 1})]),
            ("424242".to_string(), vec![json!({"stale": true})]),
            ("not-a-number".to_string(), vec![json!({"stale": true})]),
        ]);
        let statuses = HashMap::from([(delivery_id.to_string(), json!("0"))]);

        record(&mut db, &results, &statuses, &HashMap::new(), 100).unwrap();
        assert_eq!(DistributedQueryResult::count_for_query(&db, run_id).unwrap(), 1);
    }

    #[test]
    fn missing_status_becomes_sentinel() {
        let mut db = Database::open_in_memory().unwrap();
        let (_, delivery_id) = delivery(&db, "SN1");

        let results = HashMap::from([(delivery_id.to_string(), vec![json!({"a": 1})])]);
        record(&mut db, &results, &HashMap::new(), &HashMap::new(), 100).unwrap();

        let stored = Delivery::get(&db, delivery_id).unwrap().unwrap();
        assert_eq!(stored.status, Some(MISSING_STATUS));
    }

    #[test]
    fn small_batches_still_commit_everything() {
        let mut db = Database::open_in_memory().unwrap();
        let (run_id, delivery_id) = delivery(&db, "SN1");

        let rows: Vec<Value> = (0..7).map(|i| json!({"n": i})).collect();
        let results = HashMap::from([(delivery_id.to_string(), rows)]);
        let statuses = HashMap::from([(delivery_id.to_string(), json!(0))]);

        record(&mut db, &results, &statuses, &HashMap::new(), 2).unwrap();
        assert_eq!(DistributedQueryResult::count_for_query(&db, run_id).unwrap(), 7);
    }

    #[test]
    fn nul_characters_are_stripped() {
        let cleaned = strip_nul(&json!({"name": "evil\u{0000}name", "nested": ["a\u{0000}b"]}));
        assert_eq!(cleaned, json!({"name": "evilname", "nested": ["ab"]}));
    }
}

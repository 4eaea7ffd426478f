use rusqlite::{named_params, OptionalExtension};
use serde_json::Value;

use crate::database::{unix_now, Database};
use crate::error::NodeGateError;
use crate::platform::parse_platform_list;

/// Separator used in pack configuration keys:
/// `<pack_slug>/<pack_id>/<query_slug>/<query_id>/<query_version>`.
pub const PACK_KEY_DELIMITER: char = '/';

/// A saved query. Its text is never interpreted here; only the
/// delivery metadata matters. The version counter is bumped on every
/// edit so delivered instances can be traced to the exact revision.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: i64,
    pub name: String,
    pub sql: String,
    pub platforms: Vec<String>,
    pub minimum_agent_version: Option<String>,
    pub version: i64,
}

impl Query {
    pub fn create(
        db: &Database,
        name: &str,
        sql: &str,
        platforms: &[&str],
        minimum_agent_version: Option<&str>,
    ) -> Result<Query, NodeGateError> {
        db.conn().execute(
            "INSERT INTO queries (name, sql, platforms, minimum_agent_version, version, created_at)
             VALUES (:name, :sql, :platforms, :min_version, 1, :now)",
            named_params! {
                ":name":        name,
                ":sql":         sql,
                ":platforms":   platforms.join(","),
                ":min_version": minimum_agent_version,
                ":now":         unix_now(),
            },
        )?;
        Ok(Query {
            id: db.conn().last_insert_rowid(),
            name: name.to_string(),
            sql: sql.to_string(),
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            minimum_agent_version: minimum_agent_version.map(str::to_string),
            version: 1,
        })
    }

    pub fn update_sql(db: &Database, id: i64, sql: &str) -> Result<(), NodeGateError> {
        db.conn().execute(
            "UPDATE queries SET sql = :sql, version = version + 1 WHERE id = :id",
            named_params! { ":sql": sql, ":id": id },
        )?;
        Ok(())
    }
}

/// A frozen snapshot of a query launched as a one-off run, with an
/// activity window and the per-machine targeting metadata.
#[derive(Debug, Clone)]
pub struct DistributedQuery {
    pub id: i64,
    pub query_id: Option<i64>,
    pub query_version: i64,
    pub sql: String,
    pub platforms: Vec<String>,
    pub minimum_agent_version: Option<String>,
    pub valid_from: i64,
    pub valid_until: Option<i64>,
    pub serial_numbers: Vec<String>,
    pub shard: u32,
}

/// Targeting knobs for a new run; everything defaults to "all".
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub valid_until: Option<i64>,
    pub serial_numbers: Vec<String>,
    pub tags: Vec<String>,
    pub shard: Option<u32>,
}

impl DistributedQuery {
    /// Launches a run of `query`, snapshotting its SQL, version, and
    /// delivery metadata. Later edits to the query do not affect the
    /// run.
    pub fn launch(
        db: &Database,
        query: &Query,
        valid_from: i64,
        spec: &RunSpec,
    ) -> Result<DistributedQuery, NodeGateError> {
        let serials = serde_json::to_string(&spec.serial_numbers)?;
        let shard = spec.shard.unwrap_or(100).clamp(1, 100);
        db.conn().execute(
            "INSERT INTO distributed_queries
                 (query_id, query_version, sql, platforms, minimum_agent_version,
                  valid_from, valid_until, serial_numbers, shard, created_at)
             VALUES (:query_id, :query_version, :sql, :platforms, :min_version,
                     :valid_from, :valid_until, :serials, :shard, :now)",
            named_params! {
                ":query_id":      query.id,
                ":query_version": query.version,
                ":sql":           query.sql,
                ":platforms":     query.platforms.join(","),
                ":min_version":   query.minimum_agent_version,
                ":valid_from":    valid_from,
                ":valid_until":   spec.valid_until,
                ":serials":       serials,
                ":shard":         shard,
                ":now":           unix_now(),
            },
        )?;
        let id = db.conn().last_insert_rowid();
        for tag in &spec.tags {
            Self::add_tag(db, id, tag)?;
        }
        Ok(DistributedQuery {
            id,
            query_id: Some(query.id),
            query_version: query.version,
            sql: query.sql.clone(),
            platforms: query.platforms.clone(),
            minimum_agent_version: query.minimum_agent_version.clone(),
            valid_from,
            valid_until: spec.valid_until,
            serial_numbers: spec.serial_numbers.clone(),
            shard,
        })
    }

    pub fn add_tag(db: &Database, id: i64, tag: &str) -> Result<(), NodeGateError> {
        db.conn().execute(
            "INSERT OR IGNORE INTO distributed_query_tags (distributed_query_id, tag)
             VALUES (:id, :tag)",
            named_params! { ":id": id, ":tag": tag },
        )?;
        Ok(())
    }

    pub fn tags(db: &Database, id: i64) -> Result<Vec<String>, NodeGateError> {
        let mut stmt = db.conn().prepare(
            "SELECT tag FROM distributed_query_tags WHERE distributed_query_id = :id ORDER BY tag",
        )?;
        let tags = stmt
            .query_map(named_params! { ":id": id }, |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tags)
    }

    pub fn get(db: &Database, id: i64) -> Result<Option<DistributedQuery>, NodeGateError> {
        let dq = db
            .conn()
            .query_row(
                "SELECT id, query_id, query_version, sql, platforms, minimum_agent_version,
                        valid_from, valid_until, serial_numbers, shard
                 FROM distributed_queries WHERE id = :id",
                named_params! { ":id": id },
                Self::from_row,
            )
            .optional()?;
        Ok(dq)
    }

    /// Runs whose activity window covers `now`, in ascending id order
    /// for reproducible selection across retries. The remaining
    /// eligibility rules are applied in memory by the selector.
    pub fn active_candidates(
        db: &Database,
        now: i64,
    ) -> Result<Vec<DistributedQuery>, NodeGateError> {
        let mut stmt = db.conn().prepare(
            "SELECT id, query_id, query_version, sql, platforms, minimum_agent_version,
                    valid_from, valid_until, serial_numbers, shard
             FROM distributed_queries
             WHERE valid_from <= :now AND (valid_until IS NULL OR valid_until >= :now)
             ORDER BY id ASC",
        )?;
        let runs = stmt
            .query_map(named_params! { ":now": now }, Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn is_active(&self, now: i64) -> bool {
        if self.valid_from > now {
            return false;
        }
        match self.valid_until {
            Some(until) => until >= now,
            None => true,
        }
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<DistributedQuery> {
        let platforms: String = row.get(4)?;
        let serials: String = row.get(8)?;
        Ok(DistributedQuery {
            id: row.get(0)?,
            query_id: row.get(1)?,
            query_version: row.get(2)?,
            sql: row.get(3)?,
            platforms: parse_platform_list(&platforms),
            minimum_agent_version: row.get(5)?,
            valid_from: row.get(6)?,
            valid_until: row.get(7)?,
            serial_numbers: serde_json::from_str(&serials).unwrap_or_default(),
            shard: row.get(9)?,
        })
    }
}

/// The delivery record pairing one run with one serial number. Its
/// existence is the de-duplication marker: a run already delivered to
/// a serial number is never re-selected for it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub distributed_query_id: i64,
    pub serial_number: String,
    pub status: Option<i64>,
    pub error_message: Option<String>,
}

impl Delivery {
    /// Inserts the delivery marker. Returns `None` when a marker for
    /// (run, serial) already exists, including when a concurrent poll
    /// won the race; the caller must then drop the run from its
    /// response.
    pub fn create(
        db: &Database,
        distributed_query_id: i64,
        serial_number: &str,
    ) -> Result<Option<i64>, NodeGateError> {
        let now = unix_now();
        let inserted = db.conn().execute(
            "INSERT OR IGNORE INTO distributed_query_machines
                 (distributed_query_id, serial_number, created_at, updated_at)
             VALUES (:dq_id, :serial, :now, :now)",
            named_params! { ":dq_id": distributed_query_id, ":serial": serial_number, ":now": now },
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(db.conn().last_insert_rowid()))
    }

    pub fn exists(
        db: &Database,
        distributed_query_id: i64,
        serial_number: &str,
    ) -> Result<bool, NodeGateError> {
        let exists: bool = db.conn().query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM distributed_query_machines
                 WHERE distributed_query_id = :dq_id AND serial_number = :serial
             )",
            named_params! { ":dq_id": distributed_query_id, ":serial": serial_number },
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get(db: &Database, id: i64) -> Result<Option<Delivery>, NodeGateError> {
        let delivery = db
            .conn()
            .query_row(
                "SELECT id, distributed_query_id, serial_number, status, error_message
                 FROM distributed_query_machines WHERE id = :id",
                named_params! { ":id": id },
                |row| {
                    Ok(Delivery {
                        id: row.get(0)?,
                        distributed_query_id: row.get(1)?,
                        serial_number: row.get(2)?,
                        status: row.get(3)?,
                        error_message: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(delivery)
    }

    /// Terminal status and optional error message. Last write wins if
    /// an agent somehow reports twice.
    pub fn set_status(
        db: &Database,
        id: i64,
        status: i64,
        error_message: Option<&str>,
    ) -> Result<(), NodeGateError> {
        db.conn().execute(
            "UPDATE distributed_query_machines
             SET status = :status, error_message = :message, updated_at = :now
             WHERE id = :id",
            named_params! { ":status": status, ":message": error_message, ":now": unix_now(), ":id": id },
        )?;
        Ok(())
    }
}

pub struct DistributedQueryResult;

impl DistributedQueryResult {
    /// Bulk-inserts result rows in fixed-size batches to bound
    /// statement size. Partial batches are committed like full ones.
    pub fn bulk_insert(
        db: &mut Database,
        rows: &[(i64, String, String)], // (distributed_query_id, serial_number, row json)
        batch_size: usize,
    ) -> Result<(), NodeGateError> {
        for batch in rows.chunks(batch_size.max(1)) {
            let tx = db.conn_mut().transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO distributed_query_results
                         (distributed_query_id, serial_number, row)
                     VALUES (:dq_id, :serial, :row)",
                )?;
                for (dq_id, serial, row) in batch {
                    stmt.execute(
                        named_params! { ":dq_id": dq_id, ":serial": serial, ":row": row },
                    )?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    pub fn count_for_query(
        db: &Database,
        distributed_query_id: i64,
    ) -> Result<i64, NodeGateError> {
        let count: i64 = db.conn().query_row(
            "SELECT count(*) FROM distributed_query_results WHERE distributed_query_id = :id",
            named_params! { ":id": distributed_query_id },
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn rows_for_query(
        db: &Database,
        distributed_query_id: i64,
    ) -> Result<Vec<(String, Value)>, NodeGateError> {
        let mut stmt = db.conn().prepare(
            "SELECT serial_number, row FROM distributed_query_results
             WHERE distributed_query_id = :id ORDER BY id",
        )?;
        let rows = stmt
            .query_map(named_params! { ":id": distributed_query_id }, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(serial, json)| Ok((serial, serde_json::from_str(&json)?)))
            .collect()
    }
}

/// The slice of a scheduled pack entry needed to resolve a carve
/// origin from the agent's pack configuration key.
#[derive(Debug, Clone)]
pub struct PackQuery {
    pub id: i64,
    pub pack_id: i64,
    pub slug: String,
    pub query_id: i64,
    pub query_version: i64,
}

impl PackQuery {
    pub fn create(
        db: &Database,
        pack_id: i64,
        slug: &str,
        query_id: i64,
        query_version: i64,
    ) -> Result<i64, NodeGateError> {
        db.conn().execute(
            "INSERT INTO pack_queries (pack_id, slug, query_id, query_version)
             VALUES (:pack_id, :slug, :query_id, :query_version)",
            named_params! {
                ":pack_id":       pack_id,
                ":slug":          slug,
                ":query_id":      query_id,
                ":query_version": query_version,
            },
        )?;
        Ok(db.conn().last_insert_rowid())
    }

    /// Parses a pack configuration key and loads the matching entry.
    /// A malformed key is a `BadRequest`; a well-formed key with no
    /// matching row is a `NotFound`.
    pub fn find_by_config_key(db: &Database, key: &str) -> Result<PackQuery, NodeGateError> {
        let parts: Vec<&str> = key.split(PACK_KEY_DELIMITER).collect();
        let [_, pack_id, _, query_id, _] = parts.as_slice() else {
            return Err(NodeGateError::BadRequest(
                "not a pack query configuration key".to_string(),
            ));
        };
        let (pack_id, query_id): (i64, i64) = match (pack_id.parse(), query_id.parse()) {
            (Ok(p), Ok(q)) => (p, q),
            _ => {
                return Err(NodeGateError::BadRequest(
                    "not a pack query configuration key".to_string(),
                ))
            }
        };
        db.conn()
            .query_row(
                "SELECT id, pack_id, slug, query_id, query_version
                 FROM pack_queries WHERE pack_id = :pack_id AND query_id = :query_id",
                named_params! { ":pack_id": pack_id, ":query_id": query_id },
                |row| {
                    Ok(PackQuery {
                        id: row.get(0)?,
                        pack_id: row.get(1)?,
                        slug: row.get(2)?,
                        query_id: row.get(3)?,
                        query_version: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| NodeGateError::NotFound("unknown pack query".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_snapshots_query_text() {
        let db = Database::open_in_memory().unwrap();
        let query = Query::create(&db, "users", "select * from users;", &[], None).unwrap();
        let run =
            DistributedQuery::launch(&db, &query, unix_now(), &RunSpec::default()).unwrap();

        // Editing the query must not change the launched run.
        Query::update_sql(&db, query.id, "select uid from users;").unwrap();
        let reloaded = DistributedQuery::get(&db, run.id).unwrap().unwrap();
        assert_eq!(reloaded.sql, "select * from users;");
        assert_eq!(reloaded.query_version, 1);
        assert_eq!(reloaded.shard, 100);
    }

    #[test]
    fn activity_window() {
        let dq = DistributedQuery {
            id: 1,
            query_id: None,
            query_version: 1,
            sql: String::new(),
            platforms: vec![],
            minimum_agent_version: None,
            valid_from: 100,
            valid_until: Some(200),
            serial_numbers: vec![],
            shard: 100,
        };
        assert!(!dq.is_active(99));
        assert!(dq.is_active(100));
        assert!(dq.is_active(200));
        assert!(!dq.is_active(201));
    }

    #[test]
    fn delivery_marker_is_created_once() {
        let db = Database::open_in_memory().unwrap();
        let query = Query::create(&db, "q", "select 1;", &[], None).unwrap();
        let run =
            DistributedQuery::launch(&db, &query, unix_now(), &RunSpec::default()).unwrap();

        let first = Delivery::create(&db, run.id, "SN1").unwrap();
        assert!(first.is_some());
        let second = Delivery::create(&db, run.id, "SN1").unwrap();
        assert!(second.is_none());
        assert!(Delivery::exists(&db, run.id, "SN1").unwrap());
        assert!(!Delivery::exists(&db, run.id, "SN2").unwrap());
    }

    #[test]
    fn result_batches_commit_partially_filled() {
        let mut db = Database::open_in_memory().unwrap();
        let query = Query::create(&db, "q", "select 1;", &[], None).unwrap();
        let run =
            DistributedQuery::launch(&db, &query, unix_now(), &RunSpec::default()).unwrap();

        let rows: Vec<(i64, String, String)> = (0..7)
            .map(|i| (run.id, "SN1".to_string(), format!("{{\"n\":{i}}}")))
            .collect();
        DistributedQueryResult::bulk_insert(&mut db, &rows, 3).unwrap();
        assert_eq!(DistributedQueryResult::count_for_query(&db, run.id).unwrap(), 7);
    }

    #[test]
    fn pack_key_resolution() {
        let db = Database::open_in_memory().unwrap();
        let pq_id = PackQuery::create(&db, 3, "all-users", 7, 2).unwrap();

        let found = PackQuery::find_by_config_key(&db, "it-pack/3/all-users/7/2").unwrap();
        assert_eq!(found.id, pq_id);

        let err = PackQuery::find_by_config_key(&db, "garbage").unwrap_err();
        assert!(matches!(err, NodeGateError::BadRequest(_)));

        let err = PackQuery::find_by_config_key(&db, "it-pack/3/other/99/1").unwrap_err();
        assert!(matches!(err, NodeGateError::NotFound(_)));
    }
}

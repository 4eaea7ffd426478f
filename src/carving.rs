//! File carving: session creation, block reception, and completion
//! detection. A session is OPEN until the count of distinct received
//! block indices reaches the declared block count, then COMPLETE; the
//! transition is persisted before the archive build is dispatched.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{named_params, OptionalExtension};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::database::{unix_now, Database};
use crate::distributed::{Delivery, PackQuery};
use crate::error::NodeGateError;

const CARVE_DIR: &str = "file_carvings";

/// Exactly one origin per session: the delivery that requested the
/// carve, or the scheduled pack entry that did. `Orphan` is the
/// defensive case for a session whose origin row disappeared; it
/// should not occur given the `start` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarveOrigin {
    DistributedQuery(i64),
    PackQuery(i64),
    Orphan,
}

impl CarveOrigin {
    /// Storage namespace for the session's blocks and archive.
    pub fn subdir(&self) -> String {
        match self {
            CarveOrigin::DistributedQuery(id) => format!("runs/{id}"),
            CarveOrigin::PackQuery(id) => format!("scheduled/{id}"),
            CarveOrigin::Orphan => "orphans".to_string(),
        }
    }
}

/// Resolves a carve `request_id`: first as a numeric delivery id,
/// falling back to a pack configuration key. An unknown id is a
/// not-found error; a string that is neither form is a validation
/// error.
pub fn resolve_origin(db: &Database, request_id: &str) -> Result<CarveOrigin, NodeGateError> {
    if let Ok(delivery_id) = request_id.parse::<i64>() {
        let delivery = Delivery::get(db, delivery_id)?
            .ok_or_else(|| NodeGateError::NotFound("unknown distributed query".to_string()))?;
        return Ok(CarveOrigin::DistributedQuery(delivery.distributed_query_id));
    }
    let pack_query = PackQuery::find_by_config_key(db, request_id)?;
    Ok(CarveOrigin::PackQuery(pack_query.id))
}

#[derive(Debug, Clone)]
pub struct CarveSession {
    pub id: String,
    pub origin: CarveOrigin,
    pub serial_number: String,
    pub carve_guid: String,
    pub carve_size: i64,
    pub block_size: i64,
    pub block_count: i64,
    pub completed_at: Option<i64>,
    pub archive_path: Option<String>,
}

/// Outcome of one block reception.
#[derive(Debug, Clone, Copy)]
pub struct BlockOutcome {
    /// False for a duplicate block index (first write wins).
    pub written: bool,
    /// Distinct indices == declared block count.
    pub session_finished: bool,
    /// True exactly once per session, on the OPEN -> COMPLETE
    /// transition; the caller dispatches the archive build then.
    pub newly_completed: bool,
}

impl CarveSession {
    pub fn start(
        db: &Database,
        origin: CarveOrigin,
        serial_number: &str,
        carve_guid: &str,
        carve_size: i64,
        block_size: i64,
        block_count: i64,
    ) -> Result<CarveSession, NodeGateError> {
        let id = Uuid::new_v4().to_string();
        let (dq_id, pq_id) = match origin {
            CarveOrigin::DistributedQuery(id) => (Some(id), None),
            CarveOrigin::PackQuery(id) => (None, Some(id)),
            CarveOrigin::Orphan => (None, None),
        };
        db.conn().execute(
            "INSERT INTO carve_sessions
                 (id, distributed_query_id, pack_query_id, serial_number, carve_guid,
                  carve_size, block_size, block_count, created_at)
             VALUES (:id, :dq_id, :pq_id, :serial, :guid, :size, :block_size, :block_count, :now)",
            named_params! {
                ":id":          id,
                ":dq_id":       dq_id,
                ":pq_id":       pq_id,
                ":serial":      serial_number,
                ":guid":        carve_guid,
                ":size":        carve_size,
                ":block_size":  block_size,
                ":block_count": block_count,
                ":now":         unix_now(),
            },
        )?;
        Ok(CarveSession {
            id,
            origin,
            serial_number: serial_number.to_string(),
            carve_guid: carve_guid.to_string(),
            carve_size,
            block_size,
            block_count,
            completed_at: None,
            archive_path: None,
        })
    }

    pub fn get(db: &Database, id: &str) -> Result<Option<CarveSession>, NodeGateError> {
        let session = db
            .conn()
            .query_row(
                "SELECT id, distributed_query_id, pack_query_id, serial_number, carve_guid,
                        carve_size, block_size, block_count, completed_at, archive_path
                 FROM carve_sessions WHERE id = :id",
                named_params! { ":id": id },
                |row| {
                    let dq_id: Option<i64> = row.get(1)?;
                    let pq_id: Option<i64> = row.get(2)?;
                    let origin = match (dq_id, pq_id) {
                        (Some(id), _) => CarveOrigin::DistributedQuery(id),
                        (None, Some(id)) => CarveOrigin::PackQuery(id),
                        (None, None) => CarveOrigin::Orphan,
                    };
                    Ok(CarveSession {
                        id: row.get(0)?,
                        origin,
                        serial_number: row.get(3)?,
                        carve_guid: row.get(4)?,
                        carve_size: row.get(5)?,
                        block_size: row.get(6)?,
                        block_count: row.get(7)?,
                        completed_at: row.get(8)?,
                        archive_path: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    /// Directory holding this session's blocks and archive.
    pub fn dir(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join(CARVE_DIR)
            .join(self.origin.subdir())
            .join(&self.id)
    }

    pub fn archive_name(&self) -> String {
        format!("{}_{}.tar", self.id, self.serial_number)
    }

    pub fn set_archive_path(db: &Database, id: &str, path: &str) -> Result<(), NodeGateError> {
        db.conn().execute(
            "UPDATE carve_sessions SET archive_path = :path WHERE id = :id",
            named_params! { ":path": path, ":id": id },
        )?;
        Ok(())
    }

    fn distinct_block_count(&self, db: &Database) -> Result<i64, NodeGateError> {
        let count: i64 = db.conn().query_row(
            "SELECT count(*) FROM carve_blocks WHERE session_id = :id",
            named_params! { ":id": self.id },
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Writes one block and re-checks completion. The caller must hold
    /// the session lock for the whole call so concurrent continuations
    /// cannot race on the completion check. First write per index
    /// wins; duplicates are no-ops.
    pub fn receive_block(
        &self,
        db: &Database,
        data_dir: &Path,
        block_id: i64,
        data: &[u8],
    ) -> Result<BlockOutcome, NodeGateError> {
        let inserted = db.conn().execute(
            "INSERT OR IGNORE INTO carve_blocks (session_id, block_id, size, created_at)
             VALUES (:session_id, :block_id, :size, :now)",
            named_params! {
                ":session_id": self.id,
                ":block_id":   block_id,
                ":size":       data.len() as i64,
                ":now":        unix_now(),
            },
        )?;
        let written = inserted > 0;

        if written {
            // The row must not outlive a failed payload write, or the
            // agent's retry would be dropped as a duplicate.
            if let Err(err) = self.write_payload(data_dir, block_id, data) {
                db.conn().execute(
                    "DELETE FROM carve_blocks
                     WHERE session_id = :session_id AND block_id = :block_id",
                    named_params! { ":session_id": self.id, ":block_id": block_id },
                )?;
                return Err(err);
            }
        }

        let session_finished = self.distinct_block_count(db)? == self.block_count;

        let mut newly_completed = false;
        if session_finished {
            // Persist the transition before anyone dispatches; the
            // guarded UPDATE makes the transition fire exactly once.
            let updated = db.conn().execute(
                "UPDATE carve_sessions SET completed_at = :now
                 WHERE id = :id AND completed_at IS NULL",
                named_params! { ":now": unix_now(), ":id": self.id },
            )?;
            newly_completed = updated > 0;
        }

        Ok(BlockOutcome {
            written,
            session_finished,
            newly_completed,
        })
    }

    fn write_payload(
        &self,
        data_dir: &Path,
        block_id: i64,
        data: &[u8],
    ) -> Result<(), NodeGateError> {
        let dir = self.dir(data_dir);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(block_id.to_string()), data)?;
        Ok(())
    }

    /// COMPLETE sessions with no archive yet: the reconciliation hook
    /// for re-dispatching builds lost between commit and dispatch.
    pub fn pending_archive(db: &Database) -> Result<Vec<String>, NodeGateError> {
        let mut stmt = db.conn().prepare(
            "SELECT id FROM carve_sessions
             WHERE completed_at IS NOT NULL AND archive_path IS NULL
             ORDER BY completed_at",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

/// Keyed per-session mutexes serializing the receive-and-check
/// sequence. Cross-session operations proceed in parallel.
#[derive(Default)]
pub struct SessionLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("session lock map poisoned");
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

//! Per-poll selection of pending distributed queries. Eligibility is
//! a conjunction of pure predicates evaluated over candidates loaded
//! from the store; the delivery marker doubles as the de-duplication
//! check and is written before the run is returned to the caller, so
//! a crash after delivery never causes re-delivery.

use sha2::{Digest, Sha256};

use crate::agent_version::AgentVersion;
use crate::database::{unix_now, Database};
use crate::distributed::{Delivery, DistributedQuery};
use crate::enrollments::EnrolledMachine;
use crate::error::NodeGateError;

/// Protocol default for the number of runs handed out per poll.
pub const DEFAULT_READ_LIMIT: usize = 10;

/// Deterministic shard bucket in [1, 100] for a (serial number, run)
/// pair. Frozen: changing this function silently reshuffles which
/// machines are admitted to in-flight shards.
pub fn shard_bucket(serial_number: &str, distributed_query_id: i64) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(serial_number.as_bytes());
    hasher.update(distributed_query_id.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u32 + 1
}

/// The machine-side facts the eligibility rules consume.
pub struct MachineFacts<'a> {
    pub serial_number: &'a str,
    pub platforms: Vec<&'static str>,
    pub version: AgentVersion,
    pub tags: &'a [String],
}

impl<'a> MachineFacts<'a> {
    pub fn from_machine(machine: &'a EnrolledMachine, tags: &'a [String]) -> Self {
        Self {
            serial_number: &machine.serial_number,
            platforms: machine.platforms(),
            version: machine.version_tuple(),
            tags,
        }
    }
}

/// Empty platform list means "all platforms".
pub fn platform_eligible(query_platforms: &[String], machine_platforms: &[&str]) -> bool {
    query_platforms.is_empty()
        || query_platforms
            .iter()
            .any(|p| machine_platforms.contains(&p.as_str()))
}

/// Empty allowlist means "all machines".
pub fn serial_eligible(allowlist: &[String], serial_number: &str) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|s| s == serial_number)
}

/// No configured tags means "all machines"; otherwise at least one
/// shared tag is required.
pub fn tag_eligible(query_tags: &[String], machine_tags: &[String]) -> bool {
    query_tags.is_empty() || query_tags.iter().any(|t| machine_tags.contains(t))
}

pub fn version_eligible(minimum: Option<&str>, machine_version: AgentVersion) -> bool {
    match minimum.and_then(AgentVersion::parse) {
        Some(min) => min <= machine_version,
        None => true,
    }
}

pub fn shard_eligible(shard: u32, serial_number: &str, distributed_query_id: i64) -> bool {
    shard == 100 || shard_bucket(serial_number, distributed_query_id) <= shard
}

/// All static rules except the already-delivered check, which is
/// enforced by the delivery insert itself.
pub fn is_eligible(run: &DistributedQuery, run_tags: &[String], machine: &MachineFacts) -> bool {
    platform_eligible(&run.platforms, &machine.platforms)
        && serial_eligible(&run.serial_numbers, machine.serial_number)
        && tag_eligible(run_tags, machine.tags)
        && version_eligible(run.minimum_agent_version.as_deref(), machine.version)
        && shard_eligible(run.shard, machine.serial_number, run.id)
}

/// Selects up to `limit` eligible runs for a machine, in ascending id
/// order, creating the delivery marker for each before returning it.
/// A run whose marker already exists (or was created by a concurrent
/// poll) is skipped.
pub fn select_for_machine(
    db: &Database,
    machine: &EnrolledMachine,
    machine_tags: &[String],
    limit: usize,
) -> Result<Vec<(DistributedQuery, i64)>, NodeGateError> {
    let facts = MachineFacts::from_machine(machine, machine_tags);
    let mut selected = Vec::new();

    for run in DistributedQuery::active_candidates(db, unix_now())? {
        if selected.len() >= limit {
            break;
        }
        let run_tags = DistributedQuery::tags(db, run.id)?;
        if !is_eligible(&run, &run_tags, &facts) {
            continue;
        }
        if let Some(delivery_id) = Delivery::create(db, run.id, &machine.serial_number)? {
            selected.push((run, delivery_id));
        }
    }

    Ok(selected)
}

use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{named_params, OptionalExtension};

use crate::agent_version::AgentVersion;
use crate::collaborators::EnrollmentRef;
use crate::database::{unix_now, Database};
use crate::error::NodeGateError;
use crate::platform::Platform;

const NODE_KEY_LEN: usize = 32;

/// One live session per (enrollment, serial number). The node key is
/// the opaque credential for every subsequent protocol call.
#[derive(Debug, Clone)]
pub struct EnrolledMachine {
    pub id: i64,
    pub enrollment_id: i64,
    pub serial_number: String,
    pub node_key: String,
    pub agent_version: Option<String>,
    pub platform_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentAction {
    Enrollment,
    ReEnrollment,
}

impl EnrollmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentAction::Enrollment => "enrollment",
            EnrollmentAction::ReEnrollment => "re-enrollment",
        }
    }
}

impl EnrolledMachine {
    /// Looks up the live machine for a node key. An unknown key is a
    /// hard auth rejection, never retried server-side.
    pub fn authenticate(db: &Database, node_key: &str) -> Result<EnrolledMachine, NodeGateError> {
        Self::find_by_node_key(db, node_key)?
            .ok_or_else(|| NodeGateError::Auth("wrong node_key".to_string()))
    }

    pub fn find_by_node_key(
        db: &Database,
        node_key: &str,
    ) -> Result<Option<EnrolledMachine>, NodeGateError> {
        let machine = db
            .conn()
            .query_row(
                "SELECT id, enrollment_id, serial_number, node_key, agent_version, platform_mask
                 FROM enrolled_machines WHERE node_key = :node_key",
                named_params! { ":node_key": node_key },
                Self::from_row,
            )
            .optional()?;
        Ok(machine)
    }

    /// The most recent live session for a serial number, used by carve
    /// continuations which authenticate by session rather than key.
    pub fn latest_for_serial(
        db: &Database,
        serial_number: &str,
    ) -> Result<Option<EnrolledMachine>, NodeGateError> {
        let machine = db
            .conn()
            .query_row(
                "SELECT id, enrollment_id, serial_number, node_key, agent_version, platform_mask
                 FROM enrolled_machines WHERE serial_number = :serial
                 ORDER BY id DESC LIMIT 1",
                named_params! { ":serial": serial_number },
                Self::from_row,
            )
            .optional()?;
        Ok(machine)
    }

    pub fn update_agent_version(
        db: &Database,
        id: i64,
        agent_version: &str,
    ) -> Result<(), NodeGateError> {
        db.conn().execute(
            "UPDATE enrolled_machines
             SET agent_version = :version, updated_at = :now WHERE id = :id",
            named_params! { ":version": agent_version, ":now": unix_now(), ":id": id },
        )?;
        Ok(())
    }

    pub fn platforms(&self) -> Vec<&'static str> {
        Platform::names_from_mask(self.platform_mask)
    }

    pub fn version_tuple(&self) -> AgentVersion {
        AgentVersion::parse_or_zero(self.agent_version.as_deref())
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<EnrolledMachine> {
        Ok(EnrolledMachine {
            id: row.get(0)?,
            enrollment_id: row.get(1)?,
            serial_number: row.get(2)?,
            node_key: row.get(3)?,
            agent_version: row.get(4)?,
            platform_mask: row.get(5)?,
        })
    }
}

fn generate_node_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NODE_KEY_LEN)
        .map(char::from)
        .collect()
}

/// Creates or refreshes the enrolled machine for a verified secret,
/// generating a fresh node key and superseding every other live row
/// for the serial number. A second concurrent enrollment is a
/// takeover, not an error.
pub fn enroll_machine(
    db: &Database,
    ctx: &EnrollmentRef,
    serial_number: &str,
    platform_mask: u32,
    agent_version: Option<&str>,
) -> Result<(EnrolledMachine, EnrollmentAction), NodeGateError> {
    let node_key = generate_node_key();
    let now = unix_now();

    db.conn().execute(
        "INSERT INTO enrolled_machines
             (enrollment_id, serial_number, node_key, agent_version, platform_mask,
              created_at, updated_at)
         VALUES (:enrollment_id, :serial, :node_key, :version, :mask, :now, :now)
         ON CONFLICT (enrollment_id, serial_number) DO UPDATE SET
             node_key = excluded.node_key,
             agent_version = excluded.agent_version,
             platform_mask = excluded.platform_mask,
             updated_at = excluded.updated_at",
        named_params! {
            ":enrollment_id": ctx.enrollment_id,
            ":serial":        serial_number,
            ":node_key":      node_key,
            ":version":       agent_version,
            ":mask":          platform_mask,
            ":now":           now,
        },
    )?;

    let machine = EnrolledMachine::find_by_node_key(db, &node_key)?
        .ok_or_else(|| NodeGateError::Error("enrolled machine row vanished".to_string()))?;

    // Apply the tags carried by the enrollment secret.
    for tag in &ctx.tags {
        MachineTags::add(db, serial_number, tag)?;
    }

    // Delete other live sessions for this serial number. Their
    // existence is what distinguishes a re-enrollment.
    let superseded = db.conn().execute(
        "DELETE FROM enrolled_machines WHERE serial_number = :serial AND id != :id",
        named_params! { ":serial": serial_number, ":id": machine.id },
    )?;

    let action = if superseded > 0 {
        EnrollmentAction::ReEnrollment
    } else {
        EnrollmentAction::Enrollment
    };
    Ok((machine, action))
}

pub struct MachineTags;

impl MachineTags {
    pub fn add(db: &Database, serial_number: &str, tag: &str) -> Result<(), NodeGateError> {
        db.conn().execute(
            "INSERT OR IGNORE INTO machine_tags (serial_number, tag) VALUES (:serial, :tag)",
            named_params! { ":serial": serial_number, ":tag": tag },
        )?;
        Ok(())
    }

    pub fn for_serial(db: &Database, serial_number: &str) -> Result<Vec<String>, NodeGateError> {
        let mut stmt = db
            .conn()
            .prepare("SELECT tag FROM machine_tags WHERE serial_number = :serial ORDER BY tag")?;
        let tags = stmt
            .query_map(named_params! { ":serial": serial_number }, |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tags: &[&str]) -> EnrollmentRef {
        EnrollmentRef {
            enrollment_id: 1,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn enroll_creates_machine_with_tags() {
        let db = Database::open_in_memory().unwrap();
        let (machine, action) =
            enroll_machine(&db, &ctx(&["laptops"]), "SN1", 0x09, Some("5.2.0")).unwrap();

        assert_eq!(action, EnrollmentAction::Enrollment);
        assert_eq!(machine.serial_number, "SN1");
        assert_eq!(machine.node_key.len(), NODE_KEY_LEN);
        assert_eq!(machine.platforms(), vec!["posix", "linux"]);
        assert_eq!(MachineTags::for_serial(&db, "SN1").unwrap(), vec!["laptops"]);
    }

    #[test]
    fn second_enroll_rotates_key_and_keeps_one_row() {
        let db = Database::open_in_memory().unwrap();
        let (first, _) = enroll_machine(&db, &ctx(&[]), "SN1", 0, None).unwrap();
        let (second, _) = enroll_machine(&db, &ctx(&[]), "SN1", 0, None).unwrap();

        assert_ne!(first.node_key, second.node_key);

        let rows: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM enrolled_machines WHERE serial_number = 'SN1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rows, 1);

        // The superseded key must no longer authenticate.
        assert!(EnrolledMachine::authenticate(&db, &first.node_key).is_err());
        assert!(EnrolledMachine::authenticate(&db, &second.node_key).is_ok());
    }

    #[test]
    fn takeover_from_another_enrollment_is_re_enrollment() {
        let db = Database::open_in_memory().unwrap();
        let other = EnrollmentRef {
            enrollment_id: 2,
            tags: vec![],
        };
        enroll_machine(&db, &ctx(&[]), "SN1", 0, None).unwrap();
        let (_, action) = enroll_machine(&db, &other, "SN1", 0, None).unwrap();
        assert_eq!(action, EnrollmentAction::ReEnrollment);

        let rows: i64 = db
            .conn()
            .query_row("SELECT count(*) FROM enrolled_machines", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn unknown_node_key_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = EnrolledMachine::authenticate(&db, "nope").unwrap_err();
        assert!(matches!(err, NodeGateError::Auth(_)));
    }

    #[test]
    fn version_refresh() {
        let db = Database::open_in_memory().unwrap();
        let (machine, _) = enroll_machine(&db, &ctx(&[]), "SN1", 0, Some("5.0.0")).unwrap();
        EnrolledMachine::update_agent_version(&db, machine.id, "5.1.0").unwrap();
        let reloaded = EnrolledMachine::authenticate(&db, &machine.node_key).unwrap();
        assert_eq!(reloaded.agent_version.as_deref(), Some("5.1.0"));
    }
}

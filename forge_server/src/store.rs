//! Build record store — SQLite-backed, single writer at a time.
//!
//! The store exclusively owns build records; the orchestrator, watchdog,
//! and report endpoint only hold an `id` (or `vm_id`) and go through it
//! for every read and update. The interior mutex gives the per-record
//! serialization the pipeline relies on.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::build::{BuildRecord, BuildStatus, BuildSummary};

pub struct BuildStore {
    conn: Mutex<Connection>,
}

impl BuildStore {
    /// Open (or create) the database file. Fatal to startup on failure.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open database {}", path.display()))?;
        Self::configure(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Ephemeral database, used by the test suites.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("cannot open in-memory database")?;
        Self::configure(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("cannot enable WAL mode")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("cannot enable foreign keys")?;
        Ok(())
    }

    /// Create the schema if it does not exist yet.
    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS builds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_name TEXT NOT NULL,
                status TEXT NOT NULL,
                candidate_id TEXT,
                vm_id TEXT,
                logs TEXT NOT NULL DEFAULT '',
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )
        .context("creating builds table")?;
        Ok(())
    }

    /// Insert a new PENDING record and return its id.
    pub fn create_build(&self, image_name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id = conn
            .query_row(
                "INSERT INTO builds (image_name, status, created_at) VALUES (?1, ?2, ?3) RETURNING id",
                params![image_name, BuildStatus::Pending.as_str(), Utc::now()],
                |row| row.get(0),
            )
            .context("creating build record")?;
        Ok(id)
    }

    pub fn update_status(&self, id: i64, status: BuildStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE builds SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .with_context(|| format!("updating status of build {id}"))?;
        Ok(())
    }

    /// Conditional transition: only applies when the record currently holds
    /// `expected`. Returns whether the update won. This is what keeps a
    /// late watchdog firing or a duplicate agent report from regressing a
    /// terminal state.
    pub fn transition_status(
        &self,
        id: i64,
        expected: BuildStatus,
        next: BuildStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE builds SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![next.as_str(), id, expected.as_str()],
            )
            .with_context(|| format!("transitioning build {id}"))?;
        Ok(changed > 0)
    }

    /// Same as [`transition_status`], keyed by the test VM id.
    pub fn transition_status_by_vm_id(
        &self,
        vm_id: &str,
        expected: BuildStatus,
        next: BuildStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE builds SET status = ?1 WHERE vm_id = ?2 AND status = ?3",
                params![next.as_str(), vm_id, expected.as_str()],
            )
            .with_context(|| format!("transitioning build with vm {vm_id}"))?;
        Ok(changed > 0)
    }

    /// Append one line to the build log.
    pub fn append_log(&self, id: i64, text: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE builds SET logs = logs || ?1 || char(10) WHERE id = ?2",
            params![text, id],
        )
        .with_context(|| format!("appending log to build {id}"))?;
        Ok(())
    }

    pub fn set_candidate_id(&self, id: i64, candidate_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE builds SET candidate_id = ?1 WHERE id = ?2",
            params![candidate_id, id],
        )
        .with_context(|| format!("setting candidate id on build {id}"))?;
        Ok(())
    }

    pub fn set_vm_id(&self, id: i64, vm_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE builds SET vm_id = ?1 WHERE id = ?2",
            params![vm_id, id],
        )
        .with_context(|| format!("setting vm id on build {id}"))?;
        Ok(())
    }

    /// Current status and full log text, or None for an unknown id.
    pub fn get_status(&self, id: i64) -> Result<Option<(BuildStatus, String)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT status, logs FROM builds WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("reading build {id}"))?;
        match row {
            Some((status, logs)) => Ok(Some((parse_status(&status)?, logs))),
            None => Ok(None),
        }
    }

    /// Look up the record for a test VM. The agent only knows its vm_id.
    pub fn get_by_vm_id(&self, vm_id: &str) -> Result<Option<BuildRecord>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, image_name, status, candidate_id, vm_id, logs, created_at
                 FROM builds WHERE vm_id = ?1",
                params![vm_id],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("reading build with vm {vm_id}"))?;
        row.transpose()
    }

    /// Most recent builds, newest first.
    pub fn list_recent(&self, limit: i64) -> Result<Vec<BuildSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, image_name, status, created_at
             FROM builds ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, DateTime<Utc>>(3)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, image_name, status, created_at) = row?;
            result.push(BuildSummary {
                id,
                image_name,
                status: parse_status(&status)?,
                created_at,
            });
        }
        Ok(result)
    }
}

fn parse_status(raw: &str) -> Result<BuildStatus> {
    match BuildStatus::parse(raw) {
        Some(s) => Ok(s),
        None => bail!("corrupt status '{raw}' in store"),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<BuildRecord>> {
    let status: String = row.get(2)?;
    Ok(match BuildStatus::parse(&status) {
        Some(status) => Ok(BuildRecord {
            id: row.get(0)?,
            image_name: row.get(1)?,
            status,
            candidate_id: row.get(3)?,
            vm_id: row.get(4)?,
            logs: row.get(5)?,
            created_at: row.get(6)?,
        }),
        None => Err(anyhow::anyhow!("corrupt status '{status}' in store")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BuildStore {
        let store = BuildStore::open_in_memory().unwrap();
        store.init().unwrap();
        store
    }

    #[test]
    fn create_starts_pending_with_monotonic_ids() {
        let store = store();
        let a = store.create_build("web01").unwrap();
        let b = store.create_build("web02").unwrap();
        assert!(b > a);
        let (status, logs) = store.get_status(a).unwrap().unwrap();
        assert_eq!(status, BuildStatus::Pending);
        assert!(logs.is_empty());
    }

    #[test]
    fn log_appends_accumulate() {
        let store = store();
        let id = store.create_build("web01").unwrap();
        store.append_log(id, "first").unwrap();
        store.append_log(id, "second").unwrap();
        let (_, logs) = store.get_status(id).unwrap().unwrap();
        assert_eq!(logs, "first\nsecond\n");
    }

    #[test]
    fn conditional_transition_wins_once() {
        let store = store();
        let id = store.create_build("web01").unwrap();
        store.update_status(id, BuildStatus::WaitingAgent).unwrap();

        assert!(store
            .transition_status(id, BuildStatus::WaitingAgent, BuildStatus::Success)
            .unwrap());
        // Second claimant (a late watchdog) must lose.
        assert!(!store
            .transition_status(id, BuildStatus::WaitingAgent, BuildStatus::ErrorTimeout)
            .unwrap());
        let (status, _) = store.get_status(id).unwrap().unwrap();
        assert_eq!(status, BuildStatus::Success);
    }

    #[test]
    fn vm_id_lookup_and_transition() {
        let store = store();
        let id = store.create_build("web01").unwrap();
        store.set_candidate_id(id, "img-9").unwrap();
        store.set_vm_id(id, "vm-42").unwrap();
        store.update_status(id, BuildStatus::WaitingAgent).unwrap();

        let record = store.get_by_vm_id("vm-42").unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.candidate_id.as_deref(), Some("img-9"));

        assert!(store
            .transition_status_by_vm_id("vm-42", BuildStatus::WaitingAgent, BuildStatus::ErrorTest)
            .unwrap());
        assert!(store.get_by_vm_id("vm-7").unwrap().is_none());
    }

    #[test]
    fn unknown_id_is_none() {
        let store = store();
        assert!(store.get_status(999).unwrap().is_none());
    }

    #[test]
    fn list_recent_is_newest_first_and_limited() {
        let store = store();
        for i in 0..5 {
            store.create_build(&format!("img{i}")).unwrap();
        }
        let recent = store.list_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].image_name, "img4");
        assert_eq!(recent[2].image_name, "img2");
    }
}

//! SQLite-backed journal for resumable runs.
//!
//! Runtime defaults match the rest of the workspace:
//! - `journal_mode = WAL` so progress can be inspected while a run appends
//! - `busy_timeout = 5s` to ride out transient lock failures
//! - `foreign_keys = ON` so revision marks always reference a known item

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Journal, JournalError, JournalProgress, migrations};
use crate::model::{AttachmentId, WorkItemId};

/// Busy timeout used for journal connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) a journal database at `path`, apply pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening, configuring, or migrating the database fails.
pub fn open_journal(path: &Path) -> Result<SqliteJournal> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create journal directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open journal database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply journal migrations")?;

    Ok(SqliteJournal::from_connection(conn))
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Journal persisted through `rusqlite`, one connection per journal.
#[derive(Debug)]
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    const fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Fresh, fully migrated journal that lives only as long as the value.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the connection cannot be opened or migrated.
    pub fn open_in_memory() -> Result<Self, JournalError> {
        let mut conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replayed revision indexes for one origin, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the query fails.
    pub fn processed_revisions(&self, origin_id: &str) -> Result<Vec<u32>, JournalError> {
        revision_indexes(&self.lock(), origin_id)
    }
}

fn revision_indexes(conn: &Connection, origin_id: &str) -> Result<Vec<u32>, JournalError> {
    let mut stmt = conn.prepare(
        "SELECT revision_index FROM journal_revisions
         WHERE origin_id = ?1
         ORDER BY revision_index",
    )?;
    let rows = stmt.query_map([origin_id], |row| row.get::<_, u32>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn count(conn: &Connection, table: &str) -> Result<usize, JournalError> {
    let total: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(usize::try_from(total).unwrap_or_default())
}

impl Journal for SqliteJournal {
    fn is_revision_processed(&self, origin_id: &str, index: u32) -> Result<bool, JournalError> {
        let conn = self.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM journal_revisions
                WHERE origin_id = ?1 AND revision_index = ?2
            )",
            params![origin_id, index],
            |row| row.get(0),
        )?;
        drop(conn);
        Ok(exists)
    }

    fn mark_revision_processed(
        &self,
        origin_id: &str,
        destination_id: WorkItemId,
        index: u32,
    ) -> Result<(), JournalError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let recorded: Option<WorkItemId> = tx
            .query_row(
                "SELECT destination_id FROM journal_items WHERE origin_id = ?1",
                [origin_id],
                |row| row.get(0),
            )
            .optional()?;

        match recorded {
            Some(recorded) if recorded != destination_id => {
                return Err(JournalError::Conflict {
                    origin_id: origin_id.to_string(),
                    recorded,
                    attempted: destination_id,
                });
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO journal_items (origin_id, destination_id) VALUES (?1, ?2)",
                    params![origin_id, destination_id],
                )?;
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO journal_revisions
                (origin_id, revision_index, destination_id, processed_at_us)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                origin_id,
                index,
                destination_id,
                chrono::Utc::now().timestamp_micros()
            ],
        )?;
        tx.commit()?;
        drop(conn);
        Ok(())
    }

    fn resolve_destination_id(&self, origin_id: &str) -> Result<Option<WorkItemId>, JournalError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT destination_id FROM journal_items WHERE origin_id = ?1",
                [origin_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn migrated_attachment(
        &self,
        attachment_origin_id: &str,
    ) -> Result<Option<AttachmentId>, JournalError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT attachment_id FROM journal_attachments WHERE origin_id = ?1",
                [attachment_origin_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn mark_attachment_processed(
        &self,
        attachment_origin_id: &str,
        attachment_id: AttachmentId,
    ) -> Result<(), JournalError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO journal_attachments (origin_id, attachment_id) VALUES (?1, ?2)",
            params![attachment_origin_id, attachment_id],
        )?;
        drop(conn);
        Ok(())
    }

    fn progress(&self) -> Result<JournalProgress, JournalError> {
        let conn = self.lock();
        Ok(JournalProgress {
            items: count(&conn, "journal_items")?,
            revisions: count(&conn, "journal_revisions")?,
            attachments: count(&conn, "journal_attachments")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUSY_TIMEOUT, open_journal};
    use crate::journal::{Journal, JournalError, migrations};
    use tempfile::TempDir;

    fn temp_db_path() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("journal").join("wiport-journal.sqlite3");
        (dir, path)
    }

    #[test]
    fn open_journal_sets_wal_busy_timeout_and_fk() {
        let (_dir, path) = temp_db_path();
        let journal = open_journal(&path).expect("open journal");
        let conn = journal.lock();

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(
            u128::from(busy_timeout_ms),
            DEFAULT_BUSY_TIMEOUT.as_millis()
        );

        let foreign_keys: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("query foreign_keys");
        assert_eq!(foreign_keys, 1);

        let version = migrations::current_schema_version(&conn).expect("schema version");
        drop(conn);
        assert_eq!(version, migrations::LATEST_SCHEMA_VERSION);
    }

    #[test]
    fn marks_survive_reopen() -> Result<(), JournalError> {
        let (_dir, path) = temp_db_path();
        {
            let journal = open_journal(&path).expect("open journal");
            journal.mark_revision_processed("PRJ-1", 41, 0)?;
            journal.mark_revision_processed("PRJ-1", 41, 1)?;
            journal.mark_attachment_processed("att-9", 3)?;
        }

        let journal = open_journal(&path).expect("reopen journal");
        assert!(journal.is_revision_processed("PRJ-1", 1)?);
        assert!(!journal.is_revision_processed("PRJ-1", 2)?);
        assert_eq!(journal.resolve_destination_id("PRJ-1")?, Some(41));
        assert_eq!(journal.migrated_attachment("att-9")?, Some(3));
        assert_eq!(journal.processed_revisions("PRJ-1")?, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn re_marking_is_idempotent_and_conflicts_are_rejected() -> Result<(), JournalError> {
        let journal = super::SqliteJournal::open_in_memory()?;
        journal.mark_revision_processed("PRJ-2", 5, 0)?;
        journal.mark_revision_processed("PRJ-2", 5, 0)?;
        journal.mark_attachment_processed("att-1", 10)?;
        journal.mark_attachment_processed("att-1", 11)?;

        let progress = journal.progress()?;
        assert_eq!(progress.items, 1);
        assert_eq!(progress.revisions, 1);
        assert_eq!(journal.migrated_attachment("att-1")?, Some(10));

        let err = journal
            .mark_revision_processed("PRJ-2", 6, 1)
            .expect_err("conflict");
        assert!(matches!(err, JournalError::Conflict { recorded: 5, .. }));
        assert!(!journal.is_revision_processed("PRJ-2", 1)?);
        Ok(())
    }
}

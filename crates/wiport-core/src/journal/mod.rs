//! Migration journal: the durable idempotency ledger for replay.
//!
//! The journal records three things:
//!
//! - which `(origin id, revision index)` pairs have been replayed, and into
//!   which destination work item;
//! - the reverse mapping `origin id → destination id` used to resolve link
//!   endpoints;
//! - which source attachments have been uploaded, and their destination id.
//!
//! Entries are append-only. Re-marking an existing key with the same value is
//! a no-op; re-marking an origin with a *different* destination id is a
//! [`JournalError::Conflict`].
//!
//! Two implementations ship with the crate: [`MemoryJournal`] for tests and
//! ephemeral runs, and [`sqlite::SqliteJournal`] for resumable runs.

mod migrations;
mod schema;
pub mod sqlite;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ErrorCode;
use crate::model::{AttachmentId, WorkItemId};

pub use sqlite::{SqliteJournal, open_journal};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal schema version {found} is newer than the supported version {latest}")]
    SchemaTooNew { found: u32, latest: u32 },

    #[error("origin '{origin_id}' is journaled as work item {recorded}, not {attempted}")]
    Conflict {
        origin_id: String,
        recorded: WorkItemId,
        attempted: WorkItemId,
    },
}

impl JournalError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Sqlite(_) | Self::Io(_) | Self::SchemaTooNew { .. } => {
                ErrorCode::JournalWriteFailed
            }
            Self::Conflict { .. } => ErrorCode::InternalUnexpected,
        }
    }
}

/// Aggregate counts of journaled work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalProgress {
    pub items: usize,
    pub revisions: usize,
    pub attachments: usize,
}

/// Read/write contract of the migration journal.
///
/// Implementations must make each single-key write atomic and durable; no
/// cross-key transaction is required.
pub trait Journal: Send + Sync {
    /// # Errors
    ///
    /// Returns [`JournalError`] if the store cannot be read.
    fn is_revision_processed(&self, origin_id: &str, index: u32) -> Result<bool, JournalError>;

    /// Mark a revision replayed. Also records `origin_id → destination_id`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Conflict`] if `origin_id` is already mapped to
    /// another destination id, or a store error if the write fails.
    fn mark_revision_processed(
        &self,
        origin_id: &str,
        destination_id: WorkItemId,
        index: u32,
    ) -> Result<(), JournalError>;

    /// # Errors
    ///
    /// Returns [`JournalError`] if the store cannot be read.
    fn resolve_destination_id(&self, origin_id: &str) -> Result<Option<WorkItemId>, JournalError>;

    /// # Errors
    ///
    /// Returns [`JournalError`] if the store cannot be read.
    fn migrated_attachment(
        &self,
        attachment_origin_id: &str,
    ) -> Result<Option<AttachmentId>, JournalError>;

    /// Record an uploaded attachment. The first recorded id wins.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the write fails.
    fn mark_attachment_processed(
        &self,
        attachment_origin_id: &str,
        attachment_id: AttachmentId,
    ) -> Result<(), JournalError>;

    /// # Errors
    ///
    /// Returns [`JournalError`] if the store cannot be read.
    fn progress(&self) -> Result<JournalProgress, JournalError>;
}

#[derive(Debug, Default)]
struct MemoryEntries {
    items: BTreeMap<String, WorkItemId>,
    revisions: BTreeSet<(String, u32)>,
    attachments: BTreeMap<String, AttachmentId>,
}

/// Journal held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<MemoryEntries>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-record an `origin id → destination id` mapping, as if the item had
    /// been migrated by an earlier run.
    pub fn record_item(&self, origin_id: &str, destination_id: WorkItemId) {
        self.lock()
            .items
            .insert(origin_id.to_string(), destination_id);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Journal for MemoryJournal {
    fn is_revision_processed(&self, origin_id: &str, index: u32) -> Result<bool, JournalError> {
        Ok(self
            .lock()
            .revisions
            .contains(&(origin_id.to_string(), index)))
    }

    fn mark_revision_processed(
        &self,
        origin_id: &str,
        destination_id: WorkItemId,
        index: u32,
    ) -> Result<(), JournalError> {
        let mut entries = self.lock();
        if let Some(&recorded) = entries.items.get(origin_id)
            && recorded != destination_id
        {
            return Err(JournalError::Conflict {
                origin_id: origin_id.to_string(),
                recorded,
                attempted: destination_id,
            });
        }
        entries
            .items
            .insert(origin_id.to_string(), destination_id);
        entries.revisions.insert((origin_id.to_string(), index));
        drop(entries);
        Ok(())
    }

    fn resolve_destination_id(&self, origin_id: &str) -> Result<Option<WorkItemId>, JournalError> {
        Ok(self.lock().items.get(origin_id).copied())
    }

    fn migrated_attachment(
        &self,
        attachment_origin_id: &str,
    ) -> Result<Option<AttachmentId>, JournalError> {
        Ok(self.lock().attachments.get(attachment_origin_id).copied())
    }

    fn mark_attachment_processed(
        &self,
        attachment_origin_id: &str,
        attachment_id: AttachmentId,
    ) -> Result<(), JournalError> {
        self.lock()
            .attachments
            .entry(attachment_origin_id.to_string())
            .or_insert(attachment_id);
        Ok(())
    }

    fn progress(&self) -> Result<JournalProgress, JournalError> {
        let entries = self.lock();
        Ok(JournalProgress {
            items: entries.items.len(),
            revisions: entries.revisions.len(),
            attachments: entries.attachments.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_twice_is_a_no_op() -> Result<(), JournalError> {
        let journal = MemoryJournal::new();
        journal.mark_revision_processed("PRJ-1", 7, 0)?;
        journal.mark_revision_processed("PRJ-1", 7, 0)?;
        journal.mark_attachment_processed("att-1", 40)?;
        journal.mark_attachment_processed("att-1", 40)?;

        assert!(journal.is_revision_processed("PRJ-1", 0)?);
        assert!(!journal.is_revision_processed("PRJ-1", 1)?);
        assert_eq!(journal.resolve_destination_id("PRJ-1")?, Some(7));
        assert_eq!(journal.migrated_attachment("att-1")?, Some(40));
        assert_eq!(
            journal.progress()?,
            JournalProgress {
                items: 1,
                revisions: 1,
                attachments: 1
            }
        );
        Ok(())
    }

    #[test]
    fn remapping_an_origin_is_rejected() -> Result<(), JournalError> {
        let journal = MemoryJournal::new();
        journal.mark_revision_processed("PRJ-1", 7, 0)?;
        let err = journal
            .mark_revision_processed("PRJ-1", 8, 1)
            .expect_err("conflicting destination id");
        assert!(matches!(err, JournalError::Conflict { recorded: 7, .. }));
        assert!(err.to_string().contains("work item 7, not 8"));
        assert!(!journal.is_revision_processed("PRJ-1", 1)?);
        Ok(())
    }

    #[test]
    fn unknown_origins_resolve_to_none() -> Result<(), JournalError> {
        let journal = MemoryJournal::new();
        assert_eq!(journal.resolve_destination_id("PRJ-404")?, None);
        assert_eq!(journal.migrated_attachment("att-404")?, None);
        Ok(())
    }
}

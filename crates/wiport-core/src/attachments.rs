//! Attachment deltas and inline reference correction.
//!
//! Added attachments are staged on the work item and remembered per revision
//! by origin id; the journal is only written once the save that uploads them
//! succeeds. Removed attachments are located through the journal's
//! `origin id → attachment id` mapping.
//!
//! Description correction rewrites literal source file paths in the item's
//! narrative body with the permanent location of the uploaded attachment,
//! and moves the changed date just past the revision so the extra edit sorts
//! between real revisions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, warn};

use crate::destination::{AttachmentKey, DestinationError, WorkItemHandle};
use crate::error::ErrorCode;
use crate::journal::{Journal, JournalError};
use crate::model::{ChangeKind, FieldValue, Revision, WorkItemHistory, fields};

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("could not find migrated attachment '{attachment}'")]
    NotMigrated { attachment: String },

    #[error("failed to apply attachment '{attachment}': {source}")]
    Destination {
        attachment: String,
        #[source]
        source: DestinationError,
    },

    #[error("journal lookup failed: {0}")]
    Journal(#[from] JournalError),
}

impl AttachmentError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotMigrated { .. } => ErrorCode::AttachmentNotMigrated,
            Self::Destination { source, .. } => source.code(),
            Self::Journal(err) => err.code(),
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Destination { source, .. } if source.is_fatal())
    }
}

/// Result of applying one revision's attachment deltas.
#[derive(Debug, Default)]
pub struct AttachmentOutcome {
    /// Attachments staged by this revision: `origin id → handle key`.
    pub added: BTreeMap<String, AttachmentKey>,
    pub removed: usize,
    pub failures: Vec<AttachmentError>,
    pub note: Option<String>,
}

impl AttachmentOutcome {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies attachment deltas and corrects inline attachment references.
#[derive(Debug, Clone)]
pub struct AttachmentCorrelator {
    repro_steps_types: Vec<String>,
    correction_delta: Duration,
}

impl AttachmentCorrelator {
    #[must_use]
    pub const fn new(repro_steps_types: Vec<String>, correction_delta: Duration) -> Self {
        Self {
            repro_steps_types,
            correction_delta,
        }
    }

    /// Field holding the narrative body for `work_item_type`.
    #[must_use]
    pub fn description_field(&self, work_item_type: &str) -> &'static str {
        if self
            .repro_steps_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(work_item_type))
        {
            fields::REPRO_STEPS
        } else {
            fields::DESCRIPTION
        }
    }

    /// Stage additions and perform removals for `revision`.
    ///
    /// # Errors
    ///
    /// Returns fatal destination errors and journal errors. Everything else
    /// is collected in the outcome.
    pub fn apply<J, H>(
        &self,
        journal: &J,
        item: &mut H,
        revision: &Revision,
    ) -> Result<AttachmentOutcome, AttachmentError>
    where
        J: Journal + ?Sized,
        H: WorkItemHandle,
    {
        let mut outcome = AttachmentOutcome::default();

        for change in &revision.attachments {
            debug!("Applying attachment change [{:?}] '{change}'.", change.change);
            match change.change {
                ChangeKind::Added => match item.add_attachment(&change.file_path, &change.comment) {
                    Ok(key) => {
                        outcome.added.insert(change.origin_id.clone(), key);
                    }
                    Err(source) => {
                        let err = AttachmentError::Destination {
                            attachment: change.to_string(),
                            source,
                        };
                        if err.is_fatal() {
                            return Err(err);
                        }
                        error!("{err}");
                        outcome.failures.push(err);
                    }
                },
                ChangeKind::Removed => {
                    let key = identify(journal, item, &change.origin_id)?;
                    if key.is_some_and(|key| item.remove_attachment(key)) {
                        outcome.removed += 1;
                    } else {
                        let err = AttachmentError::NotMigrated {
                            attachment: change.to_string(),
                        };
                        error!("{err}");
                        outcome.failures.push(err);
                    }
                }
            }
        }

        let removed: Vec<String> = revision
            .removed_attachments()
            .map(ToString::to_string)
            .collect();
        if !removed.is_empty() {
            outcome.note = Some(format!("Removed attachment(s): {}", removed.join(";")));
        }

        Ok(outcome)
    }

    /// Replace literal attachment paths in the narrative body with the
    /// uploaded locations.
    ///
    /// `staged` holds attachments added by the current revision; older ones
    /// are found through the journal. Returns `true` only if at least one
    /// reference was replaced, in which case the changed date and author are
    /// also set.
    ///
    /// # Errors
    ///
    /// Returns journal lookup failures and destination write failures.
    pub fn correct_description<J, H>(
        &self,
        journal: &J,
        item: &mut H,
        history: &WorkItemHistory,
        revision: &Revision,
        staged: &BTreeMap<String, AttachmentKey>,
    ) -> Result<bool, AttachmentError>
    where
        J: Journal + ?Sized,
        H: WorkItemHandle,
    {
        let field = self.description_field(item.work_item_type());
        let Some(mut text) = item.field(field).and_then(FieldValue::into_text) else {
            return Ok(false);
        };
        if text.trim().is_empty() {
            return Ok(false);
        }

        let mut replaced = false;
        for attachment in history.added_attachments() {
            if !text.contains(&attachment.file_path) {
                continue;
            }

            let key = match staged.get(&attachment.origin_id) {
                Some(&key) => Some(key),
                None => identify(journal, item, &attachment.origin_id)?,
            };
            let uri = key.and_then(|key| {
                item.attachments()
                    .iter()
                    .find(|a| a.key == key)
                    .and_then(|a| a.persisted.as_ref())
                    .map(|p| p.uri.clone())
            });

            if let Some(uri) = uri {
                text = text.replace(&attachment.file_path, &uri);
                replaced = true;
            } else {
                let target = item
                    .id()
                    .map_or_else(|| "new".to_string(), |id| id.to_string());
                warn!(
                    "Attachment '{attachment}' is missing from {}/{target}; reference kept.",
                    history.origin_id
                );
            }
        }

        if !replaced {
            return Ok(false);
        }

        let next = history.next_revision(revision.index).map(|r| r.time);
        let changed = next_valid_delta(revision.time, next, self.correction_delta);
        let updates = [
            (field, FieldValue::String(text)),
            (fields::CHANGED_DATE, FieldValue::Date(changed)),
            (fields::CHANGED_BY, FieldValue::Identity(revision.author.clone())),
        ];
        for (reference, value) in updates {
            item.set_field(reference, value)
                .map_err(|source| AttachmentError::Destination {
                    attachment: format!("{field} correction"),
                    source,
                })?;
        }
        debug!("Corrected {field} on '{revision}', changed date {changed}.");
        Ok(true)
    }
}

/// Handle key of the attachment the journal maps `origin_id` to, if it is
/// present on `item`.
fn identify<J, H>(
    journal: &J,
    item: &H,
    origin_id: &str,
) -> Result<Option<AttachmentKey>, JournalError>
where
    J: Journal + ?Sized,
    H: WorkItemHandle,
{
    let Some(id) = journal.migrated_attachment(origin_id)? else {
        return Ok(None);
    };
    Ok(item
        .attachments()
        .iter()
        .find(|a| a.persisted.as_ref().is_some_and(|p| p.id == id))
        .map(|a| a.key))
}

/// Timestamp for an extra edit that belongs to the revision at `current`.
///
/// Prefers `current + delta`. When that would reach `next`, uses the
/// midpoint between the two.
///
/// When `next` is at most one nanosecond after `current`, equal timestamps
/// included, no instant lies strictly between them. The result is then
/// `current + 1ns`, which does not sort before `next`, and a warning is
/// logged.
#[must_use]
pub fn next_valid_delta(
    current: DateTime<Utc>,
    next: Option<DateTime<Utc>>,
    delta: Duration,
) -> DateTime<Utc> {
    let one_ns = TimeDelta::nanoseconds(1);
    let after = |offset: TimeDelta| current.checked_add_signed(offset).unwrap_or(current);

    let preferred = after(TimeDelta::from_std(delta).unwrap_or(one_ns).max(one_ns));
    let Some(next) = next else {
        return preferred;
    };
    if preferred < next {
        return preferred;
    }

    let half = (next - current) / 2;
    if half > TimeDelta::zero() {
        after(half)
    } else {
        warn!("no room between revisions at {current} and {next}; correction lands 1ns after");
        after(one_ns)
    }
}

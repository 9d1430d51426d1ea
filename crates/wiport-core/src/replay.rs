//! Revision replay: the per-item state machine.
//!
//! # Overview
//!
//! A [`RevisionReplayer`] walks one item's history in index order. Each
//! revision runs through the same steps:
//!
//! 1. Skip it if the journal already marks `(origin id, index)` processed.
//! 2. Open the destination item: created for revision 0, fetched by the
//!    journaled id afterwards.
//! 3. Normalise the mandatory fields (classification defaults at index 0,
//!    created/changed dates and authors, assignee).
//! 4. Apply attachment deltas, then field deltas (classification paths go
//!    through the [`ClassificationResolver`]), then link deltas.
//! 5. Correct inline attachment references, before or after the save
//!    depending on whether this revision uploads new attachments.
//! 6. Save, mark the revision and its uploaded attachments in the journal,
//!    and close the edit session.
//!
//! Failures of individual fields, attachments, or links make the revision
//! *incomplete*: the partial state is still saved and journaled, and an
//! error is logged. A failed save ends the item. A fatal destination error
//! ends the item with [`EntityState::AbortedFatal`] so the runner can stop.
//!
//! ```text
//!   NotStarted ──► InProgress(0) ──► InProgress(1) ──► … ──► Completed
//!                       │                  │
//!                       ├──► Failed(i)     ├──► AbortedFatal(i)
//! ```

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::attachments::{AttachmentCorrelator, AttachmentError, AttachmentOutcome};
use crate::classification::{ClassificationError, ClassificationResolver};
use crate::config::MigrationConfig;
use crate::destination::{Destination, DestinationError, TreeKind, WorkItemHandle};
use crate::error::ErrorCode;
use crate::journal::{Journal, JournalError};
use crate::links::{LinkError, LinkResolver};
use crate::model::fields::{self, FieldSet, same_reference};
use crate::model::{FieldChange, FieldValue, Revision, WorkItemHistory, WorkItemId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that end the replay of one item.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("'{revision}' has no destination work item; revision 0 was never replayed")]
    MissingWorkItem { revision: String },

    #[error("destination failure on '{revision}': {source}")]
    Destination {
        revision: String,
        #[source]
        source: DestinationError,
    },

    #[error("failed to save '{revision}': {source}")]
    Save {
        revision: String,
        #[source]
        source: DestinationError,
    },

    #[error("'{revision}' was saved but has no destination id")]
    Unsaved { revision: String },

    #[error("journal error on '{revision}': {source}")]
    Journal {
        revision: String,
        #[source]
        source: JournalError,
    },

    #[error("migration aborted on '{revision}': {source}")]
    Aborted {
        revision: String,
        #[source]
        source: DestinationError,
    },
}

impl ReplayError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingWorkItem { .. } => ErrorCode::WorkItemNotFound,
            Self::Destination { source, .. } | Self::Save { source, .. } => source.code(),
            Self::Unsaved { .. } => ErrorCode::InternalUnexpected,
            Self::Journal { source, .. } => source.code(),
            Self::Aborted { .. } => ErrorCode::MigrationAborted,
        }
    }

    /// The whole run must stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    fn destination(revision: &Revision, source: DestinationError) -> Self {
        let revision = revision.to_string();
        if source.is_fatal() {
            Self::Aborted { revision, source }
        } else {
            Self::Destination { revision, source }
        }
    }

    fn save(revision: &Revision, source: DestinationError) -> Self {
        if source.is_fatal() {
            Self::destination(revision, source)
        } else {
            Self::Save {
                revision: revision.to_string(),
                source,
            }
        }
    }

    fn journal(revision: &Revision, source: JournalError) -> Self {
        Self::Journal {
            revision: revision.to_string(),
            source,
        }
    }

    fn from_link(revision: &Revision, err: LinkError) -> Self {
        match err {
            LinkError::Journal(source) => Self::journal(revision, source),
            LinkError::Destination { source, .. } => Self::destination(revision, source),
            other => Self::destination(revision, DestinationError::Request(other.to_string())),
        }
    }

    fn from_attachment(revision: &Revision, err: AttachmentError) -> Self {
        match err {
            AttachmentError::Journal(source) => Self::journal(revision, source),
            AttachmentError::Destination { source, .. } => Self::destination(revision, source),
            other @ AttachmentError::NotMigrated { .. } => {
                Self::destination(revision, DestinationError::Request(other.to_string()))
            }
        }
    }
}

/// A single field that could not be written.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("'{field}' expects a text value, got '{value}'")]
    NotText { field: String, value: FieldValue },

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("'{field}': {source}")]
    Destination {
        field: String,
        #[source]
        source: DestinationError,
    },
}

impl FieldError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotText { .. } => ErrorCode::FieldRejected,
            Self::Classification(err) => err.code(),
            Self::Destination { source, .. } => source.code(),
        }
    }

    fn into_fatal(self) -> Result<Self, DestinationError> {
        match self {
            Self::Destination { source, .. } if source.is_fatal() => Err(source),
            Self::Classification(ClassificationError::Create { source, .. })
                if source.is_fatal() =>
            {
                Err(source)
            }
            other => Ok(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Replay state of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    NotStarted,
    InProgress(u32),
    Completed,
    /// Replay of this item stopped at the given revision.
    Failed(u32),
    /// A fatal destination error at the given revision stopped the run.
    AbortedFatal(u32),
}

/// What happened to one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// Already journaled by an earlier run.
    Skipped,
    Applied {
        destination_id: WorkItemId,
        /// `false` when some field, attachment, or link delta failed.
        complete: bool,
    },
}

/// Per-item replay report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    pub origin_id: String,
    pub destination_id: Option<WorkItemId>,
    pub state: EntityState,
    pub applied: Vec<u32>,
    pub skipped: Vec<u32>,
    /// Applied revisions that were saved with some deltas missing.
    pub incomplete: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityOutcome {
    #[must_use]
    pub fn not_started(origin_id: &str) -> Self {
        Self {
            origin_id: origin_id.to_string(),
            destination_id: None,
            state: EntityState::NotStarted,
            applied: Vec::new(),
            skipped: Vec::new(),
            incomplete: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.state, EntityState::AbortedFatal(_))
    }
}

// ---------------------------------------------------------------------------
// Field normalisation
// ---------------------------------------------------------------------------

/// Mutable copy of `revision`'s fields with the mandatory entries filled in.
///
/// - Index 0 gets empty area/iteration entries so path mapping always runs,
///   plus created date/author from the revision when missing.
/// - Changed date/author come from the revision when missing.
/// - The assignee is always written: the revision's value wins (an explicit
///   null clears it), otherwise `current_assignee` is re-applied.
#[must_use]
pub fn normalize_fields(revision: &Revision, current_assignee: Option<FieldValue>) -> FieldSet {
    let mut fields = FieldSet::new(revision.fields.clone());
    let text = |s: &str| Some(FieldValue::String(s.to_string()));
    let author = || Some(FieldValue::Identity(revision.author.clone()));
    let time = || Some(FieldValue::Date(revision.time));

    if revision.index == 0 {
        fields.insert_if_absent(fields::AREA_PATH, text(""));
        fields.insert_if_absent(fields::ITERATION_PATH, text(""));
        fields.insert_if_absent(fields::CREATED_DATE, time());
        fields.insert_if_absent(fields::CREATED_BY, author());
    }
    fields.insert_if_absent(fields::CHANGED_DATE, time());
    fields.insert_if_absent(fields::CHANGED_BY, author());

    let assignee = match fields.get(fields::ASSIGNED_TO).map(|f| f.value.clone()) {
        Some(Some(value)) => Some(value),
        Some(None) => Some(FieldValue::Identity(String::new())),
        None => current_assignee,
    };
    fields.replace(fields::ASSIGNED_TO, assignee);
    fields
}

/// Join a configured base path and a source value with `/`. Blank parts are
/// dropped.
#[must_use]
pub fn compose_path(base: &str, value: &str) -> String {
    match (base.trim().is_empty(), value.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => base.to_string(),
        (true, false) => value.to_string(),
        (false, false) => format!("{base}/{value}"),
    }
}

// ---------------------------------------------------------------------------
// Replayer
// ---------------------------------------------------------------------------

/// Replays item histories into a destination. Shared by all workers.
pub struct RevisionReplayer<'a, D: Destination, J: Journal + ?Sized> {
    destination: &'a D,
    journal: &'a J,
    classifications: &'a ClassificationResolver,
    links: &'a LinkResolver,
    attachments: AttachmentCorrelator,
    config: &'a MigrationConfig,
}

impl<'a, D: Destination, J: Journal + ?Sized> RevisionReplayer<'a, D, J> {
    #[must_use]
    pub fn new(
        destination: &'a D,
        journal: &'a J,
        classifications: &'a ClassificationResolver,
        links: &'a LinkResolver,
        config: &'a MigrationConfig,
    ) -> Self {
        Self {
            destination,
            journal,
            classifications,
            links,
            attachments: AttachmentCorrelator::new(
                config.replay.repro_steps_types.clone(),
                config.replay.correction_delta(),
            ),
            config,
        }
    }

    #[must_use]
    pub const fn journal(&self) -> &J {
        self.journal
    }

    /// Replay every revision of `history` in order.
    pub fn replay_item(&self, history: &WorkItemHistory) -> EntityOutcome {
        let span = info_span!("replay_item", origin_id = %history.origin_id);
        let _guard = span.enter();

        let mut outcome = EntityOutcome::not_started(&history.origin_id);
        for revision in &history.revisions {
            outcome.state = EntityState::InProgress(revision.index);
            match self.replay_revision(history, revision) {
                Ok(RevisionOutcome::Skipped) => outcome.skipped.push(revision.index),
                Ok(RevisionOutcome::Applied {
                    destination_id,
                    complete,
                }) => {
                    outcome.destination_id = Some(destination_id);
                    outcome.applied.push(revision.index);
                    if !complete {
                        outcome.incomplete.push(revision.index);
                    }
                }
                Err(err) => {
                    error!("[{}] Failed to import revisions: {err}", err.code());
                    outcome.state = if err.is_fatal() {
                        EntityState::AbortedFatal(revision.index)
                    } else {
                        EntityState::Failed(revision.index)
                    };
                    outcome.error = Some(format!("{}: {err}", err.code()));
                    break;
                }
            }
        }

        if outcome.destination_id.is_none() {
            outcome.destination_id = self
                .journal
                .resolve_destination_id(&history.origin_id)
                .unwrap_or_else(|err| {
                    warn!("could not read destination id from journal: {err}");
                    None
                });
        }
        if matches!(outcome.state, EntityState::InProgress(_) | EntityState::NotStarted) {
            outcome.state = EntityState::Completed;
            info!(
                applied = outcome.applied.len(),
                skipped = outcome.skipped.len(),
                incomplete = outcome.incomplete.len(),
                "Item replayed."
            );
        }
        outcome
    }

    /// Replay one revision of `history`.
    ///
    /// # Errors
    ///
    /// Returns an error when the item cannot be opened or saved, when the
    /// journal fails, or when the destination reports a fatal failure
    /// ([`ReplayError::Aborted`]).
    pub fn replay_revision(
        &self,
        history: &WorkItemHistory,
        revision: &Revision,
    ) -> Result<RevisionOutcome, ReplayError> {
        let processed = self
            .journal
            .is_revision_processed(&history.origin_id, revision.index)
            .map_err(|source| ReplayError::journal(revision, source))?;
        if processed {
            debug!("Skipped processing of '{revision}' (already migrated).");
            return Ok(RevisionOutcome::Skipped);
        }

        let mut item = self.open_item(history, revision)?;
        let result = self.apply_revision(history, revision, &mut item);
        item.close();
        result
    }

    fn open_item(
        &self,
        history: &WorkItemHistory,
        revision: &Revision,
    ) -> Result<D::Item, ReplayError> {
        let existing = self
            .journal
            .resolve_destination_id(&history.origin_id)
            .map_err(|source| ReplayError::journal(revision, source))?;

        let mut item = match existing {
            Some(id) => self.destination.get_work_item(id),
            None if revision.index == 0 => {
                self.destination.create_work_item(&history.work_item_type)
            }
            None => {
                return Err(ReplayError::MissingWorkItem {
                    revision: revision.to_string(),
                });
            }
        }
        .map_err(|source| ReplayError::destination(revision, source))?;

        if !item.is_open() {
            item.open()
                .map_err(|source| ReplayError::destination(revision, source))?;
        }
        Ok(item)
    }

    fn apply_revision(
        &self,
        history: &WorkItemHistory,
        revision: &Revision,
        item: &mut D::Item,
    ) -> Result<RevisionOutcome, ReplayError> {
        let fields = normalize_fields(revision, item.field(fields::ASSIGNED_TO));
        let mut incomplete = false;
        let mut notes = Vec::new();

        let attachments = if revision.attachments.is_empty() {
            AttachmentOutcome::default()
        } else {
            self.attachments
                .apply(self.journal, item, revision)
                .map_err(|err| ReplayError::from_attachment(revision, err))?
        };
        incomplete |= !attachments.is_complete();
        notes.extend(attachments.note.clone());

        incomplete |= !self.apply_fields(revision, &fields, item)?;

        if !revision.links.is_empty() {
            let links = self
                .links
                .apply(self.destination, self.journal, item, &revision.links)
                .map_err(|err| ReplayError::from_link(revision, err))?;
            incomplete |= !links.is_complete();
            notes.extend(links.note);
        }

        if !notes.is_empty() {
            incomplete |= !Self::write_notes(revision, &fields, notes, item)?;
        }

        if incomplete {
            error!("'{revision}' - not all changes were saved.");
        }

        let adds_attachments = revision.adds_attachments();
        if !adds_attachments && revision.attachment_references {
            debug!("Correcting description on '{revision}'.");
            self.correct_description(history, revision, item, &attachments)?;
        }

        Self::save(revision, item)?;

        if adds_attachments && revision.attachment_references {
            debug!("Correcting description on separate revision on '{revision}'.");
            if self.correct_description(history, revision, item, &attachments)? {
                match Self::save(revision, item) {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => error!("Failed to correct description for '{revision}': {err}"),
                }
            }
        }

        let destination_id = item.id().ok_or_else(|| ReplayError::Unsaved {
            revision: revision.to_string(),
        })?;
        self.journal
            .mark_revision_processed(&history.origin_id, destination_id, revision.index)
            .map_err(|source| ReplayError::journal(revision, source))?;

        for (origin_id, key) in &attachments.added {
            let persisted = item
                .attachments()
                .iter()
                .find(|a| a.key == *key)
                .and_then(|a| a.persisted.as_ref());
            if let Some(persisted) = persisted {
                self.journal
                    .mark_attachment_processed(origin_id, persisted.id)
                    .map_err(|source| ReplayError::journal(revision, source))?;
            }
        }

        debug!("Imported revision '{revision}' into {destination_id}.");
        Ok(RevisionOutcome::Applied {
            destination_id,
            complete: !incomplete,
        })
    }

    /// Write normalised fields. Returns `false` if any field failed.
    fn apply_fields(
        &self,
        revision: &Revision,
        fields: &FieldSet,
        item: &mut D::Item,
    ) -> Result<bool, ReplayError> {
        let mut success = true;

        for change in fields.iter() {
            let result = if same_reference(&change.reference_name, fields::AREA_PATH) {
                self.map_classification(change, TreeKind::Area, item)
            } else if same_reference(&change.reference_name, fields::ITERATION_PATH) {
                self.map_classification(change, TreeKind::Iteration, item)
            } else if let Some(value) = &change.value {
                item.set_field(&change.reference_name, value.clone())
                    .map(|()| debug!("Mapped '{}' '{value}'.", change.reference_name))
                    .map_err(|source| FieldError::Destination {
                        field: change.reference_name.clone(),
                        source,
                    })
            } else {
                Ok(())
            };

            if let Err(err) = result {
                let err = err
                    .into_fatal()
                    .map_err(|source| ReplayError::destination(revision, source))?;
                error!("[{}] Failed to update fields on '{revision}': {err}", err.code());
                success = false;
            }
        }

        Ok(success)
    }

    fn map_classification(
        &self,
        change: &FieldChange,
        tree: TreeKind,
        item: &mut D::Item,
    ) -> Result<(), FieldError> {
        let value = match &change.value {
            None => "",
            Some(value) => value.as_text().ok_or_else(|| FieldError::NotText {
                field: change.reference_name.clone(),
                value: value.clone(),
            })?,
        };
        let (base, reference) = match tree {
            TreeKind::Area => (&self.config.base_area_path, fields::AREA_PATH),
            TreeKind::Iteration => (&self.config.base_iteration_path, fields::ITERATION_PATH),
        };

        let path = compose_path(base, value);
        let mapped = if path.trim().is_empty() {
            self.config.project.clone()
        } else {
            self.classifications.ensure(self.destination, &path, tree)?;
            let separator = self.destination.path_separator().to_string();
            format!(
                "{}{separator}{}",
                self.config.project,
                path.replace('/', &separator)
            )
        };

        item.set_field(reference, FieldValue::String(mapped.clone()))
            .map_err(|source| FieldError::Destination {
                field: reference.to_string(),
                source,
            })?;
        debug!("Mapped {tree} path '{mapped}'.");
        Ok(())
    }

    /// Append the revision's attachment/link notes after its own history
    /// text. Returns `false` if the write failed.
    fn write_notes(
        revision: &Revision,
        fields: &FieldSet,
        notes: Vec<String>,
        item: &mut D::Item,
    ) -> Result<bool, ReplayError> {
        let own = fields
            .get(fields::HISTORY)
            .and_then(|c| c.value.as_ref())
            .and_then(FieldValue::as_text)
            .filter(|text| !text.trim().is_empty())
            .map(str::to_owned);
        let text = own.into_iter().chain(notes).collect::<Vec<_>>().join("\n");

        match item.set_field(fields::HISTORY, FieldValue::String(text)) {
            Ok(()) => Ok(true),
            Err(source) if source.is_fatal() => Err(ReplayError::destination(revision, source)),
            Err(source) => {
                error!("Failed to write history note on '{revision}': {source}");
                Ok(false)
            }
        }
    }

    fn correct_description(
        &self,
        history: &WorkItemHistory,
        revision: &Revision,
        item: &mut D::Item,
        attachments: &AttachmentOutcome,
    ) -> Result<bool, ReplayError> {
        match self.attachments.correct_description(
            self.journal,
            item,
            history,
            revision,
            &attachments.added,
        ) {
            Ok(corrected) => Ok(corrected),
            Err(err) if err.is_fatal() => Err(ReplayError::from_attachment(revision, err)),
            Err(err) => {
                error!("Failed to correct description for '{revision}': {err}");
                Ok(false)
            }
        }
    }

    /// Validate, then save. A rejected attachment is dropped and the save is
    /// retried once.
    fn save(revision: &Revision, item: &mut D::Item) -> Result<(), ReplayError> {
        for issue in item.validate() {
            info!(
                "Field: '{}', Status: '{}', Value: '{}'",
                issue.name,
                issue.status,
                issue.value.map(|v| v.to_string()).unwrap_or_default()
            );
        }

        match item.save() {
            Ok(()) => Ok(()),
            Err(DestinationError::AttachmentRejected { key, name, reason }) => {
                warn!(
                    "[{}] {reason}. Attachment {name}({key}) in '{revision}' will be skipped.",
                    ErrorCode::AttachmentRejected
                );
                item.remove_attachment(key);
                item.save()
                    .map_err(|source| ReplayError::save(revision, source))
            }
            Err(source) => Err(ReplayError::save(revision, source)),
        }
    }
}

//! Destination work-tracking API consumed by the replay engine.
//!
//! The engine never talks to a transport directly. Work item edit sessions,
//! classification trees, link metadata and project bootstrap are expressed as
//! the traits in this module, so a REST client or the [`memory`] backend can
//! be plugged in.
//!
//! # Traits
//!
//! - [`Destination`]: work item factory plus classification and link-type
//!   metadata. Shared across worker threads.
//! - [`WorkItemHandle`]: one bounded edit session on a single work item.
//! - [`LinkGraph`]: neighbour lookup used by cycle avoidance.
//! - [`ProjectAdmin`]: project lookup/creation with long-running operations.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorCode;
use crate::model::{AttachmentId, FieldValue, WorkItemId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a destination backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    /// The destination refused one specific attachment (size, type, ...).
    /// The save may be retried after removing it.
    #[error("attachment '{name}' rejected: {reason}")]
    AttachmentRejected {
        key: AttachmentKey,
        name: String,
        reason: String,
    },

    #[error("work item {0} not found")]
    NotFound(WorkItemId),

    #[error("field '{field}' rejected: {reason}")]
    FieldRejected { field: String, reason: String },

    #[error("work item edit session is not open")]
    SessionClosed,

    #[error("destination request failed: {0}")]
    Request(String),

    /// Unrecoverable failure; the whole migration run must stop.
    #[error("unrecoverable destination failure: {0}")]
    Fatal(String),
}

impl DestinationError {
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AttachmentRejected { .. } => ErrorCode::AttachmentRejected,
            Self::NotFound(_) => ErrorCode::WorkItemNotFound,
            Self::FieldRejected { .. } => ErrorCode::FieldRejected,
            Self::SessionClosed | Self::Request(_) => ErrorCode::SaveFailed,
            Self::Fatal(_) => ErrorCode::MigrationAborted,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification trees
// ---------------------------------------------------------------------------

/// The two independently scoped classification hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Iteration,
    Area,
}

impl TreeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Iteration => "iteration",
            Self::Area => "area",
        }
    }
}

impl fmt::Display for TreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of a classification tree as reported by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationNode {
    pub id: i64,
    pub name: String,
    pub children: Vec<Self>,
}

impl ClassificationNode {
    #[must_use]
    pub fn leaf(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            children: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndKind {
    Forward,
    Reverse,
}

/// A typed relation kind known to the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkType {
    pub reference_name: String,
    pub is_directional: bool,
    /// Relations of this type must never form a cycle.
    pub is_non_circular: bool,
}

impl LinkType {
    #[must_use]
    pub fn new(reference_name: &str, is_directional: bool, is_non_circular: bool) -> Self {
        Self {
            reference_name: reference_name.to_string(),
            is_directional,
            is_non_circular,
        }
    }

    #[must_use]
    pub fn forward_end(&self) -> LinkTypeEnd {
        self.end(EndKind::Forward)
    }

    #[must_use]
    pub fn reverse_end(&self) -> LinkTypeEnd {
        self.end(EndKind::Reverse)
    }

    fn end(&self, kind: EndKind) -> LinkTypeEnd {
        LinkTypeEnd {
            link_type: self.reference_name.clone(),
            kind: if self.is_directional {
                kind
            } else {
                EndKind::Forward
            },
            is_directional: self.is_directional,
            is_non_circular: self.is_non_circular,
        }
    }
}

/// One directional role of a [`LinkType`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkTypeEnd {
    pub link_type: String,
    pub kind: EndKind,
    pub is_directional: bool,
    pub is_non_circular: bool,
}

impl LinkTypeEnd {
    /// Stable end name, e.g. `System.LinkTypes.Hierarchy-Forward`.
    /// Non-directional types use the bare reference name.
    #[must_use]
    pub fn immutable_name(&self) -> String {
        if self.is_directional {
            format!("{}-{:?}", self.link_type, self.kind)
        } else {
            self.link_type.clone()
        }
    }

    /// The other end of the same type. Non-directional ends are their own
    /// opposite.
    #[must_use]
    pub fn opposite(&self) -> Self {
        let kind = match (self.is_directional, self.kind) {
            (false, kind) => kind,
            (true, EndKind::Forward) => EndKind::Reverse,
            (true, EndKind::Reverse) => EndKind::Forward,
        };
        Self {
            kind,
            ..self.clone()
        }
    }
}

impl fmt::Display for LinkTypeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.immutable_name())
    }
}

/// A relation from the edited work item to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelatedLink {
    pub end: LinkTypeEnd,
    pub target: WorkItemId,
}

// ---------------------------------------------------------------------------
// Attachments and validation
// ---------------------------------------------------------------------------

/// Handle-local identity of an attachment, stable for the lifetime of one
/// edit session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachmentKey(pub u64);

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAttachment {
    pub id: AttachmentId,
    /// Permanent location of the uploaded file.
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub key: AttachmentKey,
    pub file_path: String,
    pub comment: String,
    /// Set once the attachment has been saved with its work item.
    pub persisted: Option<PersistedAttachment>,
}

/// A validation complaint reported before save.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldIssue {
    pub name: String,
    pub status: String,
    pub value: Option<FieldValue>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One bounded edit session on a destination work item.
pub trait WorkItemHandle {
    /// Destination id; `None` until a newly created item is first saved.
    fn id(&self) -> Option<WorkItemId>;

    fn work_item_type(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Start (or resume) a partial-open edit session.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination refuses the session.
    fn open(&mut self) -> Result<(), DestinationError>;

    /// Release the edit session. Unsaved changes are discarded.
    fn close(&mut self);

    fn field(&self, reference: &str) -> Option<FieldValue>;

    /// # Errors
    ///
    /// Returns [`DestinationError::FieldRejected`] if the field does not
    /// exist or cannot hold `value`.
    fn set_field(&mut self, reference: &str, value: FieldValue) -> Result<(), DestinationError>;

    fn attachments(&self) -> &[Attachment];

    /// # Errors
    ///
    /// Returns an error if the session is closed.
    fn add_attachment(
        &mut self,
        file_path: &str,
        comment: &str,
    ) -> Result<AttachmentKey, DestinationError>;

    /// Returns `false` when no attachment with `key` is present.
    fn remove_attachment(&mut self, key: AttachmentKey) -> bool;

    fn links(&self) -> &[RelatedLink];

    /// Returns `Ok(false)` when an identical relation already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed.
    fn add_link(&mut self, link: RelatedLink) -> Result<bool, DestinationError>;

    fn remove_link(&mut self, link: &RelatedLink) -> bool;

    fn validate(&self) -> Vec<FieldIssue>;

    /// Commit the session with merge semantics.
    ///
    /// # Errors
    ///
    /// Returns [`DestinationError::AttachmentRejected`] when one attachment
    /// blocks the save, or another error if the commit fails.
    fn save(&mut self) -> Result<(), DestinationError>;
}

/// Neighbour lookup over persisted relations.
pub trait LinkGraph {
    /// First item that `item` links to through `end`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `item` cannot be read.
    fn next_linked(
        &self,
        item: WorkItemId,
        end: &LinkTypeEnd,
    ) -> Result<Option<WorkItemId>, DestinationError>;
}

/// Work item factory and metadata access, shared by all replay workers.
pub trait Destination: LinkGraph + Send + Sync {
    type Item: WorkItemHandle;

    /// A new, unsaved work item with an open edit session.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot create items.
    fn create_work_item(&self, work_item_type: &str) -> Result<Self::Item, DestinationError>;

    /// # Errors
    ///
    /// Returns [`DestinationError::NotFound`] if no item has `id`.
    fn get_work_item(&self, id: WorkItemId) -> Result<Self::Item, DestinationError>;

    /// # Errors
    ///
    /// Returns an error if link metadata cannot be fetched.
    fn link_types(&self) -> Result<Vec<LinkType>, DestinationError>;

    /// Root node of `tree` with its full subtree.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be fetched.
    fn classification_tree(&self, tree: TreeKind) -> Result<ClassificationNode, DestinationError>;

    /// Create-or-update a node named `name` under `parent_path`
    /// (`None` = tree root). Paths are `/`-delimited and exclude the root.
    ///
    /// # Errors
    ///
    /// Returns an error if `parent_path` does not exist or the node cannot
    /// be written.
    fn create_classification_node(
        &self,
        tree: TreeKind,
        parent_path: Option<&str>,
        name: &str,
    ) -> Result<ClassificationNode, DestinationError>;

    /// Drop cached metadata that depends on classification tree shape.
    fn refresh_metadata(&self) {}

    /// Separator used when writing classification paths into fields.
    fn path_separator(&self) -> char {
        '\\'
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRequest {
    pub name: String,
    pub description: String,
    pub process_template: String,
    pub version_control: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed(String),
}

impl OperationState {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// Project lookup and creation.
pub trait ProjectAdmin {
    /// # Errors
    ///
    /// Returns an error if the lookup request fails.
    fn get_project(&self, name: &str) -> Result<Option<ProjectInfo>, DestinationError>;

    /// # Errors
    ///
    /// Returns an error if the creation cannot be queued.
    fn queue_create_project(
        &self,
        request: &ProjectRequest,
    ) -> Result<OperationId, DestinationError>;

    /// # Errors
    ///
    /// Returns an error if the operation status cannot be read.
    fn operation(&self, id: OperationId) -> Result<OperationState, DestinationError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Dynamically typed field value carried by a source revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Date(DateTime<Utc>),
    /// A user identity (display name or unique name).
    Identity(String),
}

impl FieldValue {
    /// Text content of string-like values. Numbers and dates return `None`.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Identity(s) => Some(s),
            Self::Number(_) | Self::Date(_) => None,
        }
    }

    /// Owned text content of string-like values.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::String(s) | Self::Identity(s) => Some(s),
            Self::Number(_) | Self::Date(_) => None,
        }
    }

    /// Returns `true` for string-like values that are empty or whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.as_text().is_some_and(|s| s.trim().is_empty())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Identity(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

/// A single `(reference name, value)` pair. A `None` value is skipped when
/// applied, never written as a clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub reference_name: String,
    #[serde(default)]
    pub value: Option<FieldValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Requested end of a typed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkDirection {
    Forward,
    Reverse,
    None,
}

/// Link delta keyed by origin ids. Destination ids are resolved through the
/// journal when the change is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChange {
    pub change: ChangeKind,
    /// Destination link type reference name, optionally suffixed with
    /// `-Forward` or `-Reverse`.
    pub link_type: String,
    pub source_origin_id: String,
    pub target_origin_id: String,
}

impl LinkChange {
    /// Separator between the type reference name and the direction token.
    pub const DIRECTION_SEPARATOR: char = '-';

    /// Split the type key into its reference name and requested direction.
    ///
    /// Returns `Err(token)` when a direction token is present but is neither
    /// `Forward` nor `Reverse`.
    pub fn type_and_direction(&self) -> Result<(&str, LinkDirection), &str> {
        match self.link_type.rsplit_once(Self::DIRECTION_SEPARATOR) {
            Some((name, "Forward")) => Ok((name, LinkDirection::Forward)),
            Some((name, "Reverse")) => Ok((name, LinkDirection::Reverse)),
            Some((_, token)) => Err(token),
            None => Ok((self.link_type.as_str(), LinkDirection::None)),
        }
    }
}

impl fmt::Display for LinkChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} '{}' -> '{}'",
            self.change, self.link_type, self.source_origin_id, self.target_origin_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentChange {
    pub change: ChangeKind,
    pub origin_id: String,
    pub file_path: String,
    #[serde(default)]
    pub comment: String,
}

impl AttachmentChange {
    /// Final path component, used in notes and logs.
    #[must_use]
    pub fn file_name(&self) -> &str {
        Path::new(&self.file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.file_path)
    }
}

impl fmt::Display for AttachmentChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.file_name(), self.origin_id)
    }
}

/// One atomic change record in a source item's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub index: u32,
    /// Origin id of the owning item.
    pub origin_id: String,
    pub time: DateTime<Utc>,
    pub author: String,
    #[serde(default)]
    pub fields: Vec<FieldChange>,
    #[serde(default)]
    pub links: Vec<LinkChange>,
    #[serde(default)]
    pub attachments: Vec<AttachmentChange>,
    /// The narrative text may reference attachment file paths.
    #[serde(default)]
    pub attachment_references: bool,
}

impl Revision {
    pub fn added_attachments(&self) -> impl Iterator<Item = &AttachmentChange> {
        self.attachments
            .iter()
            .filter(|a| a.change == ChangeKind::Added)
    }

    pub fn removed_attachments(&self) -> impl Iterator<Item = &AttachmentChange> {
        self.attachments
            .iter()
            .filter(|a| a.change == ChangeKind::Removed)
    }

    #[must_use]
    pub fn adds_attachments(&self) -> bool {
        self.added_attachments().next().is_some()
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, rev {}", self.origin_id, self.index)
    }
}

/// Full ordered history of one source item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemHistory {
    pub origin_id: String,
    /// Destination work item type created for revision 0.
    pub work_item_type: String,
    pub revisions: Vec<Revision>,
}

impl WorkItemHistory {
    /// Revision that follows the one with `index`, if any.
    #[must_use]
    pub fn next_revision(&self, index: u32) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.index > index)
    }

    /// Every attachment added anywhere in the history, in order.
    pub fn added_attachments(&self) -> impl Iterator<Item = &AttachmentChange> {
        self.revisions.iter().flat_map(Revision::added_attachments)
    }
}

//! Revision history model shared by every replay component.
//!
//! Histories are produced by the extraction stage and are immutable once
//! loaded; replay works on per-revision copies of the field list.

pub mod fields;
pub mod revision;

pub use fields::FieldSet;
pub use revision::{
    AttachmentChange, ChangeKind, FieldChange, FieldValue, LinkChange, LinkDirection, Revision,
    WorkItemHistory,
};

/// Identifier of a work item in the destination system.
pub type WorkItemId = i64;

/// Identifier of a persisted attachment in the destination system.
pub type AttachmentId = i64;

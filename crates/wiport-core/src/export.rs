//! Loading and validating exported item histories.
//!
//! An export is either a single JSON file holding an array of
//! [`WorkItemHistory`] values, or a directory of `*.json` files each holding
//! one history (or an array of them). Directory entries are read in file
//! name order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::model::WorkItemHistory;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExportError {
    #[error("history '{origin_id}' starts at revision {found}, expected 0")]
    FirstIndex { origin_id: String, found: u32 },

    #[error("history '{origin_id}' has revision {found} after {previous}; indexes must increase")]
    IndexOrder {
        origin_id: String,
        previous: u32,
        found: u32,
    },

    #[error("revision {index} in history '{origin_id}' belongs to '{found}'")]
    ForeignRevision {
        origin_id: String,
        index: u32,
        found: String,
    },

    #[error("history '{origin_id}' appears more than once")]
    DuplicateOrigin { origin_id: String },
}

impl ExportError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ExportInvalid
    }
}

/// Check revision ordering and ownership of one history.
///
/// # Errors
///
/// Returns the first [`ExportError`] found.
pub fn validate_history(history: &WorkItemHistory) -> Result<(), ExportError> {
    let mut previous: Option<u32> = None;
    for revision in &history.revisions {
        if revision.origin_id != history.origin_id {
            return Err(ExportError::ForeignRevision {
                origin_id: history.origin_id.clone(),
                index: revision.index,
                found: revision.origin_id.clone(),
            });
        }
        match previous {
            None if revision.index != 0 => {
                return Err(ExportError::FirstIndex {
                    origin_id: history.origin_id.clone(),
                    found: revision.index,
                });
            }
            Some(previous) if revision.index <= previous => {
                return Err(ExportError::IndexOrder {
                    origin_id: history.origin_id.clone(),
                    previous,
                    found: revision.index,
                });
            }
            _ => {}
        }
        previous = Some(revision.index);
    }
    Ok(())
}

/// Validated set of histories, kept in load order.
#[derive(Debug, Clone, Default)]
pub struct ExportSet {
    histories: Vec<WorkItemHistory>,
}

impl ExportSet {
    /// # Errors
    ///
    /// Returns an [`ExportError`] for the first invalid or duplicated
    /// history.
    pub fn new(histories: Vec<WorkItemHistory>) -> Result<Self, ExportError> {
        let mut seen = HashSet::with_capacity(histories.len());
        for history in &histories {
            validate_history(history)?;
            if !seen.insert(history.origin_id.clone()) {
                return Err(ExportError::DuplicateOrigin {
                    origin_id: history.origin_id.clone(),
                });
            }
        }
        Ok(Self { histories })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.histories.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    #[must_use]
    pub fn histories(&self) -> &[WorkItemHistory] {
        &self.histories
    }

    /// Total number of revisions across all histories.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.histories.iter().map(|h| h.revisions.len()).sum()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExportFile {
    Many(Vec<WorkItemHistory>),
    One(Box<WorkItemHistory>),
}

fn read_file(path: &Path) -> Result<Vec<WorkItemHistory>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read export file {}", path.display()))?;
    let parsed: ExportFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse export file {}", path.display()))?;
    Ok(match parsed {
        ExportFile::Many(histories) => histories,
        ExportFile::One(history) => vec![*history],
    })
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list export directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load and validate an export from a file or directory.
///
/// # Errors
///
/// Returns an error if a file cannot be read or parsed, or if the histories
/// fail validation.
pub fn load_export(path: &Path) -> Result<ExportSet> {
    let histories = if path.is_dir() {
        let mut histories = Vec::new();
        for file in json_files(path)? {
            debug!("Reading export file {}", file.display());
            histories.extend(read_file(&file)?);
        }
        histories
    } else {
        read_file(path)?
    };

    let set = ExportSet::new(histories)
        .with_context(|| format!("Export {} failed validation", path.display()))?;
    info!(
        items = set.len(),
        revisions = set.revision_count(),
        "Loaded export from {}",
        path.display()
    );
    Ok(set)
}

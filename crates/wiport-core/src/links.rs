//! Link replay: endpoint translation, link-end selection, and cycle
//! avoidance for non-circular relation types.
//!
//! # Overview
//!
//! Each [`LinkChange`] names its endpoints by origin id. The resolver maps
//! them to destination ids through the journal, picks the requested
//! [`LinkTypeEnd`], and adds or removes the relation on the open work item.
//!
//! # Cycle avoidance
//!
//! Before a relation of a non-circular type is added, the resolver walks the
//! chain of same-end relations starting at the *target*. If the chain comes
//! back to the *source*, the new relation would close a loop, so it is added
//! with the opposite end instead. The walk carries a visited set and stops on
//! any repeated node, so malformed graphs cannot make it spin.
//!
//! # Failure policy
//!
//! Per-link failures (target not migrated, unknown type, missing direction,
//! nothing to remove) are collected in [`LinkOutcome::failures`] and never
//! stop the remaining links. Fatal destination errors and journal errors are
//! returned immediately.

use std::collections::{HashMap, HashSet};

use tracing::{debug, error, warn};

use crate::destination::{
    Destination, DestinationError, LinkGraph, LinkType, LinkTypeEnd, RelatedLink, WorkItemHandle,
};
use crate::error::ErrorCode;
use crate::journal::{Journal, JournalError};
use crate::model::{ChangeKind, LinkChange, LinkDirection, WorkItemId};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("'{link}' - target work item for '{target_origin_id}' is not yet migrated")]
    TargetNotMigrated {
        link: String,
        target_origin_id: String,
    },

    #[error("'{link}' - link type ({link_type}) does not exist in the destination")]
    UnknownType { link: String, link_type: String },

    #[error("'{link}' - link direction not provided")]
    DirectionMissing { link: String },

    #[error("'{link}' - unrecognised link direction '{token}'")]
    InvalidDirection { link: String, token: String },

    #[error("'{link}' - cannot identify link to remove")]
    NotFound { link: String },

    #[error("'{link}' - {source}")]
    Destination {
        link: String,
        #[source]
        source: DestinationError,
    },

    #[error("journal lookup failed: {0}")]
    Journal(#[from] JournalError),
}

impl LinkError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TargetNotMigrated { .. } => ErrorCode::LinkTargetNotMigrated,
            Self::UnknownType { .. } => ErrorCode::LinkTypeUnknown,
            Self::DirectionMissing { .. } | Self::InvalidDirection { .. } => {
                ErrorCode::LinkDirectionMissing
            }
            Self::NotFound { .. } => ErrorCode::LinkNotFound,
            Self::Destination { source, .. } => source.code(),
            Self::Journal(err) => err.code(),
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Destination { source, .. } if source.is_fatal())
    }

    /// Errors that stop the current item instead of failing a single link.
    const fn escalates(&self) -> bool {
        self.is_fatal() || matches!(self, Self::Journal(_))
    }
}

/// Result of applying one revision's link deltas.
#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub added: usize,
    pub removed: usize,
    /// Links that were skipped.
    pub failures: Vec<LinkError>,
    /// Narrative note summarising the revision's link changes.
    pub note: Option<String>,
}

impl LinkOutcome {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Link types known to the destination, keyed by reference name.
#[derive(Debug, Clone, Default)]
pub struct LinkResolver {
    link_types: HashMap<String, LinkType>,
    ignore_failed_links: bool,
}

impl LinkResolver {
    #[must_use]
    pub fn new(link_types: Vec<LinkType>, ignore_failed_links: bool) -> Self {
        Self {
            link_types: link_types
                .into_iter()
                .map(|t| (t.reference_name.clone(), t))
                .collect(),
            ignore_failed_links,
        }
    }

    /// Load link types from the destination.
    ///
    /// # Errors
    ///
    /// Propagates the destination's error if the link types cannot be read.
    pub fn load<D: Destination + ?Sized>(
        destination: &D,
        ignore_failed_links: bool,
    ) -> Result<Self, DestinationError> {
        Ok(Self::new(destination.link_types()?, ignore_failed_links))
    }

    #[must_use]
    pub fn link_type(&self, reference_name: &str) -> Option<&LinkType> {
        self.link_types.get(reference_name)
    }

    /// Pick the end requested by `change`.
    ///
    /// Non-directional types always use their forward end; directional types
    /// require an explicit `Forward` or `Reverse` suffix.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::UnknownType`], [`LinkError::DirectionMissing`], or
    /// [`LinkError::InvalidDirection`].
    pub fn resolve_end(&self, change: &LinkChange) -> Result<LinkTypeEnd, LinkError> {
        let (name, direction) = change.type_and_direction().map_err(|token| {
            LinkError::InvalidDirection {
                link: change.to_string(),
                token: token.to_string(),
            }
        })?;

        let link_type = self
            .link_type(name)
            .ok_or_else(|| LinkError::UnknownType {
                link: change.to_string(),
                link_type: name.to_string(),
            })?;

        if !link_type.is_directional {
            return Ok(link_type.forward_end());
        }
        match direction {
            LinkDirection::Forward => Ok(link_type.forward_end()),
            LinkDirection::Reverse => Ok(link_type.reverse_end()),
            LinkDirection::None => Err(LinkError::DirectionMissing {
                link: change.to_string(),
            }),
        }
    }

    /// Apply every link delta of one revision to `item`.
    ///
    /// # Errors
    ///
    /// Returns the first fatal destination error or journal error. All other
    /// failures are collected in the outcome.
    pub fn apply<D, J, H>(
        &self,
        destination: &D,
        journal: &J,
        item: &mut H,
        changes: &[LinkChange],
    ) -> Result<LinkOutcome, LinkError>
    where
        D: LinkGraph + ?Sized,
        J: Journal + ?Sized,
        H: WorkItemHandle,
    {
        let mut outcome = LinkOutcome::default();

        for change in changes {
            let result = match change.change {
                ChangeKind::Added => self.add(destination, journal, item, change),
                ChangeKind::Removed => Self::remove(journal, item, change),
            };

            match result {
                Ok(()) => match change.change {
                    ChangeKind::Added => outcome.added += 1,
                    ChangeKind::Removed => outcome.removed += 1,
                },
                Err(err) if err.escalates() => return Err(err),
                Err(err) => {
                    match &err {
                        LinkError::TargetNotMigrated { .. } if self.ignore_failed_links => {
                            warn!("{err}");
                        }
                        LinkError::NotFound { .. } => warn!("{err}"),
                        _ => error!("{err}"),
                    }
                    outcome.failures.push(err);
                }
            }
        }

        outcome.note = link_note(changes);
        Ok(outcome)
    }

    fn add<D, J, H>(
        &self,
        destination: &D,
        journal: &J,
        item: &mut H,
        change: &LinkChange,
    ) -> Result<(), LinkError>
    where
        D: LinkGraph + ?Sized,
        J: Journal + ?Sized,
        H: WorkItemHandle,
    {
        let target = resolve_target(journal, change)?;
        let end = self.resolve_end(change)?;

        let source = match item.id() {
            Some(id) => Some(id),
            None => journal.resolve_destination_id(&change.source_origin_id)?,
        };

        let end = match source {
            Some(source) if end.is_non_circular => {
                let closes_cycle =
                    detect_cycle(destination, source, target, &end).map_err(|source| {
                        LinkError::Destination {
                            link: change.to_string(),
                            source,
                        }
                    })?;
                if closes_cycle {
                    let opposite = end.opposite();
                    debug!("'{change}' would close a cycle; using {opposite} instead of {end}");
                    opposite
                } else {
                    end
                }
            }
            _ => end,
        };

        let added = item
            .add_link(RelatedLink { end, target })
            .map_err(|source| LinkError::Destination {
                link: change.to_string(),
                source,
            })?;
        if added {
            debug!("Added link '{change}'.");
        } else {
            debug!("Link '{change}' already present.");
        }
        Ok(())
    }

    fn remove<J, H>(journal: &J, item: &mut H, change: &LinkChange) -> Result<(), LinkError>
    where
        J: Journal + ?Sized,
        H: WorkItemHandle,
    {
        let target = resolve_target(journal, change)?;
        let existing = item
            .links()
            .iter()
            .find(|l| l.target == target && l.end.immutable_name() == change.link_type)
            .cloned();

        match existing {
            Some(link) if item.remove_link(&link) => {
                debug!("Removed link '{change}'.");
                Ok(())
            }
            _ => Err(LinkError::NotFound {
                link: change.to_string(),
            }),
        }
    }
}

fn resolve_target<J: Journal + ?Sized>(
    journal: &J,
    change: &LinkChange,
) -> Result<WorkItemId, LinkError> {
    journal
        .resolve_destination_id(&change.target_origin_id)?
        .ok_or_else(|| LinkError::TargetNotMigrated {
            link: change.to_string(),
            target_origin_id: change.target_origin_id.clone(),
        })
}

/// Returns `true` if adding `source →(end) target` would close a loop of
/// `end` relations.
///
/// Follows the first `end` relation of each item starting at `target` until
/// the chain ends, reaches `source`, or revisits an item.
///
/// # Errors
///
/// Propagates destination lookup failures.
pub fn detect_cycle<G: LinkGraph + ?Sized>(
    graph: &G,
    source: WorkItemId,
    target: WorkItemId,
    end: &LinkTypeEnd,
) -> Result<bool, DestinationError> {
    let mut visited = HashSet::new();
    let mut current = target;

    while visited.insert(current) {
        match graph.next_linked(current, end)? {
            Some(next) if next == source => return Ok(true),
            Some(next) => current = next,
            None => return Ok(false),
        }
    }

    warn!("{end} chain from {target} loops back to {current} without reaching {source}");
    Ok(false)
}

/// One aggregated note per revision: removals if there are any, otherwise
/// additions.
fn link_note(changes: &[LinkChange]) -> Option<String> {
    let listed = |kind: ChangeKind| {
        changes
            .iter()
            .filter(|c| c.change == kind)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    };

    let removed = listed(ChangeKind::Removed);
    if !removed.is_empty() {
        return Some(format!("Removed link(s): {}", removed.join(";")));
    }
    let added = listed(ChangeKind::Added);
    if !added.is_empty() {
        return Some(format!("Added link(s): {}", added.join(";")));
    }
    None
}

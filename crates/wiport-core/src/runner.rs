//! Parallel replay of many items.
//!
//! Items are independent, so a fixed pool of scoped worker threads pulls
//! them from a shared cursor. Revisions of one item always stay on one
//! worker. The first fatal outcome raises a shared flag; workers finish the
//! item they hold and start nothing new.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info};

use crate::destination::Destination;
use crate::journal::Journal;
use crate::model::WorkItemHistory;
use crate::replay::{EntityOutcome, EntityState, RevisionReplayer};

/// Outcome of a whole run, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub items: Vec<EntityOutcome>,
    /// A fatal destination error stopped the run early.
    pub aborted: bool,
}

impl RunSummary {
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&EntityState) -> bool) -> usize {
        self.items.iter().filter(|o| predicate(&o.state)).count()
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(|s| *s == EntityState::Completed)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, EntityState::Failed(_) | EntityState::AbortedFatal(_)))
    }

    #[must_use]
    pub fn not_started(&self) -> usize {
        self.count(|s| *s == EntityState::NotStarted)
    }

    /// Revisions saved with some deltas missing, across all items.
    #[must_use]
    pub fn incomplete_revisions(&self) -> usize {
        self.items.iter().map(|o| o.incomplete.len()).sum()
    }

    /// Every item completed and no revision is incomplete.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.aborted
            && self.completed() == self.items.len()
            && self.incomplete_revisions() == 0
    }
}

/// Replay `histories` on `workers` threads (at least one).
pub fn run<D, J>(
    replayer: &RevisionReplayer<'_, D, J>,
    histories: &[WorkItemHistory],
    workers: usize,
) -> RunSummary
where
    D: Destination,
    J: Journal + ?Sized,
{
    let workers = workers.clamp(1, histories.len().max(1));
    let cursor = AtomicUsize::new(0);
    let abort = AtomicBool::new(false);
    let finished: Mutex<Vec<(usize, EntityOutcome)>> =
        Mutex::new(Vec::with_capacity(histories.len()));

    info!(items = histories.len(), workers, "Starting replay.");

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(history) = histories.get(index) else {
                        break;
                    };

                    let outcome = replayer.replay_item(history);
                    if outcome.is_fatal() {
                        error!(
                            origin_id = %history.origin_id,
                            "Fatal destination failure; stopping the migration."
                        );
                        abort.store(true, Ordering::SeqCst);
                    }
                    finished
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((index, outcome));
                }
            });
        }
    });

    let mut slots: Vec<Option<EntityOutcome>> = vec![None; histories.len()];
    let finished = finished
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    for (index, outcome) in finished {
        slots[index] = Some(outcome);
    }
    let items: Vec<EntityOutcome> = slots
        .into_iter()
        .zip(histories)
        .map(|(slot, history)| {
            slot.unwrap_or_else(|| EntityOutcome::not_started(&history.origin_id))
        })
        .collect();

    let summary = RunSummary {
        aborted: abort.into_inner(),
        items,
    };
    info!(
        completed = summary.completed(),
        failed = summary.failed(),
        not_started = summary.not_started(),
        incomplete_revisions = summary.incomplete_revisions(),
        aborted = summary.aborted,
        "Replay finished."
    );
    summary
}

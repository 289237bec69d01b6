use std::sync::Arc;

use crate::error::{Cancelled, UsageError};
use crate::task::TaskCore;
use crate::tracker::State;
use crate::unit::Unit;
use crate::work::Work;

/// The mutation surface given to a running work function.
///
/// Progress updates go to the owning unit's tracker and make the unit
/// visible in the task's stack on first use. Spawning collects descriptors
/// that are materialized only after the body returns; nothing spawned here
/// runs before that point.
pub struct Handle {
    unit: Arc<Unit>,
    task: Arc<TaskCore>,
}

impl Handle {
    pub(crate) fn new(unit: Arc<Unit>, task: Arc<TaskCore>) -> Self {
        Self { unit, task }
    }

    pub fn set_status(&self, text: impl Into<String>) {
        self.unit.tracker().set_status(text);
        self.unit.publish(&self.task);
    }

    /// Adds to the completed-parts counter. Not clamped to the total; see
    /// [`Tracker::increment`](crate::Tracker::increment).
    pub fn increment(&self, delta: u64) {
        self.unit.tracker().increment(delta);
        self.unit.publish(&self.task);
    }

    /// Overwrites the completed-parts counter, clamped to the total.
    pub fn set_progress(&self, value: u64) {
        self.unit.tracker().set_progress(value);
        self.unit.publish(&self.task);
    }

    /// True while this unit should wind down: its own token or the task's
    /// token is set and the unit is still running. Always false once the
    /// unit has finished.
    pub fn poll_cancel(&self) -> bool {
        if self.unit.state() != State::Running {
            return false;
        }

        self.unit.is_cancelled() || self.task.is_cancelled()
    }

    /// Early-exit form of [`poll_cancel`](Self::poll_cancel) for `?`-style
    /// use inside work functions.
    pub fn check_cancel(&self) -> Result<(), Cancelled> {
        if self.poll_cancel() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Enqueues a child. Parallel children run concurrently once the body
    /// returns; sequential children run strictly in spawn order, each only
    /// after the previously spawned work's entire sub-tree has finished.
    pub fn spawn(&self, parallel: bool, work: Work) -> Result<(), UsageError> {
        self.unit.queue_spawn(work, parallel)
    }

    /// Opens a flatten section: until [`end_flatten`](Self::end_flatten),
    /// sequential spawns are buffered and merged into a single composite
    /// child, which keeps the visible stack quiet across many tiny steps.
    pub fn begin_flatten(&self) -> Result<(), UsageError> {
        self.unit.begin_flatten()
    }

    pub fn end_flatten(&self) -> Result<(), UsageError> {
        self.unit.end_flatten()
    }
}

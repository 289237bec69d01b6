use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle of a schedulable unit. A task reuses the same state space,
/// skipping `CompletedPending`, which only ever applies to units whose body
/// has returned while child branches are still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Unstarted = 0,
    Running = 1,
    CompletedPending = 2,
    Completed = 3,
    Failed = 4,
}

impl State {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    fn decode(raw: u8) -> State {
        match raw {
            0 => State::Unstarted,
            1 => State::Running,
            2 => State::CompletedPending,
            3 => State::Completed,
            4 => State::Failed,
            _ => unreachable!("invalid state discriminant"),
        }
    }
}

/// Per-unit progress and state holder.
///
/// A tracker is created together with its unit and lives for as long as any
/// [`View`] over it does. Status and progress are mutated only by the thread
/// currently executing the owning unit's body, while any thread may read them
/// for progress reporting, so every field sits behind an atomic or a lock.
///
/// # Progress semantics
///
/// `total_parts` is fixed at construction; `0` means indeterminate progress.
/// [`set_progress`](Self::set_progress) clamps to `[0, total_parts]`, but
/// [`increment`](Self::increment) deliberately does not, so the counter may
/// exceed the total if callers over-increment. Callers may rely on either
/// behavior.
pub struct Tracker {
    status: Mutex<String>,
    parts_completed: AtomicU64,
    total_parts: u64,
    state: AtomicU8,
}

impl Tracker {
    pub fn new(status: impl Into<String>, total_parts: u64) -> Self {
        Self {
            status: Mutex::new(status.into()),
            parts_completed: AtomicU64::new(0),
            total_parts,
            state: AtomicU8::new(State::Unstarted as u8),
        }
    }

    pub fn state(&self) -> State {
        State::decode(self.state.load(Ordering::Acquire))
    }

    /// Single-step CAS used for every normal transition. Each transition
    /// occurs exactly once even under concurrent attempts.
    pub(crate) fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional store, used only for task-level forced terminal
    /// transitions.
    pub(crate) fn force(&self, to: State) {
        self.state.store(to as u8, Ordering::Release);
    }

    pub fn set_status(&self, text: impl Into<String>) {
        *self.status.lock().unwrap() = text.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    /// Adds to the completed-parts counter without clamping.
    pub fn increment(&self, delta: u64) {
        self.parts_completed.fetch_add(delta, Ordering::AcqRel);
    }

    /// Overwrites the completed-parts counter, clamped to `total_parts`.
    pub fn set_progress(&self, value: u64) {
        self.parts_completed
            .store(value.min(self.total_parts), Ordering::Release);
    }

    pub fn parts_completed(&self) -> u64 {
        self.parts_completed.load(Ordering::Acquire)
    }

    pub fn total_parts(&self) -> u64 {
        self.total_parts
    }

    /// Derived percentage; `0` for indeterminate trackers.
    pub fn percent_completed(&self) -> u32 {
        if self.total_parts == 0 {
            return 0;
        }

        (self.parts_completed() * 100 / self.total_parts) as u32
    }
}

impl Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("status", &self.status())
            .field("parts_completed", &self.parts_completed())
            .field("total_parts", &self.total_parts)
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only snapshot contract over a live [`Tracker`], handed out by
/// [`Task::stack`](crate::Task::stack) and to event sinks. Cloning a view is
/// cheap; reads always reflect the tracker's current values.
#[derive(Clone)]
pub struct View {
    tracker: Arc<Tracker>,
}

impl View {
    pub(crate) fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }

    pub fn status(&self) -> String {
        self.tracker.status()
    }

    pub fn parts_completed(&self) -> u64 {
        self.tracker.parts_completed()
    }

    pub fn total_parts(&self) -> u64 {
        self.tracker.total_parts()
    }

    pub fn percent_completed(&self) -> u32 {
        self.tracker.percent_completed()
    }

    pub fn state(&self) -> State {
        self.tracker.state()
    }
}

impl Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "View({:?}, {}/{})",
            self.status(),
            self.parts_completed(),
            self.total_parts(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_single_shot() {
        let tracker = Tracker::new("idle", 1);
        assert!(tracker.transition(State::Unstarted, State::Running));
        assert!(!tracker.transition(State::Unstarted, State::Running));
        assert_eq!(tracker.state(), State::Running);
    }

    #[test]
    fn increment_does_not_clamp() {
        let tracker = Tracker::new("counting", 2);
        tracker.increment(5);
        assert_eq!(tracker.parts_completed(), 5);
    }

    #[test]
    fn set_progress_clamps() {
        let tracker = Tracker::new("counting", 2);
        tracker.set_progress(5);
        assert_eq!(tracker.parts_completed(), 2);
        tracker.set_progress(1);
        assert_eq!(tracker.parts_completed(), 1);
    }

    #[test]
    fn percent_of_indeterminate_is_zero() {
        let tracker = Tracker::new("spinning", 0);
        tracker.increment(3);
        assert_eq!(tracker.percent_completed(), 0);
    }

    #[test]
    fn percent_reaches_hundred() {
        let tracker = Tracker::new("counting", 4);
        tracker.increment(4);
        assert_eq!(tracker.percent_completed(), 100);
    }
}

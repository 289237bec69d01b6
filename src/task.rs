use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Cancelled, UsageError};
use crate::event::{EventSink, NullSink};
use crate::executor::{Executor, RayonExecutor};
use crate::tracker::{State, Tracker, View};
use crate::unit::Unit;
use crate::work::Work;

/// Shared engine state behind every [`Task`] clone and every running unit.
///
/// The task and its root unit share one tracker, which is why the task's
/// state space is the unit state space: the root's own `CompletedPending →
/// Completed` transition is the task-level completion, and the only forced
/// transition is the pre-cancelled start path that never runs the root.
pub(crate) struct TaskCore {
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
    tracker: Arc<Tracker>,
    root: Arc<Unit>,
    started: AtomicBool,
    cancelled: AtomicBool,
    running: AtomicUsize,
    cause: Mutex<Option<Arc<anyhow::Error>>>,
    stack: Mutex<StackState>,
    gate: Mutex<()>,
    cond: Condvar,
}

/// The live path from the root to the most recently active unit at each
/// nesting level. Display bookkeeping only; the snapshot is rebuilt lazily
/// when someone asks for it.
#[derive(Default)]
struct StackState {
    levels: Vec<Arc<Unit>>,
    snapshot: Vec<View>,
    dirty: bool,
}

impl TaskCore {
    pub(crate) fn submit(self: &Arc<Self>, unit: Arc<Unit>) {
        let task = Arc::clone(self);
        self.executor.execute(Box::new(move || unit.run(&task)));
    }

    pub(crate) fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn on_unit_start(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    /// Counts actively executing bodies. A cancelled or failed task reaches
    /// its terminal state only once the last body has returned, so waiters
    /// never wake while a sibling is still unwinding.
    pub(crate) fn on_unit_stop(&self) {
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 && self.is_cancelled() {
            self.finalize_failed();
        }
    }

    /// First cause wins; everything else a concurrently failing branch
    /// reports is discarded. Failure always cancels the rest of the tree.
    pub(crate) fn fail(&self, cause: anyhow::Error) {
        self.record_cause(cause);
        self.cancelled.store(true, Ordering::Release);
        self.root.cancel();
    }

    fn record_cause(&self, cause: anyhow::Error) {
        let mut slot = self.cause.lock().unwrap();
        if slot.is_none() {
            tracing::debug!(%cause, "task failure cause recorded");
            *slot = Some(Arc::new(cause));
        }
    }

    pub(crate) fn mark_completed(&self) {
        // The root's own terminal transition already happened; this only
        // wakes the waiters.
        tracing::debug!("task completed");
        self.notify_waiters();
    }

    fn finalize_failed(&self) {
        loop {
            let state = self.tracker.state();
            if state.is_terminal() {
                break;
            }
            if self.tracker.transition(state, State::Failed) {
                tracing::debug!("task failed");
                break;
            }
        }

        self.notify_waiters();
    }

    fn notify_waiters(&self) {
        let _gate = self.gate.lock().unwrap();
        self.cond.notify_all();
    }

    pub(crate) fn begin_subtask(&self, unit: Arc<Unit>) {
        let mut stack = self.stack.lock().unwrap();
        stack.levels.push(unit);
        stack.dirty = true;
    }

    pub(crate) fn next_sequential(&self, unit: Arc<Unit>) {
        let mut stack = self.stack.lock().unwrap();
        stack.levels.pop();
        stack.levels.push(unit);
        stack.dirty = true;
    }

    pub(crate) fn end_subtask(&self) {
        let mut stack = self.stack.lock().unwrap();
        stack.levels.pop();
        stack.dirty = true;
    }

    fn stack_snapshot(&self) -> Vec<View> {
        let mut stack = self.stack.lock().unwrap();
        if stack.dirty {
            stack.snapshot = stack.levels.iter().map(|unit| unit.view()).collect();
            stack.dirty = false;
        }
        stack.snapshot.clone()
    }
}

/// The root handle of one hierarchical task. Cheap to clone; all clones
/// observe the same run.
///
/// A task is built around a single root [`Work`], started once, and then
/// either completes, fails with a first cause, or is cancelled (which also
/// ends in the failed state, with a [`Cancelled`] cause). It stays queryable
/// after termination.
pub struct Task {
    core: Arc<TaskCore>,
}

impl Clone for Task {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl Task {
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    pub fn new(executor: Arc<dyn Executor>, sink: Arc<dyn EventSink>, work: Work) -> Self {
        let root = Unit::root(work);

        Self {
            core: Arc::new(TaskCore {
                executor,
                sink,
                tracker: Arc::clone(root.tracker()),
                root,
                started: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                cause: Mutex::new(None),
                stack: Mutex::new(StackState::default()),
                gate: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Submits the root unit to the executor. Single-shot: a second call is
    /// a usage error regardless of the task's current state. A task that was
    /// cancelled before `start` goes straight to the failed state with a
    /// cancellation cause; the root body is never entered.
    pub fn start(&self) -> Result<(), UsageError> {
        let core = &self.core;

        if core.started.swap(true, Ordering::AcqRel) {
            return Err(UsageError::AlreadyStarted);
        }

        if core.is_cancelled() {
            core.record_cause(Cancelled.into());
            core.tracker.force(State::Failed);
            core.notify_waiters();
            tracing::debug!("task was cancelled before start");
            return Ok(());
        }

        tracing::debug!(status = %core.tracker.status(), "task started");
        core.submit(Arc::clone(&core.root));
        Ok(())
    }

    /// Advisory cancellation: sets the task token and cascades through the
    /// materialized tree. One-shot in effect; a no-op once stopped.
    pub fn cancel(&self) {
        if self.stopped() {
            return;
        }

        tracing::debug!("task cancelled");
        self.core.cancelled.store(true, Ordering::Release);
        self.core.root.cancel();
    }

    fn state(&self) -> State {
        self.core.tracker.state()
    }

    pub fn stopped(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn completed(&self) -> bool {
        self.state() == State::Completed
    }

    pub fn failed(&self) -> bool {
        self.state() == State::Failed
    }

    /// The first failure cause, if any. Later causes were discarded.
    pub fn cause(&self) -> Option<Arc<anyhow::Error>> {
        self.core.cause.lock().unwrap().clone()
    }

    /// Blocks until the task is terminal; returns whether it completed.
    /// `false` therefore covers both failure and cancellation — callers
    /// distinguish the two through [`failed`](Self::failed) and
    /// [`cause`](Self::cause).
    pub fn wait(&self) -> bool {
        let mut gate = self.core.gate.lock().unwrap();
        while !self.stopped() {
            gate = self.core.cond.wait(gate).unwrap();
        }
        drop(gate);

        self.completed()
    }

    /// Timed variant of [`wait`](Self::wait); `false` on timeout. There is
    /// no built-in run timeout — callers compose this with
    /// [`cancel`](Self::cancel).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut gate = self.core.gate.lock().unwrap();
        while !self.stopped() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let (guard, _) = self.core.cond.wait_timeout(gate, remaining).unwrap();
            gate = guard;
        }
        drop(gate);

        self.completed()
    }

    pub fn status(&self) -> String {
        self.core.tracker.status()
    }

    pub fn percent_completed(&self) -> u32 {
        self.core.tracker.percent_completed()
    }

    /// Snapshot of the live path from the root to the most recently active
    /// unit at each nesting level. Valid for diagnostics after termination.
    pub fn stack(&self) -> Vec<View> {
        self.core.stack_snapshot()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The deepest visible unit is the most specific thing to show.
        let (status, percent) = match self.stack().last() {
            Some(view) => (view.status(), view.percent_completed()),
            None => (self.status(), self.percent_completed()),
        };

        write!(f, "{status}... {percent}%")
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("status", &self.status())
            .finish()
    }
}

/// Selects the task's collaborators. Defaults to the global rayon pool and
/// no event sink.
pub struct TaskBuilder {
    executor: Arc<dyn Executor>,
    sink: Arc<dyn EventSink>,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            executor: Arc::new(RayonExecutor),
            sink: Arc::new(NullSink),
        }
    }
}

impl TaskBuilder {
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self, work: Work) -> Task {
        Task::new(self.executor, self.sink, work)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::error::MissingValue;
    use crate::event::{ChannelSink, TaskEvent};

    fn pool() -> Arc<dyn Executor> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(4)
                .build()
                .expect("failed to build thread pool"),
        )
    }

    fn run_to_end(work: Work) -> Task {
        let task = Task::builder().executor(pool()).build(work);
        task.start().unwrap();
        task.wait();
        task
    }

    #[test]
    fn single_unit_completes() {
        let task = Task::builder().executor(pool()).build(Work::new(
            "counting",
            1,
            |handle| {
                handle.increment(1);
                Ok(())
            },
        ));

        task.start().unwrap();
        assert!(task.wait());
        assert!(task.completed());
        assert!(!task.failed());
        assert_eq!(task.percent_completed(), 100);
    }

    #[test]
    fn display_renders_status_and_percent() {
        let task = run_to_end(Work::new("terraforming", 2, |handle| {
            handle.increment(2);
            Ok(())
        }));

        assert_eq!(task.to_string(), "terraforming... 100%");
    }

    #[test]
    fn double_start_is_a_usage_error() {
        let task = Task::builder().executor(pool()).build(Work::new(
            "noop",
            0,
            |_| Ok(()),
        ));

        task.start().unwrap();
        assert_eq!(task.start(), Err(UsageError::AlreadyStarted));
        task.wait();
        assert_eq!(task.start(), Err(UsageError::AlreadyStarted));
    }

    #[test]
    fn failure_captures_first_cause() {
        let task = run_to_end(Work::new("exploding", 0, |_| {
            Err(anyhow::anyhow!("boom"))
        }));

        assert!(!task.completed());
        assert!(task.failed());
        assert_eq!(task.cause().unwrap().to_string(), "boom");
    }

    #[test]
    fn panic_is_contained_as_failure() {
        let task = run_to_end(Work::new("panicking", 0, |_| {
            panic!("kaboom");
        }));

        assert!(task.failed());
        let cause = task.cause().unwrap().to_string();
        assert!(cause.contains("kaboom"), "unexpected cause: {cause}");
    }

    #[test]
    fn cancel_before_start_never_runs_the_body() {
        let entered = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&entered);

        let task = Task::builder().executor(pool()).build(Work::new(
            "doomed",
            0,
            move |_| {
                observer.store(true, Ordering::Release);
                Ok(())
            },
        ));

        task.cancel();
        task.start().unwrap();

        assert!(!task.wait());
        assert!(task.failed());
        assert!(!entered.load(Ordering::Acquire));
        assert!(task.cause().unwrap().downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn cancel_mid_flight_fails_the_task() {
        let (ready_send, ready_recv) = unbounded::<()>();

        let task = Task::builder().executor(pool()).build(Work::new(
            "looping",
            0,
            move |handle| {
                ready_send.send(()).unwrap();
                loop {
                    handle.check_cancel()?;
                    std::thread::sleep(Duration::from_millis(1));
                }
            },
        ));

        task.start().unwrap();
        ready_recv.recv().unwrap();
        task.cancel();

        assert!(!task.wait());
        assert!(task.failed());
        assert!(task.cause().unwrap().downcast_ref::<Cancelled>().is_some());
    }

    #[test]
    fn value_unit_delivers_its_value() {
        let (work, slot) = Work::with_value("appraising", 1, |handle| {
            handle.increment(1);
            Ok(Some(42u32))
        });

        let task = run_to_end(work);
        assert!(task.completed());
        assert_eq!(slot.take(), Some(42));
    }

    #[test]
    fn value_unit_without_value_is_a_defect() {
        let (work, slot) = Work::with_value::<u32, _>("hollow", 0, |_| Ok(None));

        let task = run_to_end(work);
        assert!(task.failed());
        assert_eq!(slot.take(), None);
        assert!(task.cause().unwrap().downcast_ref::<MissingValue>().is_some());
    }

    #[test]
    fn sequential_children_run_in_spawn_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let step = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            Work::new(label, 0, move |_| {
                order.lock().unwrap().push(label);
                Ok(())
            })
        };

        let spawner = Arc::clone(&order);
        let task = run_to_end(Work::new("parent", 0, move |handle| {
            handle.spawn(false, step("first", &spawner))?;
            handle.spawn(false, step("second", &spawner))?;
            handle.spawn(false, step("third", &spawner))?;
            Ok(())
        }));

        assert!(task.completed());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn continuation_waits_for_the_predecessors_subtree() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let note = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
            let order = Arc::clone(order);
            move || order.lock().unwrap().push(label)
        };

        let first_note = note("first", &order);
        let grandchild_note = note("grandchild", &order);
        let second_note = note("second", &order);

        let task = run_to_end(Work::new("parent", 0, move |handle| {
            handle.spawn(
                false,
                Work::new("first", 0, move |h| {
                    first_note();
                    h.spawn(
                        false,
                        Work::new("grandchild", 0, move |_| {
                            grandchild_note();
                            Ok(())
                        }),
                    )?;
                    Ok(())
                }),
            )?;
            handle.spawn(
                false,
                Work::new("second", 0, move |_| {
                    second_note();
                    Ok(())
                }),
            )?;
            Ok(())
        }));

        assert!(task.completed());
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "grandchild", "second"],
        );
    }

    #[test]
    fn continuation_starts_after_all_parallel_children_complete() {
        let (sink, events) = ChannelSink::new();

        let task = Task::builder()
            .executor(pool())
            .sink(Arc::new(sink))
            .build(Work::new("parent", 0, |handle| {
                for index in 0..3 {
                    handle.spawn(
                        true,
                        Work::new(format!("child {index}"), 1, |h| {
                            h.increment(1);
                            Ok(())
                        }),
                    )?;
                }
                handle.spawn(false, Work::new("continuation", 0, |_| Ok(())))?;
                Ok(())
            }));

        task.start().unwrap();
        assert!(task.wait());

        let log: Vec<TaskEvent> = events.try_iter().collect();
        let continuation_started = log
            .iter()
            .position(|event| *event == TaskEvent::Started("continuation".into()))
            .expect("continuation never started");

        for index in 0..3 {
            let completed = log
                .iter()
                .position(|event| *event == TaskEvent::Completed(format!("child {index}")))
                .expect("child never completed");
            assert!(
                completed < continuation_started,
                "child {index} completed at {completed}, after the continuation started at {continuation_started}",
            );
        }
    }

    #[test]
    fn flatten_produces_a_single_composite_child() {
        let (sink, events) = ChannelSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_a = Arc::clone(&hits);
        let hits_b = Arc::clone(&hits);

        let task = Task::builder()
            .executor(pool())
            .sink(Arc::new(sink))
            .build(Work::new("parent", 0, move |handle| {
                handle.begin_flatten()?;
                handle.spawn(
                    false,
                    Work::new("step a", 1, move |h| {
                        hits_a.fetch_add(1, Ordering::AcqRel);
                        h.increment(1);
                        Ok(())
                    }),
                )?;
                handle.spawn(
                    false,
                    Work::new("step b", 1, move |h| {
                        hits_b.fetch_add(1, Ordering::AcqRel);
                        h.increment(1);
                        Ok(())
                    }),
                )?;
                handle.end_flatten()?;
                Ok(())
            }));

        task.start().unwrap();
        assert!(task.wait());
        assert_eq!(hits.load(Ordering::Acquire), 2);

        // Both steps ran inside one materialized child: two start events in
        // total, the parent and the composite.
        let started = events
            .try_iter()
            .filter(|event| matches!(event, TaskEvent::Started(_)))
            .count();
        assert_eq!(started, 2);
    }

    #[test]
    fn flatten_misuse_is_reported_synchronously() {
        let task = run_to_end(Work::new("parent", 0, |handle| {
            assert_eq!(handle.begin_flatten(), Ok(()));
            assert_eq!(handle.begin_flatten(), Err(UsageError::FlattenAlreadyOpen));
            assert_eq!(
                handle.spawn(true, Work::new("parallel", 0, |_| Ok(()))),
                Err(UsageError::ParallelSpawnWhileFlattening),
            );
            assert_eq!(handle.end_flatten(), Ok(()));
            assert_eq!(handle.end_flatten(), Err(UsageError::FlattenNotOpen));
            Ok(())
        }));

        // Assertion failures inside the body would surface as a task
        // failure, so completion is the whole test.
        assert!(task.completed(), "cause: {:?}", task.cause());
    }

    #[test]
    fn unclosed_flatten_closes_implicitly() {
        let ran = Arc::new(AtomicBool::new(false));
        let observer = Arc::clone(&ran);

        let task = run_to_end(Work::new("parent", 0, move |handle| {
            handle.begin_flatten()?;
            handle.spawn(
                false,
                Work::new("buffered", 0, move |_| {
                    observer.store(true, Ordering::Release);
                    Ok(())
                }),
            )?;
            // No end_flatten: materialization closes the section.
            Ok(())
        }));

        assert!(task.completed());
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn child_failure_cancels_running_siblings() {
        let (ready_send, ready_recv) = unbounded::<()>();

        let task = Task::builder().executor(pool()).build(Work::new(
            "parent",
            0,
            move |handle| {
                let ready = ready_send.clone();
                handle.spawn(
                    true,
                    Work::new("stubborn", 0, move |h| {
                        ready.send(()).unwrap();
                        loop {
                            h.check_cancel()?;
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }),
                )?;
                let ready = ready_recv.clone();
                handle.spawn(
                    true,
                    Work::new("fragile", 0, move |_| {
                        // Fail only once the sibling is demonstrably running.
                        ready.recv().unwrap();
                        Err(anyhow::anyhow!("boom"))
                    }),
                )?;
                Ok(())
            },
        ));

        task.start().unwrap();
        assert!(!task.wait());
        assert!(task.failed());
        assert_eq!(task.cause().unwrap().to_string(), "boom");
    }

    #[test]
    fn wait_timeout_returns_false_while_running() {
        let (release_send, release_recv) = unbounded::<()>();

        let task = Task::builder().executor(pool()).build(Work::new(
            "blocked",
            1,
            move |handle| {
                release_recv.recv().ok();
                handle.increment(1);
                Ok(())
            },
        ));

        task.start().unwrap();
        assert!(!task.wait_timeout(Duration::from_millis(30)));
        assert!(!task.stopped());

        release_send.send(()).unwrap();
        assert!(task.wait());
    }

    #[test]
    fn stack_tracks_the_active_path_and_unwinds() {
        let (ready_send, ready_recv) = unbounded::<()>();
        let (release_send, release_recv) = unbounded::<()>();

        let task = Task::builder().executor(pool()).build(Work::new(
            "parent",
            2,
            move |handle| {
                handle.set_status("preparing");
                handle.increment(1);
                ready_send.send(()).unwrap();
                release_recv.recv().ok();
                handle.spawn(false, Work::new("child", 0, |_| Ok(())))?;
                Ok(())
            },
        ));

        task.start().unwrap();
        ready_recv.recv().unwrap();

        let stack = task.stack();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].status(), "preparing");
        assert_eq!(stack[0].parts_completed(), 1);
        assert_eq!(task.to_string(), "preparing... 50%");

        release_send.send(()).unwrap();
        assert!(task.wait());

        // The child's level was popped when its group finished.
        assert_eq!(task.stack().len(), 1);
        assert_eq!(task.stack()[0].status(), "preparing");
    }

    #[test]
    fn terminal_state_is_exactly_one_of_completed_or_failed() {
        let success = run_to_end(Work::new("fine", 0, |_| Ok(())));
        assert!(success.completed() ^ success.failed());

        let failure = run_to_end(Work::new("broken", 0, |_| {
            Err(anyhow::anyhow!("nope"))
        }));
        assert!(failure.completed() ^ failure.failed());
    }
}

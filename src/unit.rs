use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Cancelled, UsageError};
use crate::handle::Handle;
use crate::task::TaskCore;
use crate::tracker::{State, Tracker, View};
use crate::work::Work;
use crate::work::WorkFn;

/// A pending child collected while the parent's body runs. Queued work is
/// materialized into a concrete unit only once, after the body returns;
/// flatten sections close into already-materialized composite units.
pub(crate) enum Descriptor {
    Queued { work: Work, parallel: bool },
    Materialized(Arc<Unit>),
}

/// Mutated only through the handle of the currently executing body.
#[derive(Default)]
struct PendingState {
    descriptors: Vec<Descriptor>,
    flatten: Option<Vec<Work>>,
}

/// The committed execution plan, staged into groups that run one after
/// another. A group is either a fan of parallel branches or the head of a
/// sequential chain (whose links hang off `next`). `outstanding` counts the
/// branches of the currently running group and is guarded together with the
/// remaining groups so the counter can never be observed at zero while
/// staged work remains.
#[derive(Default)]
struct PlanState {
    outstanding: usize,
    groups: VecDeque<Vec<Arc<Unit>>>,
}

/// One schedulable node of work: runs its body, materializes spawned
/// children, aggregates their completion and propagates failure or
/// cancellation.
///
/// Ownership runs strictly downward: the task owns the root, parents own
/// their materialized children, a chain link owns its `next` continuation
/// until submission transfers it to the executor. The parent back-reference
/// is weak and used only for completion signaling.
pub(crate) struct Unit {
    tracker: Arc<Tracker>,
    work: Mutex<Option<WorkFn>>,
    parent: Weak<Unit>,
    next: Mutex<Option<Arc<Unit>>>,
    pending: Mutex<PendingState>,
    plan: Mutex<PlanState>,
    children: Mutex<Vec<Arc<Unit>>>,
    published: AtomicBool,
    head: AtomicBool,
    cancelled: AtomicBool,
}

impl Unit {
    pub(crate) fn root(work: Work) -> Arc<Unit> {
        Self::build(work, Weak::new(), true)
    }

    fn build(work: Work, parent: Weak<Unit>, head: bool) -> Arc<Unit> {
        let Work {
            status,
            total_parts,
            run,
        } = work;

        Arc::new(Unit {
            tracker: Arc::new(Tracker::new(status, total_parts)),
            work: Mutex::new(Some(run)),
            parent,
            next: Mutex::new(None),
            pending: Mutex::new(PendingState::default()),
            plan: Mutex::new(PlanState::default()),
            children: Mutex::new(Vec::new()),
            published: AtomicBool::new(false),
            head: AtomicBool::new(head),
            cancelled: AtomicBool::new(false),
        })
    }

    /// A closed flatten section: one synthetic child that runs the buffered
    /// steps in spawn order, totalling their parts under a single tracker.
    fn composite(steps: Vec<Work>, parent: Weak<Unit>) -> Arc<Unit> {
        let status = steps
            .first()
            .map(|step| step.status.clone())
            .unwrap_or_default();
        let total_parts = steps.iter().map(|step| step.total_parts).sum();

        let work = Work::new(status, total_parts, move |handle: &Handle| {
            for step in steps {
                handle.check_cancel()?;
                handle.set_status(step.status);
                (step.run)(handle)?;
            }

            Ok(())
        });

        Self::build(work, parent, false)
    }

    pub(crate) fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub(crate) fn view(&self) -> View {
        View::new(Arc::clone(&self.tracker))
    }

    pub(crate) fn state(&self) -> State {
        self.tracker.state()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Executor entry point. The body's errors and panics are caught here
    /// and routed to the failure path; nothing escapes to the pool.
    pub(crate) fn run(self: &Arc<Self>, task: &Arc<TaskCore>) {
        if !self.tracker.transition(State::Unstarted, State::Running) {
            tracing::error!(
                status = %self.tracker.status(),
                "unit scheduled twice, refusing to run",
            );
            return;
        }

        task.on_unit_start();
        self.execute(task);
        task.on_unit_stop();
    }

    fn execute(self: &Arc<Self>, task: &Arc<TaskCore>) {
        if task.is_cancelled() || self.is_cancelled() {
            // Cancelled while queued; the body is never entered.
            self.fail(task, Cancelled.into());
            return;
        }

        task.sink().unit_started(&self.view());

        let work = self.work.lock().unwrap().take();
        let result = match work {
            Some(run) => {
                let handle = Handle::new(Arc::clone(self), Arc::clone(task));
                catch_unwind(AssertUnwindSafe(|| run(&handle)))
                    .unwrap_or_else(|panic| Err(panic_cause(panic)))
            }
            None => Err(anyhow::anyhow!("unit body is missing")),
        };

        match result {
            Ok(()) => {
                self.publish(task);
                self.materialize(task);

                if self.tracker.transition(State::Running, State::CompletedPending) {
                    self.try_finish(task);
                } else {
                    tracing::error!("unit left the running state while its body ran");
                }
            }
            Err(cause) => self.fail(task, cause),
        }
    }

    /// Converts pending descriptors, in spawn order, into the committed
    /// plan. Consecutive sequential spawns become one chain linked through
    /// `next`; consecutive parallel spawns become one fan whose branches run
    /// concurrently. Groups run strictly one after another, so a sequential
    /// child spawned after a fan starts only once the whole fan is done.
    fn materialize(self: &Arc<Self>, task: &Arc<TaskCore>) {
        let descriptors = {
            let mut pending = self.pending.lock().unwrap();
            if pending.flatten.is_some() {
                // An unclosed flatten section closes implicitly.
                self.close_flatten(&mut pending);
            }
            std::mem::take(&mut pending.descriptors)
        };

        if descriptors.is_empty() {
            return;
        }

        let mut groups: Vec<Vec<Arc<Unit>>> = Vec::new();
        let mut chain_tail: Option<Arc<Unit>> = None;
        let mut fan_open = false;

        for descriptor in descriptors {
            let (unit, parallel) = match descriptor {
                Descriptor::Queued { work, parallel } => {
                    (Self::build(work, Arc::downgrade(self), false), parallel)
                }
                Descriptor::Materialized(unit) => (unit, false),
            };

            self.children.lock().unwrap().push(Arc::clone(&unit));

            if parallel {
                if fan_open {
                    if let Some(fan) = groups.last_mut() {
                        fan.push(unit);
                    }
                } else {
                    groups.push(vec![unit]);
                    fan_open = true;
                }
                chain_tail = None;
            } else {
                match chain_tail.take() {
                    Some(prev) => {
                        *prev.next.lock().unwrap() = Some(Arc::clone(&unit));
                    }
                    None => groups.push(vec![Arc::clone(&unit)]),
                }
                chain_tail = Some(unit);
                fan_open = false;
            }
        }

        // The first branch to publish opens a new level in the visible stack;
        // everything after it replaces that level.
        if let Some(first) = groups.first().and_then(|group| group.first()) {
            first.head.store(true, Ordering::Release);
        }

        let first = {
            let mut plan = self.plan.lock().unwrap();
            plan.groups = groups.into();
            match plan.groups.pop_front() {
                Some(group) => {
                    plan.outstanding = group.len();
                    group
                }
                None => return,
            }
        };

        for unit in first {
            task.submit(unit);
        }
    }

    /// Terminal completion: possible only once the body has returned and
    /// every staged group has fully finished. Exactly one caller wins the
    /// transition and performs the follow-up.
    pub(crate) fn try_finish(self: &Arc<Self>, task: &Arc<TaskCore>) {
        {
            let plan = self.plan.lock().unwrap();
            if plan.outstanding != 0 || !plan.groups.is_empty() {
                return;
            }
        }

        if !self.tracker.transition(State::CompletedPending, State::Completed) {
            return;
        }

        task.sink().unit_stopped(&self.view());
        task.sink().unit_completed(&self.view());

        let next = self.next.lock().unwrap().take();
        if let Some(next) = next {
            // Ownership of the continuation moves to the executor.
            task.submit(next);
        } else if let Some(parent) = self.parent.upgrade() {
            parent.branch_finished(task);
        } else {
            task.mark_completed();
        }
    }

    /// Called by the last link of a child branch once its entire sub-tree is
    /// done. Advances the plan to the next staged group, or, when none
    /// remain, closes the children's stack level and retries completion.
    fn branch_finished(self: &Arc<Self>, task: &Arc<TaskCore>) {
        let group = {
            let mut plan = self.plan.lock().unwrap();
            plan.outstanding -= 1;
            if plan.outstanding > 0 {
                return;
            }
            match plan.groups.pop_front() {
                Some(group) => {
                    plan.outstanding = group.len();
                    Some(group)
                }
                None => None,
            }
        };

        match group {
            Some(group) => {
                for unit in group {
                    task.submit(unit);
                }
            }
            None => {
                task.end_subtask();
                self.try_finish(task);
            }
        }
    }

    /// Failure path: one CAS decides the race, then the cause is forwarded
    /// to the task, which cancels the rest of the tree. First cause wins;
    /// causes of concurrently failing siblings are discarded there.
    pub(crate) fn fail(self: &Arc<Self>, task: &Arc<TaskCore>, cause: anyhow::Error) {
        if self.tracker.transition(State::Running, State::Failed) {
            task.sink().unit_stopped(&self.view());
            task.sink().unit_failed(&self.view(), &cause);
            task.fail(cause);
        } else {
            tracing::error!(state = ?self.state(), "failing a unit that is not running");
        }
    }

    /// Advisory cancellation: sets this unit's token and cascades through
    /// every already-materialized child. Descriptors that never materialized
    /// are cancelled implicitly by the pre-start check, should they run.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);

        for child in self.children.lock().unwrap().iter() {
            child.cancel();
        }
    }

    /// First appearance in the task's visible stack. Heads open a new level;
    /// every later unit of the same group replaces the level's entry.
    pub(crate) fn publish(self: &Arc<Self>, task: &Arc<TaskCore>) {
        if self.published.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.head.load(Ordering::Acquire) {
            task.begin_subtask(Arc::clone(self));
        } else {
            task.next_sequential(Arc::clone(self));
        }
    }

    pub(crate) fn queue_spawn(&self, work: Work, parallel: bool) -> Result<(), UsageError> {
        let mut pending = self.pending.lock().unwrap();

        match pending.flatten.as_mut() {
            Some(steps) => {
                if parallel {
                    return Err(UsageError::ParallelSpawnWhileFlattening);
                }
                steps.push(work);
            }
            None => pending.descriptors.push(Descriptor::Queued { work, parallel }),
        }

        Ok(())
    }

    pub(crate) fn begin_flatten(&self) -> Result<(), UsageError> {
        let mut pending = self.pending.lock().unwrap();

        if pending.flatten.is_some() {
            return Err(UsageError::FlattenAlreadyOpen);
        }

        pending.flatten = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn end_flatten(self: &Arc<Self>) -> Result<(), UsageError> {
        let mut pending = self.pending.lock().unwrap();

        if pending.flatten.is_none() {
            return Err(UsageError::FlattenNotOpen);
        }

        self.close_flatten(&mut pending);
        Ok(())
    }

    fn close_flatten(self: &Arc<Self>, pending: &mut PendingState) {
        if let Some(steps) = pending.flatten.take() {
            if !steps.is_empty() {
                let unit = Self::composite(steps, Arc::downgrade(self));
                pending.descriptors.push(Descriptor::Materialized(unit));
            }
        }
    }
}

fn panic_cause(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    };

    anyhow::anyhow!("work function panicked: {message}")
}

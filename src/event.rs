//! Notification boundary for unit lifecycle events.
//!
//! The engine announces four event kinds per unit and is otherwise oblivious
//! to what observers do with them. Sinks must tolerate being called from any
//! worker thread.

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::tracker::View;

/// Receives unit lifecycle events. Every callback defaults to a no-op, so
/// implementations only override what they care about.
pub trait EventSink: Send + Sync {
    fn unit_started(&self, unit: &View) {
        let _ = unit;
    }

    fn unit_stopped(&self, unit: &View) {
        let _ = unit;
    }

    fn unit_completed(&self, unit: &View) {
        let _ = unit;
    }

    fn unit_failed(&self, unit: &View, cause: &anyhow::Error) {
        let _ = (unit, cause);
    }
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {}

/// Logs every event through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn unit_started(&self, unit: &View) {
        tracing::debug!(status = %unit.status(), "unit started");
    }

    fn unit_stopped(&self, unit: &View) {
        tracing::trace!(status = %unit.status(), "unit stopped");
    }

    fn unit_completed(&self, unit: &View) {
        tracing::debug!(status = %unit.status(), "unit completed");
    }

    fn unit_failed(&self, unit: &View, cause: &anyhow::Error) {
        tracing::warn!(status = %unit.status(), %cause, "unit failed");
    }
}

/// Owned record of a single lifecycle event, keyed by the unit's status line
/// at the time the event fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started(String),
    Stopped(String),
    Completed(String),
    Failed(String, String),
}

/// Forwards events over a crossbeam channel, preserving emission order.
pub struct ChannelSink {
    sender: Sender<TaskEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<TaskEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn unit_started(&self, unit: &View) {
        self.sender.send(TaskEvent::Started(unit.status())).ok();
    }

    fn unit_stopped(&self, unit: &View) {
        self.sender.send(TaskEvent::Stopped(unit.status())).ok();
    }

    fn unit_completed(&self, unit: &View) {
        self.sender.send(TaskEvent::Completed(unit.status())).ok();
    }

    fn unit_failed(&self, unit: &View, cause: &anyhow::Error) {
        self.sender
            .send(TaskEvent::Failed(unit.status(), cause.to_string()))
            .ok();
    }
}

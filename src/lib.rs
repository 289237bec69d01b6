#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod error;
mod event;
mod executor;
mod handle;
pub mod report;
mod task;
mod tracker;
mod unit;
mod work;

pub use crate::error::{Cancelled, MissingValue, UsageError};
pub use crate::event::{ChannelSink, EventSink, NullSink, TaskEvent, TracingSink};
pub use crate::executor::{Executor, Job, RayonExecutor};
pub use crate::handle::Handle;
pub use crate::task::{Task, TaskBuilder};
pub use crate::tracker::{State, Tracker, View};
pub use crate::work::{ValueSlot, Work};

/// Installs a terminal `tracing` subscriber honoring `RUST_LOG`, for
/// binaries that have no subscriber of their own.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

use thiserror::Error;

/// API misuse detected synchronously. These are fatal to the calling code
/// path and are never routed through the task's failure cause.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    #[error("task has already been started")]
    AlreadyStarted,

    #[error("a flatten section is already open")]
    FlattenAlreadyOpen,

    #[error("no flatten section is open")]
    FlattenNotOpen,

    #[error("cannot spawn a parallel unit inside a flatten section")]
    ParallelSpawnWhileFlattening,
}

/// Cancellation observed by a unit, either before its body ran or through
/// [`Handle::check_cancel`](crate::Handle::check_cancel).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("work was cancelled")]
pub struct Cancelled;

/// A value-returning unit yielded no value. Treated as a defect in the work
/// function, distinct from ordinary failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unit produced no value")]
pub struct MissingValue;

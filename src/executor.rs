//! The injected scheduling authority.
//!
//! The engine never runs work inline: every unit, including a sequential
//! continuation whose predecessor just finished, is resubmitted through the
//! executor. This bounds stack depth regardless of chain length and keeps the
//! executor the single place where threads are chosen.

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Executor backed by the global rayon thread pool.
pub struct RayonExecutor;

impl Executor for RayonExecutor {
    fn execute(&self, job: Job) {
        rayon::spawn(job);
    }
}

/// Dedicated pools can be injected directly.
impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job);
    }
}

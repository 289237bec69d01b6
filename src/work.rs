use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::error::MissingValue;
use crate::handle::Handle;

/// Boxed work function invoked with the owning unit's [`Handle`].
pub(crate) type WorkFn = Box<dyn FnOnce(&Handle) -> anyhow::Result<()> + Send + 'static>;

/// Describes one unit of work before it is materialized: a human-readable
/// status line, a fixed part count (`0` for indeterminate progress) and the
/// work function itself.
pub struct Work {
    pub(crate) status: String,
    pub(crate) total_parts: u64,
    pub(crate) run: WorkFn,
}

impl Work {
    pub fn new<F>(status: impl Into<String>, total_parts: u64, run: F) -> Self
    where
        F: FnOnce(&Handle) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            status: status.into(),
            total_parts,
            run: Box::new(run),
        }
    }

    /// The value-returning form. The work function must produce a value;
    /// `Ok(None)` is treated as a defect and fails the task with
    /// [`MissingValue`]. The produced value can be taken out of the returned
    /// [`ValueSlot`] once the task has stopped.
    pub fn with_value<T, F>(
        status: impl Into<String>,
        total_parts: u64,
        run: F,
    ) -> (Self, ValueSlot<T>)
    where
        T: Send + 'static,
        F: FnOnce(&Handle) -> anyhow::Result<Option<T>> + Send + 'static,
    {
        let slot = ValueSlot {
            cell: Arc::new(Mutex::new(None)),
        };
        let cell = Arc::clone(&slot.cell);

        let work = Self::new(status, total_parts, move |handle| match run(handle)? {
            Some(value) => {
                *cell.lock().unwrap() = Some(value);
                Ok(())
            }
            None => Err(MissingValue.into()),
        });

        (work, slot)
    }
}

impl Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Work({:?}, {} parts)", self.status, self.total_parts)
    }
}

/// Shared cell receiving the output of a value-returning unit.
pub struct ValueSlot<T> {
    cell: Arc<Mutex<Option<T>>>,
}

impl<T> ValueSlot<T> {
    /// Takes the produced value, leaving the slot empty. Returns `None` if
    /// the unit has not (yet) produced one.
    pub fn take(&self) -> Option<T> {
        self.cell.lock().unwrap().take()
    }
}

impl<T> Clone for ValueSlot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

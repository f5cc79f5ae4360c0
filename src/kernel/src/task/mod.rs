//! Preemptive kernel tasks.
//!
//! A task is an `extern "C" fn()` running on its own stack in ring 0. Tasks
//! are switched by rewriting the trap frame an interrupt is about to return
//! through; see [`scheduler`].

pub mod context;
pub mod scheduler;

pub use context::{initial_context, LaunchConfig};
pub use scheduler::{SchedStats, Scheduler, Stack, StackSource, Tcb};

use core::fmt;

/// Value written at the lowest address of every task stack.
pub const STACK_CANARY: u64 = 0x4B45_5354_5245_4C21;

/// A task entry point. Returning from it terminates the task.
pub type TaskEntry = extern "C" fn();

/// A unique identifier for a task within one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Returns the raw id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in its priority's ready queue.
    Ready,
    /// On the processor.
    Running,
    /// Waiting to be woken.
    Blocked,
    /// Finished; its stack is released on the next scheduling pass.
    Terminated,
}

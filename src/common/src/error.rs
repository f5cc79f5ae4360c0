//! System-wide error types for Kestrel.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Memory subsystem error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemError {
    /// No free physical frame or virtual range was available
    OutOfMemory,
    /// Address is not aligned to the page size
    Misaligned,
    /// No mapping exists at the address
    NotMapped,
    /// Virtual address is not canonical
    NonCanonical,
    /// The physical frame is already owned by another mapping
    FrameInUse,
    /// The address lies inside a huge page mapping
    HugePageConflict,
    /// Request falls outside the managed range
    OutOfRange,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory => write!(f, "out of memory"),
            MemError::Misaligned => write!(f, "address not page aligned"),
            MemError::NotMapped => write!(f, "address not mapped"),
            MemError::NonCanonical => write!(f, "non-canonical virtual address"),
            MemError::FrameInUse => write!(f, "physical frame already in use"),
            MemError::HugePageConflict => write!(f, "address inside a huge page"),
            MemError::OutOfRange => write!(f, "address out of managed range"),
        }
    }
}

/// Scheduler error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SchedError {
    /// Stack or bookkeeping allocation failed
    OutOfMemory,
    /// Priority outside the supported levels
    InvalidPriority,
    /// Stack size of zero or too large
    InvalidStackSize,
    /// No task with the given id
    NoSuchTask,
    /// Task is not in a state that permits the operation
    InvalidState,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::OutOfMemory => write!(f, "out of memory"),
            SchedError::InvalidPriority => write!(f, "invalid priority"),
            SchedError::InvalidStackSize => write!(f, "invalid stack size"),
            SchedError::NoSuchTask => write!(f, "no such task"),
            SchedError::InvalidState => write!(f, "invalid task state"),
        }
    }
}

impl From<MemError> for SchedError {
    fn from(err: MemError) -> Self {
        match err {
            MemError::OutOfMemory => SchedError::OutOfMemory,
            _ => SchedError::InvalidStackSize,
        }
    }
}

/// Interrupt subsystem error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IrqError {
    /// Vector or IRQ number out of range
    InvalidVector,
    /// Vector is not a CPU exception (0-31)
    NotAnException,
    /// The policy for this vector cannot be changed
    PolicyLocked,
    /// The controller cannot perform the request
    Unsupported,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqError::InvalidVector => write!(f, "invalid vector"),
            IrqError::NotAnException => write!(f, "vector is not an exception"),
            IrqError::PolicyLocked => write!(f, "exception policy is locked"),
            IrqError::Unsupported => write!(f, "unsupported by interrupt controller"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_allocation_failure_is_out_of_memory() {
        assert_eq!(SchedError::from(MemError::OutOfMemory), SchedError::OutOfMemory);
        assert_eq!(SchedError::from(MemError::Misaligned), SchedError::InvalidStackSize);
    }
}

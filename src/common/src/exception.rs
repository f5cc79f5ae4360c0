//! Exception handling modes.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the dispatcher treats a CPU exception vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExceptionMode {
    /// Count the occurrence and resume.
    Ignore,
    /// Record an entry in the exception log and resume.
    Log,
    /// Run the bound handler; escalate to fatal if it does not recover.
    Recover,
    /// Dump state and halt.
    Fatal,
}

impl ExceptionMode {
    /// Returns a short lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ExceptionMode::Ignore => "ignore",
            ExceptionMode::Log => "log",
            ExceptionMode::Recover => "recover",
            ExceptionMode::Fatal => "fatal",
        }
    }
}

//! Types shared between the Kestrel kernel crates.

#![no_std]

pub mod error;
pub mod exception;
pub mod fault;

pub use error::{IrqError, MemError, SchedError};
pub use exception::ExceptionMode;
pub use fault::FaultCode;

//! Synchronization primitives for state shared with interrupt handlers.
//!
//! On a single processor the only concurrency is an interrupt arriving in the
//! middle of task code. [`IrqMutex`] excludes it by disabling interrupts for
//! as long as its guard lives, and restores the previous interrupt state on
//! every exit path.
//!
//! # Example
//!
//! ```ignore
//! use kestrel_kernel::sync::IrqMutex;
//!
//! let ticks = IrqMutex::new(cpu, 0u64);
//! {
//!     let mut guard = ticks.lock();
//!     *guard += 1;
//! } // interrupts restored here
//! ```

pub mod irq;

pub use irq::{IrqGuard, IrqMutex, IrqMutexGuard};

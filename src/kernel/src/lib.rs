//! Kestrel Kernel
//!
//! A small preemptive kernel for a single x86_64 processor.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `memory`: physical frame allocation, page tables and page-fault handling
//! - `interrupts`: the vector table, exception policies, the exception log and
//!   controller helpers
//! - `task`: task control blocks and the priority scheduler
//! - `kernel`: the [`Kernel`] context tying the three together
//! - `sync`: the interrupt-disabling spin lock guarding kernel state
//! - `arch`: platform-specific code (boot sequence, trap stubs, IDT, GDT, PIC,
//!   APIC, PIT, serial)
//!
//! Everything outside `arch` is hardware-independent and is unit tested on the
//! host. Hardware access only happens through the [`kestrel_hal`] traits.
//!
//! # Safety
//!
//! This is a `#![no_std]` kernel. All unsafe code is documented with safety
//! invariants explaining why the usage is correct.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod interrupts;
pub mod kernel;
pub mod memory;
pub mod sync;
pub mod task;

#[cfg(target_os = "none")]
pub mod allocator;
pub mod testutil;

pub use config::KernelConfig;
pub use kernel::Kernel;

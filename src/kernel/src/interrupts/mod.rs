//! Interrupt and exception dispatch.
//!
//! - [`frame`]: the register snapshot every trap stub builds
//! - [`table`]: the 256-entry vector table of handler bindings
//! - [`policy`]: per-exception handling modes and counters
//! - [`log`]: the bounded exception log
//! - [`dispatch`]: the single entry point all vectors go through
//! - [`controller`]: hardware-independent controller and timer helpers

pub mod controller;
pub mod dispatch;
pub mod frame;
pub mod log;
pub mod policy;
pub mod table;

pub use dispatch::{DispatchOutcome, DispatchStats, FatalReason, FatalReport};
pub use frame::{InterruptContext, TrapFrame};
pub use log::{ExceptionLog, ExceptionRecord};
pub use policy::{PolicyEntry, PolicyTable};
pub use table::{Binding, Builtin, Handler, HandlerOutcome, HandlerSlot, InterruptTable, Privilege};

/// Number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;
/// Number of vectors reserved for CPU exceptions.
pub const EXCEPTION_COUNT: usize = 32;

/// #DE
pub const DIVIDE_ERROR: u8 = 0;
/// #DB
pub const DEBUG: u8 = 1;
/// Non-maskable interrupt.
pub const NMI: u8 = 2;
/// #BP
pub const BREAKPOINT: u8 = 3;
/// #UD
pub const INVALID_OPCODE: u8 = 6;
/// #DF
pub const DOUBLE_FAULT: u8 = 8;
/// #GP
pub const GENERAL_PROTECTION: u8 = 13;
/// #PF
pub const PAGE_FAULT: u8 = 14;
/// #AC
pub const ALIGNMENT_CHECK: u8 = 17;
/// #MC
pub const MACHINE_CHECK: u8 = 18;

const EXCEPTION_NAMES: [&str; EXCEPTION_COUNT] = [
    "Divide Error",
    "Debug",
    "NMI",
    "Breakpoint",
    "Overflow",
    "Bound Range",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD FP Exception",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security",
    "Reserved",
];

/// Human-readable name of a vector.
pub fn vector_name(vector: u8) -> &'static str {
    match vector {
        0..=31 => EXCEPTION_NAMES[vector as usize],
        crate::config::TIMER_VECTOR => "Timer",
        crate::config::YIELD_VECTOR => "Yield",
        crate::config::EXIT_VECTOR => "Task Exit",
        crate::config::BLOCK_VECTOR => "Block",
        crate::config::APIC_SPURIOUS_VECTOR => "Spurious",
        _ => "IRQ",
    }
}

/// Returns true for exceptions a handler can plausibly recover from.
///
/// Purely informational; the policy table decides what actually happens.
pub fn is_recoverable(vector: u8) -> bool {
    matches!(
        vector,
        PAGE_FAULT | GENERAL_PROTECTION | INVALID_OPCODE | ALIGNMENT_CHECK
    )
}

/// Returns true if the CPU pushes an error code for `vector`.
pub const fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_exceptions_and_software_vectors() {
        assert_eq!(vector_name(PAGE_FAULT), "Page Fault");
        assert_eq!(vector_name(DOUBLE_FAULT), "Double Fault");
        assert_eq!(vector_name(0x81), "Yield");
        assert_eq!(vector_name(40), "IRQ");
    }

    #[test]
    fn error_code_vectors() {
        let with_code: alloc::vec::Vec<u8> = (0..32).filter(|&v| has_error_code(v)).collect();
        assert_eq!(with_code, [8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
    }

    #[test]
    fn aborts_are_not_recoverable() {
        assert!(is_recoverable(PAGE_FAULT));
        assert!(!is_recoverable(DOUBLE_FAULT));
        assert!(!is_recoverable(MACHINE_CHECK));
        assert!(!is_recoverable(DIVIDE_ERROR));
    }
}

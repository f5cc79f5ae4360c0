//! x86_64 architecture support.
//!
//! Everything here touches real hardware: descriptor tables, the trap entry
//! stubs, the interrupt controllers, the PIT and the serial port. The kernel
//! core only sees it through the [`kestrel_hal`] traits and the installed
//! [`Kernel`] context.

pub mod apic;
pub mod boot;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod logger;
pub mod memory;
pub mod pic;
pub mod pit;
pub mod serial;
pub mod trap;

pub use cpu::CPU;
pub use serial::SERIAL;

use crate::config::ControllerPreference;
use crate::interrupts::controller::choose_controller;
use crate::memory::AddressSpace;
use crate::task::LaunchConfig;
use crate::Kernel;
use alloc::boxed::Box;
use core::arch::asm;
use kestrel_hal::{ControllerKind, InterruptController};

static KERNEL: spin::Once<&'static Kernel> = spin::Once::new();

/// Makes `kernel` the context every trap is dispatched to.
///
/// Only the first call has an effect.
pub fn install(kernel: &'static Kernel) {
    KERNEL.call_once(|| kernel);
}

/// The installed kernel context, if any.
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get().copied()
}

/// Segment selectors and exit trap for new tasks.
pub fn launch_config() -> LaunchConfig {
    let selectors = gdt::selectors();
    LaunchConfig {
        code_selector: selectors.code.0,
        data_selector: selectors.data.0,
        exit_trampoline: trap::task_exit_trampoline_addr(),
    }
}

/// Returns true if CPUID reports an on-chip local APIC.
pub fn has_apic() -> bool {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.edx & (1 << 9) != 0
}

/// Builds the interrupt controller the preference and the hardware allow.
///
/// The APIC register pages are mapped into `memory`; if that fails the legacy
/// pair is used instead.
pub fn select_controller(
    preference: ControllerPreference,
    memory: &mut AddressSpace,
) -> Box<dyn InterruptController + Send> {
    match choose_controller(preference, has_apic()) {
        ControllerKind::Apic => match apic::ApicController::new(memory) {
            Ok(apic) => return Box::new(apic),
            Err(err) => log::warn!("cannot map APIC registers ({}); using the 8259 pair", err),
        },
        ControllerKind::LegacyPic => {}
    }
    Box::new(pic::LegacyPic::new())
}

/// Gives up the processor from task code (`YIELD_VECTOR`).
#[inline]
pub fn yield_now() {
    // SAFETY: the vector has a gate and a builtin binding installed at boot.
    unsafe { asm!("int 0x81") };
}

/// Blocks the running task until something wakes it (`BLOCK_VECTOR`).
#[inline]
pub fn block() {
    // SAFETY: as for `yield_now`.
    unsafe { asm!("int 0x83") };
}

/// Halts the CPU until the next interrupt.
///
/// Used in idle loops to reduce power consumption.
#[inline]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Halts the CPU in an infinite loop.
///
/// Used after unrecoverable errors (panics).
pub fn halt_loop() -> ! {
    loop {
        hlt();
    }
}

/// Disables interrupts and halts for good.
pub fn halt_forever() -> ! {
    x86_64::instructions::interrupts::disable();
    halt_loop()
}

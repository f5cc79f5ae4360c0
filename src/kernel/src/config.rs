//! Kernel configuration.
//!
//! Compile-time constants live here as plain `pub const`s. Values chosen at
//! boot are collected in [`KernelConfig`].

use crate::memory::DemandPolicy;

/// Size of a page and of a physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Start of the virtual window `alloc_pages` hands out pages from.
pub const PAGE_POOL_START: u64 = 0x_5555_0000_0000;
/// Size of the page-pool window in bytes (256 MiB).
pub const PAGE_POOL_SIZE: u64 = 256 * 1024 * 1024;

/// Virtual window device registers (local APIC, I/O APIC) are mapped into.
pub const MMIO_WINDOW_START: u64 = 0x_6666_0000_0000;

/// The start address of the kernel heap.
pub const HEAP_START: usize = 0x_4444_4444_0000;
/// The size of the kernel heap.
pub const HEAP_SIZE: usize = 1024 * 1024; // 1 MiB

/// Number of scheduler priority levels. Priority 0 is the most urgent.
pub const PRIORITY_LEVELS: usize = 16;
/// Stack size used when a caller has no preference.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;
/// Largest stack a task may request.
pub const MAX_STACK_SIZE: usize = 1024 * 1024;

/// Default number of entries kept in the exception log.
pub const EXCEPTION_LOG_CAPACITY: usize = 64;

/// First vector used for hardware IRQs.
pub const IRQ_BASE: u8 = 32;
/// Vector of the scheduler timer tick.
pub const TIMER_VECTOR: u8 = IRQ_BASE;
/// Software vector a task raises to give up the processor.
pub const YIELD_VECTOR: u8 = 0x81;
/// Software vector raised when a task returns from its entry point.
pub const EXIT_VECTOR: u8 = 0x82;
/// Software vector a task raises to block itself until woken.
pub const BLOCK_VECTOR: u8 = 0x83;
/// Vector the local APIC delivers spurious interrupts on.
pub const APIC_SPURIOUS_VECTOR: u8 = 0xFF;

/// Which interrupt controller the boot sequence should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPreference {
    /// Use the APIC complex when the CPU has one, else the legacy PIC pair.
    Auto,
    /// Always use the legacy 8259 pair.
    LegacyPic,
    /// Use the APIC complex; falls back to the legacy pair without one.
    Apic,
}

/// Boot-time kernel parameters.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Timer tick frequency in Hz.
    pub tick_hz: u32,
    /// Interrupt controller preference.
    pub controller: ControllerPreference,
    /// Maximum log level emitted by the serial logger.
    pub log_level: log::LevelFilter,
    /// Capacity of the bounded exception log.
    pub exception_log_capacity: usize,
    /// Demand-zero paging window; `None` makes every not-present fault fatal.
    pub demand_paging: Option<DemandPolicy>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: 100,
            controller: ControllerPreference::Auto,
            log_level: if cfg!(debug_assertions) {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            },
            exception_log_capacity: EXCEPTION_LOG_CAPACITY,
            demand_paging: None,
        }
    }
}

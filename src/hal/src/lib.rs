//! Kestrel Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines traits that abstract away platform-specific hardware details.
//! The kernel core is written against these traits so it can run on real hardware
//! and inside host unit tests alike.

#![no_std]

/// Trait for a serial port or similar character-based communication channel.
pub trait Serial {
    /// Writes a single byte to the serial port.
    fn write_byte(&mut self, byte: u8);
    /// Reads a single byte from the serial port, if available.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Processor-level controls the kernel core needs.
///
/// Implementations must be usable from interrupt context.
pub trait Cpu: Sync {
    /// Returns whether maskable interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;
    /// Globally enables maskable interrupts.
    fn enable_interrupts(&self);
    /// Globally disables maskable interrupts.
    fn disable_interrupts(&self);
    /// Halts the processor until the next interrupt arrives.
    fn halt(&self);
    /// Drops any cached translation for the page containing `addr`.
    fn invalidate_page(&self, addr: u64);
}

/// Which interrupt controller family backs an [`InterruptController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// The chained pair of 8259 PICs.
    LegacyPic,
    /// Local APIC plus I/O APIC.
    Apic,
}

/// Error returned when a controller cannot honour a routing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// The IRQ line does not exist on this controller.
    NoSuchIrq,
    /// The controller cannot deliver this IRQ on the requested vector.
    FixedVector,
}

/// Trait for controlling external interrupt sources.
///
/// IRQ numbers are controller inputs (ISA IRQs or I/O APIC pins); vectors are
/// CPU interrupt vectors.
pub trait InterruptController {
    /// Returns the controller family.
    fn kind(&self) -> ControllerKind;
    /// Programs the hardware and leaves every IRQ masked.
    fn init(&mut self);
    /// Masks a single IRQ line.
    fn mask(&mut self, irq: u8);
    /// Unmasks a single IRQ line.
    fn unmask(&mut self, irq: u8);
    /// Returns whether an IRQ line is currently masked.
    fn is_masked(&self, irq: u8) -> bool;
    /// Signals the end of an interrupt to the controller.
    fn end_of_interrupt(&mut self, irq: u8);
    /// Delivers `irq` on CPU vector `vector`.
    fn route(&mut self, irq: u8, vector: u8) -> Result<(), RouteError>;
    /// Maps a CPU vector back to the IRQ that raises it, if any.
    fn irq_for_vector(&self, vector: u8) -> Option<u8>;
    /// Returns true if the interrupt on `irq` was spurious and must not be
    /// acknowledged as a real one.
    fn is_spurious(&mut self, irq: u8) -> bool {
        let _ = irq;
        false
    }
}

/// Trait for a system timer.
pub trait Timer {
    /// Returns the number of ticks since the system started.
    fn current_ticks(&self) -> u64;
    /// Returns the configured tick frequency in Hz.
    fn frequency(&self) -> u32;
}

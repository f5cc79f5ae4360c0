//! Hardware-independent parts of the interrupt controllers and timers.
//!
//! The drivers in `arch::x86_64` only move bits to ports and registers; the
//! bits themselves are computed here so they can be tested on the host.

use crate::config::{ControllerPreference, IRQ_BASE};
use kestrel_common::IrqError;
use kestrel_hal::ControllerKind;

/// Input clock of the 8253/8254 PIT in Hz.
pub const PIT_FREQUENCY: u32 = 1_193_182;

/// Number of lines on the chained 8259 pair.
pub const LEGACY_IRQS: u8 = 16;
/// IRQ line the slave 8259 cascades into on the master.
pub const CASCADE_IRQ: u8 = 2;

/// Names of the ISA IRQ lines.
pub const ISA_IRQ_NAMES: [&str; LEGACY_IRQS as usize] = [
    "timer",
    "keyboard",
    "cascade",
    "com2",
    "com1",
    "lpt2",
    "floppy",
    "lpt1",
    "rtc",
    "acpi",
    "free",
    "free",
    "mouse",
    "fpu",
    "ata primary",
    "ata secondary",
];

/// Picks the controller family to drive.
pub fn choose_controller(preference: ControllerPreference, has_apic: bool) -> ControllerKind {
    match preference {
        ControllerPreference::LegacyPic => ControllerKind::LegacyPic,
        ControllerPreference::Auto | ControllerPreference::Apic if has_apic => ControllerKind::Apic,
        _ => ControllerKind::LegacyPic,
    }
}

/// Channel 0 reload value for a periodic interrupt at `hz`.
///
/// The result is clamped to what the 16-bit counter can hold, so very low
/// rates come out faster than asked and very high ones slower.
pub fn pit_divisor(hz: u32) -> Result<u16, IrqError> {
    if hz == 0 {
        return Err(IrqError::Unsupported);
    }
    Ok((PIT_FREQUENCY / hz).clamp(1, u32::from(u16::MAX)) as u16)
}

/// Local APIC timer initial count for a periodic interrupt at `hz`.
///
/// `elapsed` is how far the timer counted down during a calibration window
/// of `window_ms` milliseconds.
pub fn apic_timer_initial_count(elapsed: u32, window_ms: u32, hz: u32) -> Result<u32, IrqError> {
    if hz == 0 || window_ms == 0 {
        return Err(IrqError::Unsupported);
    }
    let per_second = u64::from(elapsed) * 1000 / u64::from(window_ms);
    Ok((per_second / u64::from(hz)).clamp(1, u64::from(u32::MAX)) as u32)
}

/// Shadow copy of the chained 8259 interrupt mask registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicMask(u16);

impl PicMask {
    /// Every line masked.
    pub const ALL: Self = Self(0xFFFF);

    /// Masks `irq`. Out-of-range lines are ignored.
    pub fn mask(&mut self, irq: u8) {
        if irq < LEGACY_IRQS {
            self.0 |= 1 << irq;
        }
    }

    /// Unmasks `irq`. Unmasking a slave line also opens the cascade line.
    pub fn unmask(&mut self, irq: u8) {
        if irq < LEGACY_IRQS {
            self.0 &= !(1 << irq);
            if irq >= 8 {
                self.0 &= !(1 << CASCADE_IRQ);
            }
        }
    }

    /// Returns true if `irq` is masked. Out-of-range lines count as masked.
    pub fn is_masked(&self, irq: u8) -> bool {
        irq >= LEGACY_IRQS || self.0 & (1 << irq) != 0
    }

    /// Value for the master's data port.
    pub fn master(&self) -> u8 {
        self.0 as u8
    }

    /// Value for the slave's data port.
    pub fn slave(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

/// Maps a vector in the legacy range back to its IRQ line.
pub fn legacy_irq_for_vector(vector: u8) -> Option<u8> {
    vector
        .checked_sub(IRQ_BASE)
        .filter(|irq| *irq < LEGACY_IRQS)
}

/// I/O APIC delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeliveryMode {
    /// Deliver to the destination on the given vector.
    Fixed = 0b000,
    /// Deliver to the lowest-priority processor among the destinations.
    LowestPriority = 0b001,
    /// System management interrupt.
    Smi = 0b010,
    /// Non-maskable interrupt.
    Nmi = 0b100,
    /// INIT IPI.
    Init = 0b101,
    /// External 8259-style interrupt.
    ExtInt = 0b111,
}

/// One I/O APIC redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    /// CPU vector to deliver.
    pub vector: u8,
    /// Delivery mode.
    pub delivery: DeliveryMode,
    /// Logical rather than physical destination.
    pub logical: bool,
    /// Active-low polarity.
    pub active_low: bool,
    /// Level rather than edge triggered.
    pub level: bool,
    /// Line masked.
    pub masked: bool,
    /// Destination APIC id.
    pub destination: u8,
}

impl RedirectionEntry {
    const DEST_LOGICAL: u32 = 1 << 11;
    const ACTIVE_LOW: u32 = 1 << 13;
    const LEVEL: u32 = 1 << 15;
    const MASKED: u32 = 1 << 16;

    /// A masked, edge-triggered, active-high fixed entry to APIC 0.
    pub fn masked(vector: u8) -> Self {
        Self {
            vector,
            delivery: DeliveryMode::Fixed,
            logical: false,
            active_low: false,
            level: false,
            masked: true,
            destination: 0,
        }
    }

    /// Encodes to the `(low, high)` register pair.
    pub fn encode(&self) -> (u32, u32) {
        let mut low = u32::from(self.vector) | ((self.delivery as u32) << 8);
        if self.logical {
            low |= Self::DEST_LOGICAL;
        }
        if self.active_low {
            low |= Self::ACTIVE_LOW;
        }
        if self.level {
            low |= Self::LEVEL;
        }
        if self.masked {
            low |= Self::MASKED;
        }
        (low, u32::from(self.destination) << 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_choice_follows_preference_and_hardware() {
        use ControllerPreference::*;
        assert_eq!(choose_controller(Auto, true), ControllerKind::Apic);
        assert_eq!(choose_controller(Auto, false), ControllerKind::LegacyPic);
        assert_eq!(choose_controller(LegacyPic, true), ControllerKind::LegacyPic);
        assert_eq!(choose_controller(Apic, false), ControllerKind::LegacyPic);
    }

    #[test]
    fn pit_divisor_is_clamped() {
        assert_eq!(pit_divisor(100), Ok(11931));
        assert_eq!(pit_divisor(1000), Ok(1193));
        assert_eq!(pit_divisor(1), Ok(u16::MAX));
        assert_eq!(pit_divisor(2_000_000), Ok(1));
        assert_eq!(pit_divisor(0), Err(IrqError::Unsupported));
    }

    #[test]
    fn apic_count_scales_from_the_calibration_window() {
        // 62_500 counts in 10 ms is 6.25 MHz; at 100 Hz that is 62_500 per tick.
        assert_eq!(apic_timer_initial_count(62_500, 10, 100), Ok(62_500));
        assert_eq!(apic_timer_initial_count(62_500, 10, 1000), Ok(6_250));
        assert_eq!(apic_timer_initial_count(0, 10, 100), Ok(1));
        assert_eq!(apic_timer_initial_count(1, 10, 0), Err(IrqError::Unsupported));
    }

    #[test]
    fn pic_mask_opens_cascade_for_slave_lines() {
        let mut mask = PicMask::ALL;
        mask.unmask(0);
        assert_eq!((mask.master(), mask.slave()), (0xFE, 0xFF));
        mask.unmask(12);
        assert_eq!((mask.master(), mask.slave()), (0xFA, 0xEF));
        assert!(!mask.is_masked(12));
        mask.mask(12);
        assert!(mask.is_masked(12));
        assert!(mask.is_masked(16));
    }

    #[test]
    fn legacy_vectors_map_to_irqs() {
        assert_eq!(legacy_irq_for_vector(32), Some(0));
        assert_eq!(legacy_irq_for_vector(47), Some(15));
        assert_eq!(legacy_irq_for_vector(48), None);
        assert_eq!(legacy_irq_for_vector(14), None);
    }

    #[test]
    fn redirection_entry_encoding() {
        let entry = RedirectionEntry::masked(0x21);
        assert_eq!(entry.encode(), (0x0001_0021, 0));

        let entry = RedirectionEntry {
            vector: 0x30,
            delivery: DeliveryMode::LowestPriority,
            logical: true,
            active_low: true,
            level: true,
            masked: false,
            destination: 3,
        };
        assert_eq!(entry.encode(), (0x0000_A930, 0x0300_0000));
    }
}

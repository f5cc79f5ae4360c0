//! Support for the primary and secondary 8259 Programmable Interrupt Controllers (PICs).

use crate::config::IRQ_BASE;
use crate::interrupts::controller::{legacy_irq_for_vector, PicMask, LEGACY_IRQS};
use kestrel_hal::{ControllerKind, InterruptController, RouteError};
use pic8259::ChainedPics;
use x86_64::instructions::port::Port;

/// The offset of the first PIC (master).
///
/// IRQs 0..7 are mapped to interrupts 32..39.
pub const PIC_1_OFFSET: u8 = IRQ_BASE;

/// The offset of the second PIC (slave).
///
/// IRQs 8..15 are mapped to interrupts 40..47.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const MASTER_COMMAND: u16 = 0x20;
const SLAVE_COMMAND: u16 = 0xA0;
const OCW3_READ_ISR: u8 = 0x0B;
const EOI: u8 = 0x20;

/// The chained 8259 pair.
pub struct LegacyPic {
    pics: ChainedPics,
    mask: PicMask,
}

impl LegacyPic {
    /// Creates the driver; nothing is written until `init`.
    pub fn new() -> Self {
        Self {
            // SAFETY: the offsets do not overlap the exception vectors.
            pics: unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) },
            mask: PicMask::ALL,
        }
    }

    /// Remaps both chips away from the exception vectors and masks them.
    ///
    /// Used when the APIC takes over, so stray legacy interrupts cannot land
    /// on exception vectors.
    pub fn disable() {
        let mut pic = Self::new();
        pic.init();
    }

    fn write_mask(&mut self) {
        // SAFETY: the data ports belong to the PICs this driver owns.
        unsafe { self.pics.write_masks(self.mask.master(), self.mask.slave()) };
    }

    fn in_service(command: u16) -> u8 {
        let mut port: Port<u8> = Port::new(command);
        // SAFETY: OCW3 only selects which register the next read returns.
        unsafe {
            port.write(OCW3_READ_ISR);
            port.read()
        }
    }
}

impl Default for LegacyPic {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController for LegacyPic {
    fn kind(&self) -> ControllerKind {
        ControllerKind::LegacyPic
    }

    fn init(&mut self) {
        // SAFETY: runs once at boot with interrupts disabled.
        unsafe { self.pics.initialize() };
        self.mask = PicMask::ALL;
        self.write_mask();
    }

    fn mask(&mut self, irq: u8) {
        self.mask.mask(irq);
        self.write_mask();
    }

    fn unmask(&mut self, irq: u8) {
        self.mask.unmask(irq);
        self.write_mask();
    }

    fn is_masked(&self, irq: u8) -> bool {
        self.mask.is_masked(irq)
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        // SAFETY: `irq` was just delivered by this pair.
        unsafe { self.pics.notify_end_of_interrupt(PIC_1_OFFSET + irq) };
    }

    fn route(&mut self, irq: u8, vector: u8) -> Result<(), RouteError> {
        if irq >= LEGACY_IRQS {
            return Err(RouteError::NoSuchIrq);
        }
        if vector != PIC_1_OFFSET + irq {
            return Err(RouteError::FixedVector);
        }
        Ok(())
    }

    fn irq_for_vector(&self, vector: u8) -> Option<u8> {
        legacy_irq_for_vector(vector)
    }

    fn is_spurious(&mut self, irq: u8) -> bool {
        match irq {
            7 => Self::in_service(MASTER_COMMAND) & 0x80 == 0,
            15 => {
                let spurious = Self::in_service(SLAVE_COMMAND) & 0x80 == 0;
                if spurious {
                    // The master saw a real request on the cascade line.
                    let mut master: Port<u8> = Port::new(MASTER_COMMAND);
                    // SAFETY: a plain EOI to the master command port.
                    unsafe { master.write(EOI) };
                }
                spurious
            }
            _ => false,
        }
    }
}

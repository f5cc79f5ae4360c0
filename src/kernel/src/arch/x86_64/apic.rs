//! Local APIC and I/O APIC.
//!
//! Both are memory mapped. Their register pages are mapped into the kernel
//! address space as device memory at boot, so the frames stay unmanaged.
//!
//! There is no ACPI parsing: the I/O APIC is assumed at its conventional
//! address and ISA IRQ `n` is taken to be pin `n`.

use super::pit;
use crate::config::{APIC_SPURIOUS_VECTOR, IRQ_BASE, MMIO_WINDOW_START, PAGE_SIZE, TIMER_VECTOR};
use crate::interrupts::controller::{apic_timer_initial_count, RedirectionEntry};
use crate::memory::AddressSpace;
use kestrel_common::{IrqError, MemError};
use kestrel_hal::{ControllerKind, InterruptController, RouteError};
use x86_64::registers::model_specific::Msr;
use x86_64::structures::paging::PageTableFlags;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const IOAPIC_DEFAULT_BASE: u64 = 0xFEC0_0000;

// Local APIC registers.
const LAPIC_ID: u64 = 0x20;
const LAPIC_TPR: u64 = 0x80;
const LAPIC_EOI: u64 = 0xB0;
const LAPIC_SVR: u64 = 0xF0;
const LAPIC_LVT_TIMER: u64 = 0x320;
const LAPIC_TIMER_INITIAL: u64 = 0x380;
const LAPIC_TIMER_CURRENT: u64 = 0x390;
const LAPIC_TIMER_DIVIDE: u64 = 0x3E0;

const SVR_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;
const LVT_PERIODIC: u32 = 1 << 17;
const DIVIDE_BY_16: u32 = 0b0011;
const CALIBRATION_MS: u32 = 10;

// I/O APIC registers.
const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
const IOAPIC_VERSION: u32 = 0x01;
const IOAPIC_REDIRECTION: u32 = 0x10;

/// Pins tracked per I/O APIC.
const MAX_PINS: u8 = 64;

/// The local APIC register page.
#[derive(Debug, Clone, Copy)]
pub struct LocalApic {
    base: u64,
}

impl LocalApic {
    /// The local APIC at its boot-time mapping.
    ///
    /// Only meaningful once an [`ApicController`] has been created.
    pub fn mapped() -> Self {
        Self {
            base: MMIO_WINDOW_START,
        }
    }

    fn read(&self, reg: u64) -> u32 {
        // SAFETY: `base` maps the local APIC page; registers are 32-bit
        // aligned and must be accessed with volatile 32-bit loads.
        unsafe { core::ptr::read_volatile((self.base + reg) as *const u32) }
    }

    fn write(&mut self, reg: u64, value: u32) {
        // SAFETY: as for `read`.
        unsafe { core::ptr::write_volatile((self.base + reg) as *mut u32, value) }
    }

    /// Starts the timer at `hz` in periodic mode, calibrated against the PIT.
    pub fn start_timer(&mut self, hz: u32) -> Result<(), IrqError> {
        self.write(LAPIC_TIMER_DIVIDE, DIVIDE_BY_16);
        self.write(LAPIC_LVT_TIMER, LVT_MASKED | u32::from(TIMER_VECTOR));
        self.write(LAPIC_TIMER_INITIAL, u32::MAX);
        pit::wait_ms(CALIBRATION_MS);
        let elapsed = u32::MAX - self.read(LAPIC_TIMER_CURRENT);
        self.write(LAPIC_TIMER_INITIAL, 0);

        let initial = apic_timer_initial_count(elapsed, CALIBRATION_MS, hz)?;
        self.write(LAPIC_LVT_TIMER, LVT_PERIODIC | u32::from(TIMER_VECTOR));
        self.write(LAPIC_TIMER_DIVIDE, DIVIDE_BY_16);
        self.write(LAPIC_TIMER_INITIAL, initial);
        log::info!(
            "APIC timer at {} Hz ({} counts per {} ms, initial {})",
            hz,
            elapsed,
            CALIBRATION_MS,
            initial
        );
        Ok(())
    }
}

/// Local APIC plus one I/O APIC.
pub struct ApicController {
    lapic: LocalApic,
    ioapic: u64,
    pins: u8,
    vectors: [u8; MAX_PINS as usize],
    masked: u64,
}

impl ApicController {
    /// Maps both register pages into `memory` and builds the driver.
    pub fn new(memory: &mut AddressSpace) -> Result<Self, MemError> {
        // SAFETY: IA32_APIC_BASE exists whenever CPUID reports an APIC.
        let lapic_phys = unsafe { Msr::new(IA32_APIC_BASE).read() } & 0x000F_FFFF_FFFF_F000;
        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::NO_CACHE
            | PageTableFlags::WRITE_THROUGH;
        let lapic = LocalApic::mapped();
        let ioapic = MMIO_WINDOW_START + PAGE_SIZE;
        memory.map(lapic.base, lapic_phys, flags)?;
        memory.map(ioapic, IOAPIC_DEFAULT_BASE, flags)?;

        let mut controller = Self {
            lapic,
            ioapic,
            pins: 0,
            vectors: core::array::from_fn(|pin| IRQ_BASE.wrapping_add(pin as u8)),
            masked: u64::MAX,
        };
        let max_entry = (controller.io_read(IOAPIC_VERSION) >> 16) & 0xFF;
        controller.pins = (max_entry as u8).saturating_add(1).min(MAX_PINS);
        log::info!(
            "local APIC {} at {:#x}, I/O APIC at {:#x} with {} pins",
            controller.lapic.read(LAPIC_ID) >> 24,
            lapic_phys,
            IOAPIC_DEFAULT_BASE,
            controller.pins
        );
        Ok(controller)
    }

    fn io_read(&self, reg: u32) -> u32 {
        // SAFETY: `ioapic` maps the I/O APIC page; IOREGSEL selects the
        // register IOWIN then exposes.
        unsafe {
            core::ptr::write_volatile((self.ioapic + IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((self.ioapic + IOWIN) as *const u32)
        }
    }

    fn io_write(&mut self, reg: u32, value: u32) {
        // SAFETY: as for `io_read`.
        unsafe {
            core::ptr::write_volatile((self.ioapic + IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((self.ioapic + IOWIN) as *mut u32, value);
        }
    }

    fn write_entry(&mut self, pin: u8) {
        let mut entry = RedirectionEntry::masked(self.vectors[pin as usize]);
        entry.masked = self.masked & (1u64 << pin) != 0;
        let (low, high) = entry.encode();
        let reg = IOAPIC_REDIRECTION + 2 * u32::from(pin);
        self.io_write(reg + 1, high);
        self.io_write(reg, low);
    }
}

impl InterruptController for ApicController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Apic
    }

    fn init(&mut self) {
        super::pic::LegacyPic::disable();

        let mut msr = Msr::new(IA32_APIC_BASE);
        // SAFETY: setting the global enable bit keeps the base address.
        unsafe {
            let base = msr.read();
            msr.write(base | APIC_GLOBAL_ENABLE);
        }
        self.lapic.write(LAPIC_TPR, 0);
        self.lapic.write(LAPIC_SVR, SVR_ENABLE | u32::from(APIC_SPURIOUS_VECTOR));

        self.masked = u64::MAX;
        for pin in 0..self.pins {
            self.write_entry(pin);
        }
    }

    fn mask(&mut self, irq: u8) {
        if irq < self.pins {
            self.masked |= 1u64 << irq;
            self.write_entry(irq);
        }
    }

    fn unmask(&mut self, irq: u8) {
        if irq < self.pins {
            self.masked &= !(1u64 << irq);
            self.write_entry(irq);
        }
    }

    fn is_masked(&self, irq: u8) -> bool {
        irq >= self.pins || self.masked & (1u64 << irq) != 0
    }

    fn end_of_interrupt(&mut self, _irq: u8) {
        self.lapic.write(LAPIC_EOI, 0);
    }

    fn route(&mut self, irq: u8, vector: u8) -> Result<(), RouteError> {
        if irq >= self.pins {
            return Err(RouteError::NoSuchIrq);
        }
        if vector < IRQ_BASE || vector == APIC_SPURIOUS_VECTOR {
            return Err(RouteError::FixedVector);
        }
        self.vectors[irq as usize] = vector;
        self.write_entry(irq);
        Ok(())
    }

    fn irq_for_vector(&self, vector: u8) -> Option<u8> {
        if vector == TIMER_VECTOR {
            // The local timer shares pin 0's vector; both take a LAPIC EOI.
            return Some(0);
        }
        (0..self.pins).find(|pin| self.vectors[*pin as usize] == vector)
    }
}

//! The interrupt descriptor table.
//!
//! All 256 gates point at the uniform stubs in [`trap`](super::trap), so every
//! vector reaches [`Kernel::dispatch`](crate::Kernel::dispatch). Gates are
//! interrupt gates: the CPU clears IF on entry.

use super::gdt::{self, DOUBLE_FAULT_IST_INDEX};
use super::trap;
use crate::interrupts::{Privilege, DOUBLE_FAULT, VECTOR_COUNT};
use crate::Kernel;
use core::mem::size_of;
use spin::Mutex;
use x86_64::instructions::tables::lidt;
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

const PRESENT: u16 = 1 << 15;
const INTERRUPT_GATE: u16 = 0xE << 8;

/// One 16-byte long-mode gate descriptor.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct Gate {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl Gate {
    const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        options: 0,
        offset_mid: 0,
        offset_high: 0,
        reserved: 0,
    };

    fn new(handler: u64, selector: u16, ist: Option<u16>, dpl: u8) -> Self {
        let ist = ist.map_or(0, |index| index + 1);
        Self {
            offset_low: handler as u16,
            selector,
            options: PRESENT | INTERRUPT_GATE | (u16::from(dpl & 0b11) << 13) | ist,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    fn set_dpl(&mut self, dpl: u8) {
        self.options = (self.options & !(0b11 << 13)) | (u16::from(dpl & 0b11) << 13);
    }
}

static IDT: Mutex<[Gate; VECTOR_COUNT]> = Mutex::new([Gate::MISSING; VECTOR_COUNT]);

/// Fills every gate and loads the table.
///
/// Must run after [`gdt::init`].
pub fn init() {
    let code = gdt::selectors().code.0;
    let mut idt = IDT.lock();
    for (vector, gate) in idt.iter_mut().enumerate() {
        let ist = (vector == usize::from(DOUBLE_FAULT)).then_some(DOUBLE_FAULT_IST_INDEX);
        *gate = Gate::new(trap::stub_addr(vector as u8), code, ist, 0);
    }
    let pointer = DescriptorTablePointer {
        limit: (size_of::<[Gate; VECTOR_COUNT]>() - 1) as u16,
        base: VirtAddr::from_ptr(idt.as_ptr()),
    };
    // SAFETY: the table lives in a static, so it outlives the load, and
    // every gate points at a valid stub in the kernel code segment.
    unsafe { lidt(&pointer) };
}

/// Sets the minimum ring allowed to raise `vector` with `int n`.
pub fn set_privilege(kernel: &Kernel, vector: u8, privilege: Privilege) {
    kernel.set_privilege(vector, privilege);
    IDT.lock()[usize::from(vector)].set_dpl(privilege.dpl());
}

//! The boot processor as a [`Cpu`].

use kestrel_hal::Cpu;
use x86_64::instructions::{interrupts, tlb};
use x86_64::VirtAddr;

/// The processor the kernel runs on.
pub struct X86Cpu;

/// The one processor.
pub static CPU: X86Cpu = X86Cpu;

impl Cpu for X86Cpu {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    fn halt(&self) {
        x86_64::instructions::hlt();
    }

    fn invalidate_page(&self, addr: u64) {
        tlb::flush(VirtAddr::new_truncate(addr));
    }
}

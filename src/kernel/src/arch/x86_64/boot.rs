//! Boot sequence.
//!
//! [`init`] brings up the processor tables and the serial logger; [`bring_up`]
//! builds memory management and the kernel context on top of the
//! bootloader's environment; [`start_timer`] starts preemption.

use super::apic::LocalApic;
use super::memory::{self, BootFrameAllocator, OffsetPhysicalMemory};
use super::{gdt, idt, install, launch_config, logger, select_controller, serial, CPU};
use crate::config::{KernelConfig, IRQ_BASE, PAGE_POOL_SIZE, PAGE_POOL_START, TIMER_VECTOR};
use crate::memory::{AddressSpace, BitmapFrameAllocator};
use crate::{allocator, Kernel};
use alloc::boxed::Box;
use bootloader::BootInfo;
use kestrel_common::IrqError;
use kestrel_hal::ControllerKind;
use x86_64::VirtAddr;

/// Serial port, logger, GDT and IDT.
pub fn init(config: &KernelConfig) {
    serial::init();
    logger::init(config.log_level);
    gdt::init();
    idt::init();
    log::info!("descriptor tables loaded");
}

/// Builds the heap, the address space and the kernel context, and installs
/// it for the trap path.
///
/// Interrupts stay disabled.
pub fn bring_up(boot_info: &'static BootInfo, config: &KernelConfig) -> &'static Kernel {
    let offset = VirtAddr::new(boot_info.physical_memory_offset);
    // SAFETY: the bootloader maps all physical memory at `offset`
    // (`map_physical_memory`), and this is the only mapper created.
    let mut mapper = unsafe { memory::init_mapper(offset) };
    // SAFETY: regions the bootloader reports usable are unused.
    let mut boot_frames = unsafe { BootFrameAllocator::init(&boot_info.memory_map) };
    allocator::init_heap(&mut mapper, &mut boot_frames).expect("heap initialization failed");

    let mut frames = BitmapFrameAllocator::new(memory::usable_ranges(&boot_info.memory_map));
    for frame in boot_frames.handed_out() {
        frames.claim(frame);
    }
    // SAFETY: as for the mapper.
    let phys = unsafe { OffsetPhysicalMemory::new(offset) };
    let mut space = AddressSpace::new(
        memory::active_root(),
        Box::new(phys),
        frames,
        &CPU,
        PAGE_POOL_START..PAGE_POOL_START + PAGE_POOL_SIZE,
    );
    let stats = space.frame_stats();
    log::info!(
        "frames: {} total, {} free ({} KiB)",
        stats.total_frames,
        stats.free_frames,
        stats.free_bytes() / 1024
    );

    let controller = select_controller(config.controller, &mut space);
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(
        &CPU,
        controller,
        space,
        launch_config(),
        config,
    )));
    kernel.bind_default_builtins();
    install(kernel);
    kernel
}

/// Starts the periodic tick on the timer that goes with the controller.
pub fn start_timer(kernel: &Kernel, hz: u32) -> Result<(), IrqError> {
    match kernel.controller_kind() {
        ControllerKind::LegacyPic => {
            super::pit::start_periodic(hz)?;
            kernel.unmask_irq(TIMER_VECTOR - IRQ_BASE);
        }
        ControllerKind::Apic => LocalApic::mapped().start_timer(hz)?,
    }
    Ok(())
}

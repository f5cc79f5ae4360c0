#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kestrel_kernel::testutil::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use kestrel_kernel::arch::x86_64::{self, boot};
use kestrel_kernel::task::TaskState;
use kestrel_kernel::testutil::{exit_qemu, QemuExitCode};
use kestrel_kernel::KernelConfig;
use ::x86_64::structures::paging::PageTableFlags;

entry_point!(test_kernel_main);

fn test_kernel_main(boot_info: &'static BootInfo) -> ! {
    let config = KernelConfig::default();
    boot::init(&config);
    boot::bring_up(boot_info, &config);
    test_main();
    exit_qemu(QemuExitCode::Success);
    x86_64::halt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kestrel_kernel::testutil::test_panic_handler(info)
}

fn kernel() -> &'static kestrel_kernel::Kernel {
    x86_64::kernel().expect("kernel context installed")
}

#[test_case]
fn map_translate_unmap_on_live_tables() {
    let k = kernel();
    let page = k.alloc_pages(1).expect("alloc_pages").as_u64();
    let phys = k.translate(page).expect("mapped").as_u64();
    k.unmap(page).expect("unmap");
    assert_eq!(k.translate(page), None);

    // The frame went back to the allocator, so it can be mapped again.
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    k.map(page, phys, flags).expect("map");
    k.write_u64(page, 0xfeed).expect("write");
    assert_eq!(k.read_u64(page), Ok(0xfeed));
    k.unmap(page).expect("unmap");
}

#[test_case]
fn task_creation_allocates_a_stack() {
    let k = kernel();
    let before = k.frame_stats().free_frames;
    let id = k.task_create(idle_task, 3, 4096).expect("task_create");
    assert_eq!(k.task_state(id), Some(TaskState::Ready));
    assert!(k.frame_stats().free_frames < before);
    k.terminate(id).expect("terminate");
}

#[test_case]
fn breakpoint_resumes() {
    ::x86_64::instructions::interrupts::int3();
    assert!(!kernel().is_halted());
}

extern "C" fn idle_task() {}

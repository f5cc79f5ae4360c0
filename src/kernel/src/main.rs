//! Kestrel Kernel Entry Point
//!
//! Boots the kernel context, runs the boot-time self tests, starts two demo
//! tasks and idles.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod entry {
    use bootloader::{entry_point, BootInfo};
    use core::panic::PanicInfo;
    use kestrel_hal::Timer;
    use kestrel_kernel::arch::x86_64::{self, boot};
    use kestrel_kernel::config::DEFAULT_STACK_SIZE;
    use kestrel_kernel::{serial_println, Kernel, KernelConfig};

    entry_point!(kernel_main);

    /// Kernel entry point.
    ///
    /// Called by the bootloader after setting up the initial environment.
    fn kernel_main(boot_info: &'static BootInfo) -> ! {
        let config = KernelConfig::default();
        boot::init(&config);
        let kernel = boot::bring_up(boot_info, &config);
        log::info!("kernel context ready ({:?} controller)", kernel.controller_kind());

        kestrel_kernel::tests::run_all(kernel);

        spawn(kernel, display_task, 1);
        spawn(kernel, diagnostics_task, 5);

        if let Err(err) = boot::start_timer(kernel, config.tick_hz) {
            log::error!("no timer: {}; running without preemption", err);
        }
        log::info!("boot complete");
        ::x86_64::instructions::interrupts::enable();

        // The idle loop; the scheduler comes back here when nothing is ready.
        x86_64::halt_loop()
    }

    fn spawn(kernel: &Kernel, entry: extern "C" fn(), priority: u8) {
        match kernel.task_create(entry, priority, DEFAULT_STACK_SIZE) {
            Ok(id) => log::info!("task {} started at priority {}", id, priority),
            Err(err) => log::error!("cannot start task: {}", err),
        }
    }

    /// Prints a few heartbeats, yielding between them, then exits.
    extern "C" fn display_task() {
        let Some(kernel) = x86_64::kernel() else {
            return;
        };
        for beat in 0..5u32 {
            let uptime_ms = kernel.current_ticks() * 1000 / u64::from(kernel.frequency().max(1));
            serial_println!("[display] heartbeat {} at {} ms", beat, uptime_ms);
            x86_64::yield_now();
        }
    }

    /// Reports kernel statistics once, at lower priority than the display.
    extern "C" fn diagnostics_task() {
        let Some(kernel) = x86_64::kernel() else {
            return;
        };
        let frames = kernel.frame_stats();
        let sched = kernel.sched_stats();
        let irq = kernel.stats();
        log::info!(
            "diagnostics: {} of {} frames free, {} tasks live, {} switches, {} exceptions, {} spurious IRQs",
            frames.free_frames,
            frames.total_frames,
            sched.live_tasks,
            sched.switches,
            irq.exceptions,
            irq.spurious_irqs
        );
    }

    /// Panic handler.
    ///
    /// Called when the kernel encounters an unrecoverable error.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        x86_64::serial::unlock_for_panic();
        serial_println!("KERNEL PANIC: {}", info);
        x86_64::halt_forever()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("kestrel-kernel only runs on bare metal; build it for an x86_64 kernel target");
}

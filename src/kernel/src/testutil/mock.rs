//! Host test doubles for the hardware traits.

use crate::config::{PAGE_POOL_SIZE, PAGE_POOL_START, PAGE_SIZE};
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, BitmapFrameAllocator, PhysicalMemory};
use crate::task::LaunchConfig;
use crate::KernelConfig;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kestrel_hal::{ControllerKind, Cpu, InterruptController, RouteError};
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;

/// Frames in the simulated physical memory (2 MiB).
pub const SIM_FRAMES: usize = 512;
/// First physical address handed to the frame allocator. Lower frames are
/// unmanaged, like the low memory of a PC.
pub const MANAGED_START: u64 = 0x10000;

/// A CPU whose interrupt flag is a plain boolean.
#[derive(Default)]
pub struct MockCpu {
    enabled: AtomicBool,
    halts: AtomicUsize,
    invalidated: Mutex<Vec<u64>>,
}

impl MockCpu {
    /// Leaks a new mock so it can be used as `&'static dyn Cpu`.
    pub fn leak(interrupts_enabled: bool) -> &'static MockCpu {
        let cpu = Box::leak(Box::new(MockCpu::default()));
        cpu.enabled.store(interrupts_enabled, Ordering::SeqCst);
        cpu
    }

    /// Pages passed to `invalidate_page`, oldest first.
    pub fn invalidated(&self) -> Vec<u64> {
        self.invalidated.lock().clone()
    }

    /// Number of `halt` calls.
    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

impl Cpu for MockCpu {
    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn invalidate_page(&self, addr: u64) {
        self.invalidated.lock().push(addr);
    }
}

#[repr(C, align(4096))]
struct FrameBuf(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Zeroed frames standing in for physical RAM, indexed by frame number.
pub struct SimMemory {
    frames: Vec<Box<FrameBuf>>,
}

impl SimMemory {
    /// Creates `frames` zeroed frames covering physical `[0, frames * 4096)`.
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Box::new(FrameBuf(UnsafeCell::new([0; PAGE_SIZE as usize]))))
                .collect(),
        }
    }
}

// SAFETY: every frame is a separate 4 KiB aligned heap block that lives as
// long as the `SimMemory`, and the cell makes writes through it sound.
unsafe impl PhysicalMemory for SimMemory {
    fn frame_ptr(&self, frame: PhysFrame) -> Option<*mut u8> {
        let idx = (frame.start_address().as_u64() / PAGE_SIZE) as usize;
        self.frames.get(idx).map(|buf| buf.0.get().cast::<u8>())
    }
}

/// An address space over [`SimMemory`] with frames from [`MANAGED_START`] up managed.
pub fn address_space(cpu: &'static MockCpu) -> AddressSpace {
    address_space_with(cpu, SIM_FRAMES - (MANAGED_START / PAGE_SIZE) as usize)
}

/// Like [`address_space`] but with only `managed` allocatable frames.
pub fn address_space_with(cpu: &'static MockCpu, managed: usize) -> AddressSpace {
    let end = MANAGED_START + managed as u64 * PAGE_SIZE;
    AddressSpace::create(
        Box::new(SimMemory::new(SIM_FRAMES)),
        BitmapFrameAllocator::new([MANAGED_START..end]),
        cpu,
        PAGE_POOL_START..PAGE_POOL_START + PAGE_POOL_SIZE,
    )
    .expect("simulated memory has room for a root table")
}

/// Everything a [`MockController`] was asked to do.
#[derive(Debug, Default)]
pub struct ControllerLog {
    /// Number of `init` calls.
    pub inits: usize,
    /// IRQs acknowledged, in order.
    pub eois: Vec<u8>,
    /// Currently masked IRQs.
    pub masked: BTreeSet<u8>,
    /// `(irq, vector)` routing requests, in order.
    pub routes: Vec<(u8, u8)>,
    /// IRQs that report as spurious.
    pub spurious: BTreeSet<u8>,
}

/// A legacy-PIC-shaped controller that only records calls.
pub struct MockController {
    log: Arc<Mutex<ControllerLog>>,
}

impl MockController {
    /// Creates a controller and a handle to its call log.
    pub fn new() -> (Self, Arc<Mutex<ControllerLog>>) {
        let log = Arc::new(Mutex::new(ControllerLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl InterruptController for MockController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::LegacyPic
    }

    fn init(&mut self) {
        let mut log = self.log.lock();
        log.inits += 1;
        log.masked = (0..16).collect();
    }

    fn mask(&mut self, irq: u8) {
        self.log.lock().masked.insert(irq);
    }

    fn unmask(&mut self, irq: u8) {
        self.log.lock().masked.remove(&irq);
    }

    fn is_masked(&self, irq: u8) -> bool {
        self.log.lock().masked.contains(&irq)
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        self.log.lock().eois.push(irq);
    }

    fn route(&mut self, irq: u8, vector: u8) -> Result<(), RouteError> {
        if irq >= 16 {
            return Err(RouteError::NoSuchIrq);
        }
        self.log.lock().routes.push((irq, vector));
        Ok(())
    }

    fn irq_for_vector(&self, vector: u8) -> Option<u8> {
        (32..48).contains(&vector).then(|| vector - 32)
    }

    fn is_spurious(&mut self, irq: u8) -> bool {
        self.log.lock().spurious.contains(&irq)
    }
}

/// A kernel context over mock hardware.
pub struct TestKernel {
    /// The kernel, leaked so handlers can capture it.
    pub kernel: &'static Kernel,
    /// The CPU it runs on.
    pub cpu: &'static MockCpu,
    /// Calls made to the interrupt controller.
    pub controller: Arc<Mutex<ControllerLog>>,
}

/// Builds a kernel with the default configuration.
pub fn kernel() -> TestKernel {
    kernel_with(KernelConfig::default())
}

/// Builds a kernel with `config`.
pub fn kernel_with(config: KernelConfig) -> TestKernel {
    let cpu = MockCpu::leak(false);
    let (controller, log) = MockController::new();
    let kernel = Kernel::new(
        cpu,
        Box::new(controller),
        address_space(cpu),
        LaunchConfig::default(),
        &config,
    );
    TestKernel {
        kernel: Box::leak(Box::new(kernel)),
        cpu,
        controller: log,
    }
}

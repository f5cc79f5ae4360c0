//! The kernel context.
//!
//! One [`Kernel`] owns the vector table, the exception policies, the
//! interrupt controller, the address space and the scheduler. On hardware a
//! single instance is leaked at boot and installed for the trap entry path;
//! tests build as many independent instances as they like over mock hardware.
//!
//! Mutable state sits behind one [`IrqMutex`], so every call below from task
//! context runs with interrupts disabled for the duration of the call. The
//! exception log, counters and tick count are lock-free so the dispatcher can
//! update them no matter who holds the lock.

use crate::config::{KernelConfig, BLOCK_VECTOR, EXIT_VECTOR, IRQ_BASE, TIMER_VECTOR, YIELD_VECTOR};
use crate::interrupts::policy::ModeMirror;
use crate::interrupts::{
    Binding, Builtin, ExceptionLog, ExceptionRecord, HandlerOutcome, InterruptContext,
    InterruptTable, PolicyEntry, PolicyTable, Privilege, PAGE_FAULT,
};
use crate::memory::{AddressSpace, DemandPolicy, FrameStats};
use crate::sync::IrqMutex;
use crate::task::{LaunchConfig, SchedStats, Scheduler, TaskEntry, TaskId, TaskState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use kestrel_common::{ExceptionMode, IrqError, MemError, SchedError};
use kestrel_hal::{ControllerKind, Cpu, InterruptController, Timer};
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

/// Everything behind the kernel lock.
pub(crate) struct KernelState {
    pub(crate) table: InterruptTable,
    pub(crate) policies: PolicyTable,
    pub(crate) controller: Box<dyn InterruptController + Send>,
    pub(crate) memory: AddressSpace,
    pub(crate) scheduler: Scheduler,
    pub(crate) demand: Option<DemandPolicy>,
}

/// Dispatcher counters, updated without the kernel lock.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) exceptions: AtomicU64,
    pub(crate) recovered: AtomicU64,
    pub(crate) unhandled: AtomicU64,
    pub(crate) spurious_irqs: AtomicU64,
    pub(crate) unbound_irqs: AtomicU64,
    pub(crate) security_events: AtomicU64,
}

/// The kernel context.
pub struct Kernel {
    pub(crate) cpu: &'static dyn Cpu,
    pub(crate) nesting: AtomicUsize,
    pub(crate) max_nesting: AtomicUsize,
    pub(crate) ticks: AtomicU64,
    pub(crate) tick_hz: u32,
    pub(crate) halted: AtomicBool,
    pub(crate) counters: Counters,
    pub(crate) log: ExceptionLog,
    pub(crate) modes: ModeMirror,
    pub(crate) state: IrqMutex<KernelState>,
}

impl Kernel {
    /// Builds a kernel context and initialises the interrupt controller.
    ///
    /// The vector table starts empty; see
    /// [`bind_default_builtins`](Self::bind_default_builtins).
    pub fn new(
        cpu: &'static dyn Cpu,
        mut controller: Box<dyn InterruptController + Send>,
        memory: AddressSpace,
        launch: LaunchConfig,
        config: &KernelConfig,
    ) -> Self {
        controller.init();
        log::info!(
            "kernel context: {:?} controller, {} frames free",
            controller.kind(),
            memory.frame_stats().free_frames
        );
        let policies = PolicyTable::new();
        Self {
            cpu,
            nesting: AtomicUsize::new(0),
            max_nesting: AtomicUsize::new(0),
            ticks: AtomicU64::new(0),
            tick_hz: config.tick_hz,
            halted: AtomicBool::new(false),
            counters: Counters::default(),
            log: ExceptionLog::new(config.exception_log_capacity),
            modes: ModeMirror::new(&policies),
            state: IrqMutex::new(
                cpu,
                KernelState {
                    table: InterruptTable::new(),
                    policies,
                    controller,
                    memory,
                    scheduler: Scheduler::new(launch),
                    demand: config.demand_paging,
                },
            ),
        }
    }

    /// The processor this kernel runs on.
    pub fn cpu(&self) -> &'static dyn Cpu {
        self.cpu
    }

    // Interrupt table

    /// Binds `handler` to `vector`, replacing whatever was bound.
    ///
    /// For exceptions the handler only runs when the vector's policy is
    /// [`ExceptionMode::Recover`]. It runs without the kernel lock, so it may
    /// call back into the kernel.
    pub fn register_handler<F>(&self, vector: u8, handler: F)
    where
        F: Fn(&mut InterruptContext<'_>) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.bind(vector, Binding::User(Arc::new(handler)));
    }

    /// Binds a kernel built-in to `vector`.
    pub fn bind_builtin(&self, vector: u8, builtin: Builtin) {
        self.bind(vector, Binding::Builtin(builtin));
    }

    /// Clears the binding for `vector`.
    pub fn unbind(&self, vector: u8) {
        self.bind(vector, Binding::Unbound);
    }

    fn bind(&self, vector: u8, binding: Binding) {
        log::debug!("vector {:#04x} bound to {:?}", vector, binding);
        let previous = self.state.lock().table.bind(vector, binding);
        // Dropped outside the lock: it may be the last reference to a closure.
        drop(previous);
    }

    /// Binds the page-fault, timer, yield, block and task-exit built-ins to
    /// their vectors.
    pub fn bind_default_builtins(&self) {
        let mut state = self.state.lock();
        state.table.bind(PAGE_FAULT, Binding::Builtin(Builtin::PageFault));
        state.table.bind(TIMER_VECTOR, Binding::Builtin(Builtin::Timer));
        state.table.bind(YIELD_VECTOR, Binding::Builtin(Builtin::Yield));
        state.table.bind(BLOCK_VECTOR, Binding::Builtin(Builtin::Block));
        state.table.bind(EXIT_VECTOR, Binding::Builtin(Builtin::TaskExit));
    }

    /// Returns a copy of the binding for `vector`.
    pub fn binding(&self, vector: u8) -> Binding {
        self.state.lock().table.slot(vector).binding.clone()
    }

    /// Records the minimum privilege for raising `vector` with `int n`.
    ///
    /// The hardware gate is updated by the arch layer, which reads this back.
    pub fn set_privilege(&self, vector: u8, privilege: Privilege) {
        self.state.lock().table.set_privilege(vector, privilege);
    }

    /// Minimum privilege for raising `vector`.
    pub fn privilege(&self, vector: u8) -> Privilege {
        self.state.lock().table.slot(vector).privilege
    }

    // Exception policy

    /// Sets how exception `vector` (0-31) is handled.
    pub fn set_exception_policy(&self, vector: u8, mode: ExceptionMode) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        state.policies.set_mode(vector, mode)?;
        self.modes.sync(&state.policies, vector);
        drop(state);
        log::debug!("exception {} policy set to {}", vector, mode.as_str());
        Ok(())
    }

    /// Enables or disables the policy entry for `vector`.
    pub fn set_exception_enabled(&self, vector: u8, enabled: bool) -> Result<(), IrqError> {
        let mut state = self.state.lock();
        state.policies.set_enabled(vector, enabled)?;
        self.modes.sync(&state.policies, vector);
        Ok(())
    }

    /// The policy entry and counters for `vector`, or `None` above 31.
    pub fn exception_policy(&self, vector: u8) -> Option<PolicyEntry> {
        self.state.lock().policies.get(vector).copied()
    }

    /// Clears the per-vector exception counters.
    pub fn clear_exception_counters(&self) {
        self.state.lock().policies.clear_counters();
    }

    /// Removes and returns the logged exceptions, oldest first.
    pub fn drain_exception_log(&self) -> Vec<ExceptionRecord> {
        self.log.drain()
    }

    /// Sets or clears the demand-zero paging policy.
    pub fn set_demand_policy(&self, policy: Option<DemandPolicy>) {
        self.state.lock().demand = policy;
    }

    /// Current interrupt nesting depth.
    pub fn nesting(&self) -> usize {
        self.nesting.load(Ordering::Acquire)
    }

    /// Timer ticks seen so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Returns true once the dispatcher reported a fatal condition.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    // Interrupt controller

    /// The controller family in use.
    pub fn controller_kind(&self) -> ControllerKind {
        self.state.lock().controller.kind()
    }

    /// Masks an IRQ line.
    pub fn mask_irq(&self, irq: u8) {
        self.state.lock().controller.mask(irq);
    }

    /// Unmasks an IRQ line.
    pub fn unmask_irq(&self, irq: u8) {
        self.state.lock().controller.unmask(irq);
    }

    /// Returns true if `irq` is masked.
    pub fn is_irq_masked(&self, irq: u8) -> bool {
        self.state.lock().controller.is_masked(irq)
    }

    /// Delivers `irq` on `vector`.
    ///
    /// Vectors below 32 belong to CPU exceptions and are refused.
    pub fn route_irq(&self, irq: u8, vector: u8) -> Result<(), IrqError> {
        if vector < IRQ_BASE {
            return Err(IrqError::InvalidVector);
        }
        self.state
            .lock()
            .controller
            .route(irq, vector)
            .map_err(|err| {
                log::warn!("cannot route IRQ {} to vector {:#04x}: {:?}", irq, vector, err);
                IrqError::Unsupported
            })
    }

    // Memory

    /// Maps the page at `virt` to the frame at `phys`.
    pub fn map(&self, virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), MemError> {
        self.state.lock().memory.map(virt, phys, flags)
    }

    /// Removes the mapping at `virt`, if any.
    pub fn unmap(&self, virt: u64) -> Result<(), MemError> {
        self.state.lock().memory.unmap(virt)
    }

    /// Translates a virtual address.
    pub fn translate(&self, virt: u64) -> Option<PhysAddr> {
        self.state.lock().memory.translate(virt)
    }

    /// Maps `count` fresh zeroed pages and returns the first.
    pub fn alloc_pages(&self, count: usize) -> Result<VirtAddr, MemError> {
        self.state.lock().memory.alloc_pages(count)
    }

    /// Unmaps `count` pages from `base` and releases their frames.
    pub fn free_pages(&self, base: u64, count: usize) -> Result<(), MemError> {
        self.state.lock().memory.free_pages(base, count)
    }

    /// Reads a `u64` through the kernel address space.
    pub fn read_u64(&self, virt: u64) -> Result<u64, MemError> {
        self.state.lock().memory.read_u64(virt)
    }

    /// Writes a `u64` through the kernel address space.
    pub fn write_u64(&self, virt: u64, value: u64) -> Result<(), MemError> {
        self.state.lock().memory.write_u64(virt, value)
    }

    /// Physical frame counters.
    pub fn frame_stats(&self) -> FrameStats {
        self.state.lock().memory.frame_stats()
    }

    // Tasks

    /// Creates a task that starts at `entry` on a fresh stack.
    ///
    /// The task is queued behind every ready task of the same priority and
    /// runs no earlier than the next scheduling pass.
    pub fn task_create(
        &self,
        entry: TaskEntry,
        priority: u8,
        stack_size: usize,
    ) -> Result<TaskId, SchedError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state
            .scheduler
            .create(entry, priority, stack_size, &mut state.memory)
    }

    /// Makes a blocked task ready again.
    pub fn wake(&self, id: TaskId) -> Result<(), SchedError> {
        self.state.lock().scheduler.wake(id)
    }

    /// Terminates a task that is not currently running.
    pub fn terminate(&self, id: TaskId) -> Result<(), SchedError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.scheduler.terminate(id, &mut state.memory)
    }

    /// State of a task, or `None` once it is gone.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.state.lock().scheduler.state(id)
    }

    /// The running task, or `None` while idle.
    pub fn current_task(&self) -> Option<TaskId> {
        self.state.lock().scheduler.current()
    }

    /// Scheduler counters.
    pub fn sched_stats(&self) -> SchedStats {
        self.state.lock().scheduler.stats()
    }
}

impl Timer for Kernel {
    fn current_ticks(&self) -> u64 {
        self.ticks()
    }

    fn frequency(&self) -> u32 {
        self.tick_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock;

    extern "C" fn entry() {}

    #[test]
    fn new_kernel_initialises_the_controller() {
        let k = mock::kernel();
        assert_eq!(k.controller.lock().inits, 1);
        assert_eq!(k.kernel.controller_kind(), ControllerKind::LegacyPic);
        assert!(k.kernel.is_irq_masked(0));
        k.kernel.unmask_irq(0);
        assert!(!k.kernel.is_irq_masked(0));
    }

    #[test]
    fn lock_restores_interrupt_state() {
        let k = mock::kernel();
        k.cpu.enable_interrupts();
        k.kernel.map(0x1000, 0x2000, PageTableFlags::PRESENT | PageTableFlags::WRITABLE).unwrap();
        assert!(k.cpu.interrupts_enabled());
    }

    #[test]
    fn map_write_read_unmap() {
        let k = mock::kernel().kernel;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        k.map(0x1000, 0x20000, flags).unwrap();
        assert_eq!(k.translate(0x1abc), Some(PhysAddr::new(0x20abc)));
        k.write_u64(0x1008, 42).unwrap();
        assert_eq!(k.read_u64(0x1008), Ok(42));
        k.unmap(0x1000).unwrap();
        assert_eq!(k.translate(0x1000), None);
        assert_eq!(k.read_u64(0x1008), Err(MemError::NotMapped));
    }

    #[test]
    fn routing_rejects_exception_vectors() {
        let k = mock::kernel();
        assert_eq!(k.kernel.route_irq(1, 5), Err(IrqError::InvalidVector));
        assert_eq!(k.kernel.route_irq(20, 0x40), Err(IrqError::Unsupported));
        k.kernel.route_irq(1, 0x41).unwrap();
        assert_eq!(k.controller.lock().routes, [(1, 0x41)]);
    }

    #[test]
    fn policy_changes_go_through_the_table() {
        let k = mock::kernel().kernel;
        k.set_exception_policy(PAGE_FAULT, ExceptionMode::Log).unwrap();
        assert_eq!(k.exception_policy(PAGE_FAULT).unwrap().mode, Some(ExceptionMode::Log));
        assert_eq!(
            k.set_exception_policy(8, ExceptionMode::Ignore),
            Err(IrqError::PolicyLocked)
        );
        assert_eq!(
            k.set_exception_policy(40, ExceptionMode::Log),
            Err(IrqError::NotAnException)
        );
        assert!(k.exception_policy(40).is_none());
    }

    #[test]
    fn task_create_reports_errors_to_the_caller() {
        let k = mock::kernel().kernel;
        let id = k.task_create(entry, 1, 4096).unwrap();
        assert_eq!(k.task_state(id), Some(TaskState::Ready));
        assert_eq!(k.task_create(entry, 99, 4096), Err(SchedError::InvalidPriority));
        assert_eq!(k.sched_stats().live_tasks, 1);
        k.terminate(id).unwrap();
        assert_eq!(k.task_state(id), None);
    }

    #[test]
    fn timer_view_reports_the_configured_rate() {
        let k = mock::kernel_with(KernelConfig {
            tick_hz: 250,
            ..KernelConfig::default()
        })
        .kernel;
        assert_eq!(k.frequency(), 250);
        assert_eq!(k.current_ticks(), 0);
    }

    #[test]
    fn rebinding_replaces_the_previous_handler() {
        let k = mock::kernel().kernel;
        k.bind_builtin(0x40, Builtin::Yield);
        k.register_handler(0x40, |_| HandlerOutcome::Handled);
        assert!(matches!(k.binding(0x40), Binding::User(_)));
        k.unbind(0x40);
        assert!(!k.binding(0x40).is_bound());
    }
}

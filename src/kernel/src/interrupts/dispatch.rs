//! The dispatcher.
//!
//! Every vector enters through [`Kernel::dispatch`] with the trap frame the
//! assembly stub built. Exceptions (0-31) are filtered through the policy
//! table before any handler runs; everything above is an IRQ or a software
//! interrupt, which runs its binding and is then acknowledged at the
//! controller.
//!
//! Built-ins run with the kernel lock held. Registered handlers run without
//! it so they can call back into the kernel and so that an interrupt nested
//! inside one finds the lock free.

use super::frame::{InterruptContext, TrapFrame};
use super::log::ExceptionRecord;
use super::table::{Binding, Builtin, HandlerOutcome};
use super::{vector_name, DOUBLE_FAULT, EXCEPTION_COUNT, NMI, PAGE_FAULT};
use crate::config::APIC_SPURIOUS_VECTOR;
use crate::kernel::{Kernel, KernelState};
use crate::memory::FaultResolution;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kestrel_common::{ExceptionMode, FaultCode};

/// Why the dispatcher gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// A double fault. Never recoverable.
    DoubleFault,
    /// The policy for the vector is `fatal`.
    PolicyFatal,
    /// The vector has no policy, or its entry is disabled.
    Unset,
    /// The policy is `recover` but nothing is bound to the vector.
    NoHandler,
    /// The bound handler reported it could not recover.
    NotRecovered,
    /// The page-fault handler could not resolve the fault.
    PageFault(FaultResolution),
    /// An exception arrived while the kernel lock was held.
    KernelStateBusy,
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::DoubleFault => write!(f, "double fault"),
            FatalReason::PolicyFatal => write!(f, "policy is fatal"),
            FatalReason::Unset => write!(f, "no policy set"),
            FatalReason::NoHandler => write!(f, "no handler bound"),
            FatalReason::NotRecovered => write!(f, "handler did not recover"),
            FatalReason::PageFault(res) => write!(f, "unresolved page fault ({:?})", res),
            FatalReason::KernelStateBusy => write!(f, "kernel state locked by interrupted code"),
        }
    }
}

/// Everything known about a fatal trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalReport {
    /// Vector that trapped.
    pub vector: u8,
    /// Why it is fatal.
    pub reason: FatalReason,
    /// CR2 at the time of the trap.
    pub fault_addr: u64,
    /// Registers of the interrupted context.
    pub frame: TrapFrame,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.frame;
        writeln!(
            f,
            "FATAL: vector {} ({}): {}",
            self.vector,
            vector_name(self.vector),
            self.reason
        )?;
        writeln!(f, "  error code {:#x}  fault address {:#018x}", r.error_code, self.fault_addr)?;
        if self.vector == PAGE_FAULT {
            writeln!(f, "  access: {}", FaultCode::decode(r.error_code).access())?;
        }
        writeln!(f, "  rip {:#018x}  cs {:#06x}  rflags {:#010x}", r.rip, r.cs, r.rflags)?;
        writeln!(f, "  rsp {:#018x}  ss {:#06x}", r.rsp, r.ss)?;
        writeln!(f, "  rax {:#018x}  rbx {:#018x}  rcx {:#018x}", r.rax, r.rbx, r.rcx)?;
        writeln!(f, "  rdx {:#018x}  rsi {:#018x}  rdi {:#018x}", r.rdx, r.rsi, r.rdi)?;
        writeln!(f, "  rbp {:#018x}  r8  {:#018x}  r9  {:#018x}", r.rbp, r.r8, r.r9)?;
        writeln!(f, "  r10 {:#018x}  r11 {:#018x}  r12 {:#018x}", r.r10, r.r11, r.r12)?;
        write!(f, "  r13 {:#018x}  r14 {:#018x}  r15 {:#018x}", r.r13, r.r14, r.r15)
    }
}

/// What the trap layer does once [`Kernel::dispatch`] returns.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Return from the trap through the (possibly rewritten) frame.
    Resume,
    /// Dump the report and halt with interrupts disabled.
    Halt(FatalReport),
}

impl DispatchOutcome {
    /// Returns true for [`DispatchOutcome::Halt`].
    pub fn is_halt(&self) -> bool {
        matches!(self, DispatchOutcome::Halt(_))
    }
}

/// Snapshot of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Exceptions raised (vectors 0-31).
    pub exceptions: u64,
    /// Exceptions a `recover` handler resolved.
    pub recovered: u64,
    /// Traps that ended in a halt.
    pub unhandled: u64,
    /// Spurious IRQs dropped without acknowledgement.
    pub spurious_irqs: u64,
    /// IRQs that arrived on an unbound vector.
    pub unbound_irqs: u64,
    /// Protection violations seen.
    pub security_events: u64,
    /// Deepest interrupt nesting observed.
    pub max_nesting: usize,
}

/// Keeps the nesting counter balanced on every return path.
struct NestingGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> NestingGuard<'a> {
    fn enter(depth: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = depth.fetch_add(1, Ordering::AcqRel) + 1;
        max.fetch_max(now, Ordering::Relaxed);
        Self { depth }
    }
}

impl Drop for NestingGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Kernel {
    /// Handles one trap.
    ///
    /// `frame.vector` selects the vector; `fault_addr` is CR2, meaningful
    /// for page faults only. The frame may be rewritten (a context switch, or
    /// a handler skipping the faulting instruction) before the trap returns.
    pub fn dispatch(&self, frame: &mut TrapFrame, fault_addr: u64) -> DispatchOutcome {
        let _nesting = NestingGuard::enter(&self.nesting, &self.max_nesting);
        let vector = frame.vector as u8;
        if (vector as usize) < EXCEPTION_COUNT {
            self.dispatch_exception(vector, frame, fault_addr)
        } else {
            self.dispatch_irq(vector, frame)
        }
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            exceptions: c.exceptions.load(Ordering::Relaxed),
            recovered: c.recovered.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            spurious_irqs: c.spurious_irqs.load(Ordering::Relaxed),
            unbound_irqs: c.unbound_irqs.load(Ordering::Relaxed),
            security_events: c.security_events.load(Ordering::Relaxed),
            max_nesting: self.max_nesting.load(Ordering::Relaxed),
        }
    }

    fn dispatch_exception(&self, vector: u8, frame: &mut TrapFrame, fault_addr: u64) -> DispatchOutcome {
        self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
        if vector == DOUBLE_FAULT {
            return self.halt(FatalReason::DoubleFault, frame, fault_addr);
        }
        let security = vector == PAGE_FAULT && FaultCode::decode(frame.error_code).is_protection_violation();

        // Only `recover` needs the kernel lock. The other modes resolve from
        // the lock-free mirror so an NMI landing inside a locked section is
        // still handled by its policy.
        let (mode, configured) = self.modes.load(vector);
        match mode {
            ExceptionMode::Ignore => {
                self.count_occurrence(vector);
                DispatchOutcome::Resume
            }
            ExceptionMode::Log => {
                self.count_occurrence(vector);
                self.record_exception(vector, frame, fault_addr, security);
                // An NMI can interrupt a holder of the serial lock.
                if vector != NMI {
                    log::warn!(
                        "{} at {:#x} (error {:#x}), resuming",
                        vector_name(vector),
                        frame.rip,
                        frame.error_code
                    );
                }
                DispatchOutcome::Resume
            }
            ExceptionMode::Fatal => {
                self.count_occurrence(vector);
                if security {
                    self.record_exception(vector, frame, fault_addr, true);
                }
                let reason = if configured {
                    FatalReason::PolicyFatal
                } else {
                    FatalReason::Unset
                };
                self.halt(reason, frame, fault_addr)
            }
            ExceptionMode::Recover => self.recover(vector, frame, fault_addr, security),
        }
    }

    /// Counts `vector` in its policy entry.
    ///
    /// Skipped when the kernel lock is already held; the global counters and
    /// the exception log still see the event.
    fn count_occurrence(&self, vector: u8) {
        if let Some(mut state) = self.state.try_lock() {
            state.policies.record(vector, self.ticks());
        }
    }

    fn recover(&self, vector: u8, frame: &mut TrapFrame, fault_addr: u64, security: bool) -> DispatchOutcome {
        let Some(mut state) = self.state.try_lock() else {
            return self.halt(FatalReason::KernelStateBusy, frame, fault_addr);
        };
        state.policies.record(vector, self.ticks());

        let binding = state.table.slot(vector).binding.clone();
        let result = match binding {
            Binding::Unbound => Err(FatalReason::NoHandler),
            Binding::Builtin(builtin) => self.run_builtin(&mut state, builtin, frame, fault_addr),
            Binding::User(handler) => {
                drop(state);
                let outcome = handler(&mut InterruptContext {
                    vector,
                    error_code: frame.error_code,
                    fault_addr,
                    frame: &mut *frame,
                });
                state = self.state.lock();
                match outcome {
                    HandlerOutcome::Handled => Ok(()),
                    HandlerOutcome::NotRecovered => Err(FatalReason::NotRecovered),
                }
            }
        };
        match result {
            Ok(()) => {
                state.policies.record_recovery(vector);
                self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Resume
            }
            Err(reason) => {
                drop(state);
                // The page-fault built-in records its own security events.
                if security && !matches!(reason, FatalReason::PageFault(_)) {
                    self.record_exception(vector, frame, fault_addr, true);
                }
                self.halt(reason, frame, fault_addr)
            }
        }
    }

    fn dispatch_irq(&self, vector: u8, frame: &mut TrapFrame) -> DispatchOutcome {
        if vector == APIC_SPURIOUS_VECTOR {
            self.counters.spurious_irqs.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Resume;
        }
        let Some(mut state) = self.state.try_lock() else {
            return self.halt(FatalReason::KernelStateBusy, frame, 0);
        };

        let irq = state.controller.irq_for_vector(vector);
        if let Some(irq) = irq {
            if state.controller.is_spurious(irq) {
                self.counters.spurious_irqs.fetch_add(1, Ordering::Relaxed);
                log::trace!("spurious IRQ {}", irq);
                return DispatchOutcome::Resume;
            }
        }

        let binding = state.table.slot(vector).binding.clone();
        match binding {
            Binding::Unbound => {
                self.counters.unbound_irqs.fetch_add(1, Ordering::Relaxed);
                log::trace!("unbound vector {:#04x}", vector);
            }
            Binding::Builtin(builtin) => {
                if let Err(reason) = self.run_builtin(&mut state, builtin, frame, 0) {
                    drop(state);
                    return self.halt(reason, frame, 0);
                }
            }
            Binding::User(handler) => {
                drop(state);
                let outcome = handler(&mut InterruptContext {
                    vector,
                    error_code: 0,
                    fault_addr: 0,
                    frame: &mut *frame,
                });
                if outcome == HandlerOutcome::NotRecovered {
                    log::warn!("handler for vector {:#04x} reported failure", vector);
                }
                state = self.state.lock();
            }
        }

        if let Some(irq) = irq {
            state.controller.end_of_interrupt(irq);
        }
        DispatchOutcome::Resume
    }

    fn run_builtin(
        &self,
        state: &mut KernelState,
        builtin: Builtin,
        frame: &mut TrapFrame,
        fault_addr: u64,
    ) -> Result<(), FatalReason> {
        match builtin {
            Builtin::Timer => {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                state.scheduler.tick(frame, &mut state.memory);
            }
            Builtin::Yield => {
                state.scheduler.yield_now(frame, &mut state.memory);
            }
            Builtin::Block => {
                state.scheduler.block_current(frame, &mut state.memory);
            }
            Builtin::TaskExit => {
                state.scheduler.exit_current(frame, &mut state.memory);
            }
            Builtin::PageFault => {
                let code = FaultCode::decode(frame.error_code);
                let resolution = state.memory.handle_fault(code, fault_addr, state.demand.as_ref());
                if resolution.is_security_event() {
                    self.record_exception(PAGE_FAULT, frame, fault_addr, true);
                }
                if !resolution.is_resolved() {
                    return Err(FatalReason::PageFault(resolution));
                }
                log::debug!("page fault at {:#x} resolved: {:?}", fault_addr, resolution);
            }
        }
        Ok(())
    }

    fn record_exception(&self, vector: u8, frame: &TrapFrame, fault_addr: u64, security: bool) {
        if security {
            self.counters.security_events.fetch_add(1, Ordering::Relaxed);
        }
        self.log.record(ExceptionRecord {
            vector,
            error_code: frame.error_code,
            fault_addr: if vector == PAGE_FAULT { fault_addr } else { 0 },
            rip: frame.rip,
            tick: self.ticks(),
            security,
        });
    }

    fn halt(&self, reason: FatalReason, frame: &TrapFrame, fault_addr: u64) -> DispatchOutcome {
        self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        self.halted.store(true, Ordering::Release);
        DispatchOutcome::Halt(FatalReport {
            vector: frame.vector as u8,
            reason,
            fault_addr,
            frame: *frame,
        })
    }
}

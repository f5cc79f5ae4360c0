//! Strict-priority round-robin scheduler.
//!
//! One FIFO ready queue per priority level; the lowest non-empty level always
//! wins, ties rotate. There is no aging, so a task that stays ready at a more
//! urgent level starves every less urgent one.
//!
//! Switching happens in the interrupt return path. Every entry point takes the
//! trap frame of the interrupted context, saves it into the outgoing TCB, and
//! overwrites it with the incoming task's saved frame. When nothing is ready
//! the frame of the boot thread's idle loop is resumed instead.
//!
//! Task code runs on its own stack in ring 0, so trap handlers run on the
//! interrupted task's stack too. A terminated task's stack therefore cannot be
//! released in the pass that switches away from it; it is reaped at the start
//! of the next pass.

use super::context::{initial_context, LaunchConfig};
use super::{TaskEntry, TaskId, TaskState, STACK_CANARY};
use crate::config::{MAX_STACK_SIZE, PAGE_SIZE, PRIORITY_LEVELS};
use crate::interrupts::TrapFrame;
use crate::memory::{pages_for, AddressSpace};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use kestrel_common::{MemError, SchedError};

/// A task stack: `pages` pages starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    /// Lowest address.
    pub base: u64,
    /// Size in pages.
    pub pages: usize,
}

impl Stack {
    /// One past the highest address.
    pub fn top(&self) -> u64 {
        self.base + self.pages as u64 * PAGE_SIZE
    }
}

/// Where task stacks come from.
pub trait StackSource {
    /// Allocates a stack of at least `bytes` bytes.
    fn alloc_stack(&mut self, bytes: usize) -> Result<Stack, MemError>;
    /// Releases a stack returned by `alloc_stack`.
    fn free_stack(&mut self, stack: Stack);
    /// Reads a `u64` from stack memory.
    fn read_u64(&self, addr: u64) -> Result<u64, MemError>;
    /// Writes a `u64` to stack memory.
    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemError>;
}

impl StackSource for AddressSpace {
    fn alloc_stack(&mut self, bytes: usize) -> Result<Stack, MemError> {
        let pages = pages_for(bytes);
        let base = self.alloc_pages(pages)?;
        Ok(Stack {
            base: base.as_u64(),
            pages,
        })
    }

    fn free_stack(&mut self, stack: Stack) {
        if let Err(err) = self.free_pages(stack.base, stack.pages) {
            log::error!("failed to release stack at {:#x}: {}", stack.base, err);
        }
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemError> {
        AddressSpace::read_u64(self, addr)
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemError> {
        AddressSpace::write_u64(self, addr, value)
    }
}

/// Task control block.
#[derive(Debug, Clone)]
pub struct Tcb {
    id: TaskId,
    priority: u8,
    state: TaskState,
    context: TrapFrame,
    stack: Stack,
    entry: u64,
}

impl Tcb {
    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Priority level; 0 is the most urgent.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Scheduling state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Saved context; meaningless while the task runs.
    pub fn context(&self) -> &TrapFrame {
        &self.context
    }

    /// The task's stack.
    pub fn stack(&self) -> Stack {
        self.stack
    }

    /// Entry point address.
    pub fn entry(&self) -> u64 {
        self.entry
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Timer ticks seen.
    pub ticks: u64,
    /// Times the running context changed.
    pub switches: u64,
    /// Tasks that have not terminated.
    pub live_tasks: usize,
    /// Tasks that terminated.
    pub terminated: u64,
}

/// What happens to the outgoing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outgoing {
    Requeue,
    Block,
    Exit,
}

/// The priority scheduler.
pub struct Scheduler {
    tasks: BTreeMap<TaskId, Tcb>,
    ready: [VecDeque<TaskId>; PRIORITY_LEVELS],
    current: Option<TaskId>,
    idle: Option<TrapFrame>,
    reap: Vec<TaskId>,
    launch: LaunchConfig,
    next_id: u64,
    stats: SchedStats,
}

impl Scheduler {
    /// Creates a scheduler with no tasks.
    pub fn new(launch: LaunchConfig) -> Self {
        Self {
            tasks: BTreeMap::new(),
            ready: core::array::from_fn(|_| VecDeque::new()),
            current: None,
            idle: None,
            reap: Vec::new(),
            launch,
            next_id: 1,
            stats: SchedStats::default(),
        }
    }

    /// Creates a task and queues it at the tail of its priority level.
    ///
    /// The stack comes from `stacks`; failure to get one is reported as
    /// [`SchedError::OutOfMemory`] and leaves the scheduler unchanged.
    pub fn create(
        &mut self,
        entry: TaskEntry,
        priority: u8,
        stack_size: usize,
        stacks: &mut dyn StackSource,
    ) -> Result<TaskId, SchedError> {
        if priority as usize >= PRIORITY_LEVELS {
            return Err(SchedError::InvalidPriority);
        }
        if stack_size == 0 || stack_size > MAX_STACK_SIZE {
            return Err(SchedError::InvalidStackSize);
        }

        let stack = stacks.alloc_stack(stack_size)?;
        let entry = entry as usize as u64;
        let context = initial_context(entry, stack.top(), &self.launch);
        let prepared = stacks
            .write_u64(stack.base, STACK_CANARY)
            .and_then(|()| stacks.write_u64(context.rsp, self.launch.exit_trampoline));
        if let Err(err) = prepared {
            stacks.free_stack(stack);
            return Err(err.into());
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(
            id,
            Tcb {
                id,
                priority,
                state: TaskState::Ready,
                context,
                stack,
                entry,
            },
        );
        self.ready[priority as usize].push_back(id);
        self.stats.live_tasks += 1;
        log::debug!("task {} created at priority {} ({} byte stack)", id, priority, stack_size);
        Ok(id)
    }

    /// Timer tick: preempt the running task.
    pub fn tick(&mut self, frame: &mut TrapFrame, stacks: &mut dyn StackSource) -> Option<TaskId> {
        self.stats.ticks += 1;
        self.schedule(frame, stacks, Outgoing::Requeue)
    }

    /// Voluntary yield: same queue handling as a tick.
    pub fn yield_now(&mut self, frame: &mut TrapFrame, stacks: &mut dyn StackSource) -> Option<TaskId> {
        self.schedule(frame, stacks, Outgoing::Requeue)
    }

    /// Blocks the running task until [`wake`](Self::wake) is called.
    pub fn block_current(&mut self, frame: &mut TrapFrame, stacks: &mut dyn StackSource) -> Option<TaskId> {
        self.schedule(frame, stacks, Outgoing::Block)
    }

    /// Terminates the running task; called when it returns from its entry.
    pub fn exit_current(&mut self, frame: &mut TrapFrame, stacks: &mut dyn StackSource) -> Option<TaskId> {
        self.schedule(frame, stacks, Outgoing::Exit)
    }

    /// Moves a blocked task to the tail of its ready queue.
    ///
    /// The woken task runs at the next scheduling pass at the earliest.
    pub fn wake(&mut self, id: TaskId) -> Result<(), SchedError> {
        let tcb = self.tasks.get_mut(&id).ok_or(SchedError::NoSuchTask)?;
        if tcb.state != TaskState::Blocked {
            return Err(SchedError::InvalidState);
        }
        tcb.state = TaskState::Ready;
        self.ready[tcb.priority as usize].push_back(id);
        Ok(())
    }

    /// Forcibly terminates a task that is not running and releases its stack.
    pub fn terminate(&mut self, id: TaskId, stacks: &mut dyn StackSource) -> Result<(), SchedError> {
        let tcb = self.tasks.get(&id).ok_or(SchedError::NoSuchTask)?;
        if self.current == Some(id) || tcb.state == TaskState::Terminated {
            return Err(SchedError::InvalidState);
        }
        self.ready[tcb.priority as usize].retain(|queued| *queued != id);
        if let Some(tcb) = self.tasks.remove(&id) {
            stacks.free_stack(tcb.stack);
        }
        self.stats.live_tasks -= 1;
        self.stats.terminated += 1;
        log::debug!("task {} terminated", id);
        Ok(())
    }

    /// The running task, or `None` while idling.
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// State of a task, or `None` once it has been reaped.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(&id).map(|tcb| tcb.state)
    }

    /// The TCB of a task.
    pub fn task(&self, id: TaskId) -> Option<&Tcb> {
        self.tasks.get(&id)
    }

    /// Number of tasks in ready queues.
    pub fn ready_count(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    /// Counters.
    pub fn stats(&self) -> SchedStats {
        self.stats
    }

    fn schedule(
        &mut self,
        frame: &mut TrapFrame,
        stacks: &mut dyn StackSource,
        outgoing: Outgoing,
    ) -> Option<TaskId> {
        self.reap_terminated(stacks);

        let previous = self.current.take();
        match previous {
            Some(id) => self.park(id, frame, &*stacks, outgoing),
            None => self.idle = Some(*frame),
        }

        while let Some(id) = self.ready.iter_mut().find_map(VecDeque::pop_front) {
            if let Some(tcb) = self.tasks.get_mut(&id) {
                tcb.state = TaskState::Running;
                *frame = tcb.context;
                self.current = Some(id);
                break;
            }
        }

        if self.current.is_none() {
            if let Some(idle) = self.idle {
                *frame = idle;
            }
        }
        if self.current != previous {
            self.stats.switches += 1;
        }
        self.current
    }

    /// Saves the outgoing task and files it according to `outgoing`.
    fn park(&mut self, id: TaskId, frame: &TrapFrame, stacks: &dyn StackSource, outgoing: Outgoing) {
        let Some(tcb) = self.tasks.get_mut(&id) else {
            return;
        };
        tcb.context = *frame;

        let outgoing = match stacks.read_u64(tcb.stack.base) {
            Ok(STACK_CANARY) => outgoing,
            _ => {
                log::error!("task {} overran its stack at {:#x}; terminating", id, tcb.stack.base);
                Outgoing::Exit
            }
        };

        match outgoing {
            Outgoing::Requeue => {
                tcb.state = TaskState::Ready;
                self.ready[tcb.priority as usize].push_back(id);
            }
            Outgoing::Block => tcb.state = TaskState::Blocked,
            Outgoing::Exit => {
                tcb.state = TaskState::Terminated;
                self.reap.push(id);
                self.stats.live_tasks -= 1;
                self.stats.terminated += 1;
            }
        }
    }

    fn reap_terminated(&mut self, stacks: &mut dyn StackSource) {
        for id in core::mem::take(&mut self.reap) {
            if let Some(tcb) = self.tasks.remove(&id) {
                stacks.free_stack(tcb.stack);
            }
        }
    }
}

//! Initial register state for new tasks.

use crate::interrupts::TrapFrame;

/// RFLAGS for a new task: interrupts enabled plus the always-set bit 1.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// Platform values every new task context needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Kernel code segment selector.
    pub code_selector: u16,
    /// Kernel data/stack segment selector.
    pub data_selector: u16,
    /// Address a task returns to when its entry function finishes.
    pub exit_trampoline: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            code_selector: 0x08,
            data_selector: 0x10,
            exit_trampoline: 0,
        }
    }
}

/// Builds the frame that starts `entry` on a stack ending at `stack_top`.
///
/// The stack pointer is left the way a `call` would leave it: 16-byte aligned
/// minus the 8-byte return address slot. The caller stores the exit
/// trampoline address in that slot.
pub fn initial_context(entry: u64, stack_top: u64, launch: &LaunchConfig) -> TrapFrame {
    TrapFrame {
        rip: entry,
        cs: u64::from(launch.code_selector),
        rflags: INITIAL_RFLAGS,
        rsp: (stack_top & !0xF) - 8,
        ss: u64::from(launch.data_selector),
        ..TrapFrame::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_frame_looks_like_a_fresh_call() {
        let launch = LaunchConfig::default();
        let frame = initial_context(0xffff_8000_0010_0000, 0x5555_0000_2000, &launch);
        assert_eq!(frame.rip, 0xffff_8000_0010_0000);
        assert_eq!(frame.rsp, 0x5555_0000_1ff8);
        assert_eq!((frame.rsp + 8) % 16, 0);
        assert_eq!(frame.rflags, INITIAL_RFLAGS);
        assert_eq!((frame.cs, frame.ss), (0x08, 0x10));
        assert_eq!(frame.rax, 0);
    }
}

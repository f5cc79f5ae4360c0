//! Saved register state of an interrupted context.

/// Register snapshot built by the trap stubs.
///
/// The layout matches the push order of the assembly entry path: general
/// registers (last pushed first), then the vector and error code the stub
/// pushed, then the frame the CPU pushed. Overwriting a `TrapFrame` in place
/// and returning through `iretq` resumes whatever context it now describes,
/// including a different stack; this is how tasks are switched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
#[allow(missing_docs)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number pushed by the stub.
    pub vector: u64,
    /// CPU error code, or 0 for vectors without one.
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// A frame for `vector` with every register zero.
    pub fn for_vector(vector: u8) -> Self {
        Self {
            vector: u64::from(vector),
            ..Self::default()
        }
    }

    /// Requested privilege level of the interrupted code segment.
    pub fn privilege_level(&self) -> u8 {
        (self.cs & 0b11) as u8
    }
}

/// What a registered handler gets to see and change.
pub struct InterruptContext<'a> {
    /// Vector being handled.
    pub vector: u8,
    /// Error code pushed by the CPU, or 0.
    pub error_code: u64,
    /// Faulting linear address for page faults (CR2), otherwise 0.
    pub fault_addr: u64,
    /// The interrupted context; changes take effect on return.
    pub frame: &'a mut TrapFrame,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_the_stub_push_order() {
        assert_eq!(offset_of!(TrapFrame, r15), 0);
        assert_eq!(offset_of!(TrapFrame, rax), 14 * 8);
        assert_eq!(offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(offset_of!(TrapFrame, error_code), 16 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 21 * 8);
        assert_eq!(size_of::<TrapFrame>(), 22 * 8);
    }
}

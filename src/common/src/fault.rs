//! Page-fault error code decoding.

use bitflags::bitflags;

bitflags! {
    /// Bits of the error code the CPU pushes for a page fault.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FaultCode: u64 {
        const PRESENT      = 1 << 0; // Page was present (protection violation)
        const WRITE        = 1 << 1;
        const USER         = 1 << 2;
        const RESERVED     = 1 << 3; // Reserved bit set in a paging structure
        const INSTRUCTION  = 1 << 4;
        const PROTECTION_KEY = 1 << 5;
        const SHADOW_STACK = 1 << 6;
    }
}

impl FaultCode {
    /// Decodes a raw error code, dropping unknown bits.
    pub const fn decode(raw: u64) -> Self {
        Self::from_bits_truncate(raw)
    }

    /// Returns true if the fault hit a present page, i.e. a protection violation.
    pub const fn is_protection_violation(self) -> bool {
        self.contains(Self::PRESENT)
    }

    /// Returns a short description of the access that faulted.
    pub const fn access(self) -> &'static str {
        if self.contains(Self::INSTRUCTION) {
            "execute"
        } else if self.contains(Self::WRITE) {
            "write"
        } else {
            "read"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_write_to_missing_page() {
        let code = FaultCode::decode(0b010);
        assert!(!code.is_protection_violation());
        assert_eq!(code.access(), "write");
    }

    #[test]
    fn decodes_user_exec_protection_fault() {
        let code = FaultCode::decode(0b10101);
        assert!(code.is_protection_violation());
        assert!(code.contains(FaultCode::USER));
        assert_eq!(code.access(), "execute");
    }

    #[test]
    fn unknown_bits_are_dropped() {
        assert_eq!(FaultCode::decode(1 << 15), FaultCode::empty());
    }
}

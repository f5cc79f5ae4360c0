//! Page-fault classification.
//!
//! Every mapping in this kernel is eager, so a fault normally means a bug and
//! is fatal. The one recoverable case is an opt-in demand-zero window, plus the
//! benign case of a stale TLB entry for a mapping that has since changed.

use super::vmm::AddressSpace;
use kestrel_common::FaultCode;
use x86_64::structures::paging::PageTableFlags;

/// Demand paging policy for not-present faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandPolicy {
    /// Back any page in `[start, end)` with a zeroed frame on first touch.
    ZeroFill {
        /// First address of the window.
        start: u64,
        /// End of the window (exclusive).
        end: u64,
    },
}

impl DemandPolicy {
    /// Returns true if a fault at `addr` may be resolved by this policy.
    pub fn covers(&self, addr: u64) -> bool {
        match *self {
            DemandPolicy::ZeroFill { start, end } => (start..end).contains(&addr),
        }
    }
}

/// Outcome of [`AddressSpace::handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A zeroed frame was mapped; retrying the access succeeds.
    DemandZero,
    /// The mapping already permits the access; the TLB entry was refreshed.
    Stale,
    /// Nothing is mapped and no policy covers the address.
    NotMapped,
    /// The page is present but its flags forbid the access.
    ProtectionViolation,
    /// A paging structure has a reserved bit set.
    ReservedBit,
    /// A demand-zero frame could not be allocated.
    OutOfMemory,
}

impl FaultResolution {
    /// Returns true if execution can resume at the faulting instruction.
    pub fn is_resolved(self) -> bool {
        matches!(self, FaultResolution::DemandZero | FaultResolution::Stale)
    }

    /// Returns true for faults worth reporting as security events.
    pub fn is_security_event(self) -> bool {
        matches!(self, FaultResolution::ProtectionViolation)
    }
}

/// Returns true if a page with `flags` permits the access described by `code`.
fn permits(flags: PageTableFlags, code: FaultCode) -> bool {
    if code.intersects(FaultCode::PROTECTION_KEY | FaultCode::SHADOW_STACK) {
        return false;
    }
    if code.contains(FaultCode::WRITE) && !flags.contains(PageTableFlags::WRITABLE) {
        return false;
    }
    if code.contains(FaultCode::USER) && !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
        return false;
    }
    !(code.contains(FaultCode::INSTRUCTION) && flags.contains(PageTableFlags::NO_EXECUTE))
}

impl AddressSpace {
    /// Classifies a page fault at `addr` and resolves it when policy allows.
    pub fn handle_fault(
        &mut self,
        code: FaultCode,
        addr: u64,
        demand: Option<&DemandPolicy>,
    ) -> FaultResolution {
        if code.contains(FaultCode::RESERVED) {
            return FaultResolution::ReservedBit;
        }

        if let Some(flags) = self.effective_flags(addr) {
            if permits(flags, code) {
                self.invalidate(addr);
                return FaultResolution::Stale;
            }
            return FaultResolution::ProtectionViolation;
        }

        match demand {
            Some(policy) if policy.covers(addr) => {
                let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
                if code.contains(FaultCode::USER) {
                    flags |= PageTableFlags::USER_ACCESSIBLE;
                }
                match self.map_zeroed(addr, flags) {
                    Ok(()) => FaultResolution::DemandZero,
                    Err(err) => {
                        log::warn!("demand-zero fault at {:#x} failed: {}", addr, err);
                        FaultResolution::OutOfMemory
                    }
                }
            }
            _ => FaultResolution::NotMapped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock::{self, MockCpu};

    const RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    #[test]
    fn unmapped_fault_without_policy_is_not_resolved() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let res = space.handle_fault(FaultCode::WRITE, 0xdead_b000, None);
        assert_eq!(res, FaultResolution::NotMapped);
        assert!(!res.is_resolved());
        assert_eq!(space.translate(0xdead_b000), None);
    }

    #[test]
    fn demand_zero_maps_inside_the_window_only() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let policy = DemandPolicy::ZeroFill {
            start: 0x1000_0000,
            end: 0x1010_0000,
        };

        let res = space.handle_fault(FaultCode::WRITE, 0x1000_2345, Some(&policy));
        assert_eq!(res, FaultResolution::DemandZero);
        assert_eq!(space.read_u64(0x1000_2000), Ok(0));

        let res = space.handle_fault(FaultCode::empty(), 0x2000_0000, Some(&policy));
        assert_eq!(res, FaultResolution::NotMapped);
    }

    #[test]
    fn write_to_read_only_page_is_a_protection_violation() {
        let mut space = mock::address_space(MockCpu::leak(false));
        space.map(0x5000, 0x3000, PageTableFlags::PRESENT).unwrap();

        let res = space.handle_fault(FaultCode::PRESENT | FaultCode::WRITE, 0x5010, None);
        assert_eq!(res, FaultResolution::ProtectionViolation);
        assert!(res.is_security_event());

        let res = space.handle_fault(FaultCode::PRESENT | FaultCode::USER, 0x5010, None);
        assert_eq!(res, FaultResolution::ProtectionViolation);
    }

    #[test]
    fn permitted_access_is_a_stale_tlb_entry() {
        let cpu = MockCpu::leak(false);
        let mut space = mock::address_space(cpu);
        space.map(0x6000, 0x3000, RW).unwrap();

        let res = space.handle_fault(FaultCode::WRITE, 0x6008, None);
        assert_eq!(res, FaultResolution::Stale);
        assert!(res.is_resolved());
        assert!(cpu.invalidated().contains(&0x6000));
    }

    #[test]
    fn reserved_bit_faults_are_never_resolved() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let policy = DemandPolicy::ZeroFill { start: 0, end: u64::MAX };
        let res = space.handle_fault(FaultCode::RESERVED | FaultCode::PRESENT, 0x1000, Some(&policy));
        assert_eq!(res, FaultResolution::ReservedBit);
    }
}

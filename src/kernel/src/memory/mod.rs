//! Memory management.
//!
//! - [`frame`]: the physical frame allocator
//! - [`vmm`]: four-level page tables and the kernel [`AddressSpace`]
//! - [`fault`]: page-fault classification and demand-zero paging
//!
//! Page tables are reached through a [`PhysicalMemory`] arena indexed by frame,
//! never through raw pointers kept in the tables themselves.

pub mod fault;
pub mod frame;
pub mod vmm;

pub use fault::{DemandPolicy, FaultResolution};
pub use frame::{BitmapFrameAllocator, FrameState, FrameStats};
pub use vmm::AddressSpace;

use crate::config::PAGE_SIZE;
use x86_64::structures::paging::PhysFrame;

/// Access to physical memory by frame.
///
/// # Safety
///
/// Implementations must return a pointer valid for reads and writes of
/// `PAGE_SIZE` bytes, aligned to `PAGE_SIZE`, for as long as the
/// implementation lives, and distinct frames must never overlap.
pub unsafe trait PhysicalMemory: Send {
    /// Returns a pointer to the first byte of `frame`, or `None` if the frame
    /// cannot be reached.
    fn frame_ptr(&self, frame: PhysFrame) -> Option<*mut u8>;
}

/// Number of pages needed to hold `bytes`, rounded up.
pub const fn pages_for(bytes: usize) -> usize {
    (bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize
}

/// Returns true if `addr` is a multiple of the page size.
pub const fn is_page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_whole_pages() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(256), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
    }
}

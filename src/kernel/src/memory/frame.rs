//! Physical frame allocator.
//!
//! Frames are tracked in two bitmaps indexed by frame number: one marks the
//! frames that lie inside a usable RAM region, the other marks the managed
//! frames that are currently handed out. Everything outside the usable regions
//! is [`FrameState::Unmanaged`] (MMIO windows, firmware tables, the kernel
//! image) and is never allocated or freed here.

use crate::config::PAGE_SIZE;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

/// Ownership state of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Managed and available.
    Free,
    /// Managed and owned by exactly one user.
    Used,
    /// Outside every usable region.
    Unmanaged,
}

/// Frame counters for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Managed frames.
    pub total_frames: usize,
    /// Managed frames that are free.
    pub free_frames: usize,
    /// Managed frames that are allocated.
    pub used_frames: usize,
}

impl FrameStats {
    /// Free memory in bytes.
    pub fn free_bytes(&self) -> u64 {
        self.free_frames as u64 * PAGE_SIZE
    }

    /// Allocated memory in bytes.
    pub fn used_bytes(&self) -> u64 {
        self.used_frames as u64 * PAGE_SIZE
    }
}

/// First-fit bitmap allocator over the usable physical regions.
pub struct BitmapFrameAllocator {
    managed: Vec<u64>,
    used: Vec<u64>,
    frame_count: usize,
    total: usize,
    free: usize,
    hint: usize,
}

impl BitmapFrameAllocator {
    /// Builds an allocator from physical byte ranges of usable RAM.
    ///
    /// Ranges are shrunk inwards to whole frames. Every frame starts free.
    pub fn new<I: IntoIterator<Item = Range<u64>>>(usable: I) -> Self {
        let frames: Vec<Range<usize>> = usable
            .into_iter()
            .filter_map(|r| {
                let start = r.start.div_ceil(PAGE_SIZE) as usize;
                let end = (r.end / PAGE_SIZE) as usize;
                (start < end).then_some(start..end)
            })
            .collect();

        let frame_count = frames.iter().map(|r| r.end).max().unwrap_or(0);
        let words = frame_count.div_ceil(64);
        let mut allocator = Self {
            managed: vec![0; words],
            used: vec![0; words],
            frame_count,
            total: 0,
            free: 0,
            hint: 0,
        };

        for range in frames {
            for idx in range {
                if !allocator.is_managed(idx) {
                    allocator.managed[idx / 64] |= 1 << (idx % 64);
                    allocator.total += 1;
                }
            }
        }
        allocator.free = allocator.total;
        allocator
    }

    fn is_managed(&self, idx: usize) -> bool {
        idx < self.frame_count && self.managed[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn is_used(&self, idx: usize) -> bool {
        self.used[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn index(frame: PhysFrame) -> usize {
        (frame.start_address().as_u64() / PAGE_SIZE) as usize
    }

    fn frame_at(idx: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(idx as u64 * PAGE_SIZE))
    }

    /// Returns the state of `frame`.
    pub fn state(&self, frame: PhysFrame) -> FrameState {
        let idx = Self::index(frame);
        if !self.is_managed(idx) {
            FrameState::Unmanaged
        } else if self.is_used(idx) {
            FrameState::Used
        } else {
            FrameState::Free
        }
    }

    /// Allocates the first free frame at or after the search hint.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        if self.free == 0 {
            return None;
        }
        let words = self.managed.len();
        let start = self.hint / 64;
        for step in 0..words {
            let w = (start + step) % words;
            let available = self.managed[w] & !self.used[w];
            if available != 0 {
                let idx = w * 64 + available.trailing_zeros() as usize;
                self.used[w] |= 1 << (idx % 64);
                self.free -= 1;
                self.hint = idx + 1;
                return Some(Self::frame_at(idx));
            }
        }
        None
    }

    /// Marks a specific managed frame as used.
    ///
    /// Returns `false` if the frame is unmanaged or already used.
    pub fn claim(&mut self, frame: PhysFrame) -> bool {
        let idx = Self::index(frame);
        if !self.is_managed(idx) || self.is_used(idx) {
            return false;
        }
        self.used[idx / 64] |= 1 << (idx % 64);
        self.free -= 1;
        true
    }

    /// Returns a frame to the pool.
    ///
    /// Returns `false` for a double free or an unmanaged frame, leaving the
    /// bitmap untouched.
    pub fn free(&mut self, frame: PhysFrame) -> bool {
        let idx = Self::index(frame);
        if !self.is_managed(idx) || !self.is_used(idx) {
            return false;
        }
        self.used[idx / 64] &= !(1 << (idx % 64));
        self.free += 1;
        if idx < self.hint {
            self.hint = idx;
        }
        true
    }

    /// Returns the current frame counters.
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total,
            free_frames: self.free,
            used_frames: self.total - self.free,
        }
    }
}

// SAFETY: `allocate` only returns managed frames that were free, and marks them
// used before returning, so no frame is handed out twice.
unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free(frame);
    }
}

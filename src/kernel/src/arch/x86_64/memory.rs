//! Bootloader memory map, boot-time frame allocation and physical access.

use crate::config::PAGE_SIZE;
use crate::memory::PhysicalMemory;
use alloc::vec::Vec;
use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use core::ops::Range;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{FrameAllocator, OffsetPageTable, PageTable, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

/// Usable physical ranges from the bootloader's map, frame 0 excluded.
pub fn usable_ranges(memory_map: &'static MemoryMap) -> impl Iterator<Item = Range<u64>> {
    memory_map
        .iter()
        .filter(|region| region.region_type == MemoryRegionType::Usable)
        .map(|region| region.range.start_addr().max(PAGE_SIZE)..region.range.end_addr())
        .filter(|range| range.start < range.end)
}

/// Bump allocator over the usable frames, used until the heap exists.
pub struct BootFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootFrameAllocator {
    /// Creates an allocator over `memory_map`.
    ///
    /// # Safety
    ///
    /// Every frame the map reports usable must really be unused.
    pub unsafe fn init(memory_map: &'static MemoryMap) -> Self {
        Self { memory_map, next: 0 }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        usable_ranges(self.memory_map)
            .flat_map(|range| (range.start..range.end).step_by(PAGE_SIZE as usize))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }

    /// Frames handed out so far, to be marked used in the next allocator.
    pub fn handed_out(&self) -> Vec<PhysFrame> {
        self.usable_frames().take(self.next).collect()
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Physical memory through the bootloader's complete physical mapping.
pub struct OffsetPhysicalMemory {
    offset: u64,
}

impl OffsetPhysicalMemory {
    /// # Safety
    ///
    /// All physical memory must be mapped at `offset`.
    pub unsafe fn new(offset: VirtAddr) -> Self {
        Self {
            offset: offset.as_u64(),
        }
    }
}

// SAFETY: `new` requires the complete physical map at `offset`; distinct
// frames map to distinct, page-aligned virtual pages.
unsafe impl PhysicalMemory for OffsetPhysicalMemory {
    fn frame_ptr(&self, frame: PhysFrame) -> Option<*mut u8> {
        let addr = self.offset.checked_add(frame.start_address().as_u64())?;
        Some(addr as *mut u8)
    }
}

/// Returns an `OffsetPageTable` over the active level 4 table.
///
/// # Safety
///
/// All physical memory must be mapped at `offset`, and this must be called
/// only once to avoid aliasing `&mut` references.
pub unsafe fn init_mapper(offset: VirtAddr) -> OffsetPageTable<'static> {
    let (frame, _) = Cr3::read();
    let table = (offset + frame.start_address().as_u64()).as_mut_ptr::<PageTable>();
    OffsetPageTable::new(&mut *table, offset)
}

/// The active level 4 table frame.
pub fn active_root() -> PhysFrame {
    Cr3::read().0
}

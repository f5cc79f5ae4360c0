//! Virtual memory manager.
//!
//! Four-level long-mode page tables rooted at one PML4 frame. Table frames
//! are reached through the [`PhysicalMemory`] arena, so a table is named by
//! its frame number and every frame has exactly one owner: the allocator,
//! one page-table slot, or (for unmanaged frames) nobody.
//!
//! Leaf entries carry [`OWNED`] when the mapped frame came from the frame
//! allocator. Only owned frames go back to the allocator on unmap; device
//! mappings of unmanaged frames are simply dropped.

use super::frame::{BitmapFrameAllocator, FrameState, FrameStats};
use super::{is_page_aligned, pages_for, PhysicalMemory};
use crate::config::PAGE_SIZE;
use alloc::boxed::Box;
use core::ops::Range;
use kestrel_common::MemError;
use kestrel_hal::Cpu;
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

/// Software-available PTE bit marking a frame owned by this address space.
pub const OWNED: PageTableFlags = PageTableFlags::BIT_9;

const HUGE_1G: u64 = 1 << 30;
const HUGE_2M: u64 = 1 << 21;

/// `VirtAddr::try_new` sign-extends bit 47 instead of failing, which would
/// move a mapping into the other half of the address space. Only addresses
/// that are already canonical are accepted.
fn canonical(virt: u64) -> Result<VirtAddr, MemError> {
    match VirtAddr::try_new(virt) {
        Ok(addr) if addr.as_u64() == virt => Ok(addr),
        _ => Err(MemError::NonCanonical),
    }
}

/// Result of walking the tables down to the entry for one page.
enum Leaf {
    /// Some level on the way is not present.
    Missing,
    /// The level 1 entry. It may or may not be present.
    Entry(*mut PageTableEntry),
    /// A 1 GiB or 2 MiB page covers the address.
    Huge {
        base: PhysAddr,
        size: u64,
        flags: PageTableFlags,
    },
}

/// The kernel address space.
pub struct AddressSpace {
    root: PhysFrame,
    phys: Box<dyn PhysicalMemory>,
    frames: BitmapFrameAllocator,
    cpu: &'static dyn Cpu,
    pool: Range<u64>,
    /// Lowest pool address that may still be free.
    pool_hint: u64,
}

impl AddressSpace {
    /// Wraps an existing table hierarchy rooted at `root`.
    ///
    /// `pool` is the virtual window [`alloc_pages`](Self::alloc_pages) carves
    /// pages from. Frames already used by `root`'s tables must be marked used
    /// (or be unmanaged) in `frames`.
    pub fn new(
        root: PhysFrame,
        phys: Box<dyn PhysicalMemory>,
        frames: BitmapFrameAllocator,
        cpu: &'static dyn Cpu,
        pool: Range<u64>,
    ) -> Self {
        Self {
            root,
            phys,
            frames,
            cpu,
            pool_hint: pool.start,
            pool,
        }
    }

    /// Creates an empty address space with a freshly zeroed root table.
    pub fn create(
        phys: Box<dyn PhysicalMemory>,
        mut frames: BitmapFrameAllocator,
        cpu: &'static dyn Cpu,
        pool: Range<u64>,
    ) -> Result<Self, MemError> {
        let root = frames.allocate().ok_or(MemError::OutOfMemory)?;
        let space = Self::new(root, phys, frames, cpu, pool);
        space.zero_frame(root)?;
        Ok(space)
    }

    /// Frame holding the top-level table.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// The frame allocator backing this address space.
    pub fn frames(&self) -> &BitmapFrameAllocator {
        &self.frames
    }

    /// Frame counters.
    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    fn table(&self, frame: PhysFrame) -> Result<*mut PageTable, MemError> {
        self.phys
            .frame_ptr(frame)
            .map(|ptr| ptr.cast::<PageTable>())
            .ok_or(MemError::OutOfRange)
    }

    fn zero_frame(&self, frame: PhysFrame) -> Result<(), MemError> {
        let ptr = self.phys.frame_ptr(frame).ok_or(MemError::OutOfRange)?;
        // SAFETY: `frame_ptr` returns a pointer valid for PAGE_SIZE bytes.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
        Ok(())
    }

    fn page_addr(virt: u64) -> Result<VirtAddr, MemError> {
        if !is_page_aligned(virt) {
            return Err(MemError::Misaligned);
        }
        canonical(virt)
    }

    fn walk(&self, page: VirtAddr) -> Result<Leaf, MemError> {
        let mut table = self.table(self.root)?;
        for (level, index) in [page.p4_index(), page.p3_index(), page.p2_index()]
            .into_iter()
            .enumerate()
        {
            // SAFETY: `table` points at a page table frame owned by this
            // address space; nothing else holds a reference into it.
            let entry = unsafe { &(&*table)[index] };
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return Ok(Leaf::Missing);
            }
            if level > 0 && flags.contains(PageTableFlags::HUGE_PAGE) {
                let size = if level == 1 { HUGE_1G } else { HUGE_2M };
                return Ok(Leaf::Huge {
                    base: entry.addr(),
                    size,
                    flags,
                });
            }
            table = self.table(PhysFrame::containing_address(entry.addr()))?;
        }
        // SAFETY: as above, for the level 1 table.
        let entry = unsafe { &mut (&mut *table)[page.p1_index()] as *mut PageTableEntry };
        Ok(Leaf::Entry(entry))
    }

    /// Walks to the level 1 entry for `page`, creating missing tables.
    fn walk_create(&mut self, page: VirtAddr, user: bool) -> Result<*mut PageTableEntry, MemError> {
        let mut parent = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            parent |= PageTableFlags::USER_ACCESSIBLE;
        }

        let mut table = self.table(self.root)?;
        for (level, index) in [page.p4_index(), page.p3_index(), page.p2_index()]
            .into_iter()
            .enumerate()
        {
            // SAFETY: `table` points at a page table frame owned by this
            // address space; nothing else holds a reference into it.
            let entry = unsafe { &mut (&mut *table)[index] };
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                let frame = self.frames.allocate().ok_or(MemError::OutOfMemory)?;
                if let Err(err) = self.zero_frame(frame) {
                    self.frames.free(frame);
                    return Err(err);
                }
                entry.set_frame(frame, parent);
            } else if level > 0 && flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(MemError::HugePageConflict);
            } else if !flags.contains(parent) {
                entry.set_flags(flags | parent);
            }
            table = self.table(PhysFrame::containing_address(entry.addr()))?;
        }
        // SAFETY: as above, for the level 1 table.
        Ok(unsafe { &mut (&mut *table)[page.p1_index()] as *mut PageTableEntry })
    }

    /// Returns the frame and flags currently mapped at `page`.
    fn mapping(&self, page: VirtAddr) -> Result<Option<(PhysFrame, PageTableFlags)>, MemError> {
        match self.walk(page)? {
            Leaf::Missing => Ok(None),
            Leaf::Huge { .. } => Err(MemError::HugePageConflict),
            Leaf::Entry(entry) => {
                // SAFETY: `walk` returned a pointer into a live level 1 table.
                let entry = unsafe { &*entry };
                let flags = entry.flags();
                if flags.contains(PageTableFlags::PRESENT) {
                    Ok(Some((PhysFrame::containing_address(entry.addr()), flags)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Writes the leaf entry and retires whatever it replaced.
    fn install(
        &mut self,
        page: VirtAddr,
        frame: PhysFrame,
        flags: PageTableFlags,
        owned: bool,
        previous: Option<(PhysFrame, PageTableFlags)>,
    ) -> Result<(), MemError> {
        let entry = self.walk_create(page, flags.contains(PageTableFlags::USER_ACCESSIBLE))?;
        let mut leaf = (flags | PageTableFlags::PRESENT) - PageTableFlags::HUGE_PAGE - OWNED;
        if owned {
            leaf |= OWNED;
        }
        // SAFETY: `walk_create` returned a pointer into a live level 1 table.
        unsafe { (*entry).set_addr(frame.start_address(), leaf) };

        if let Some((old, old_flags)) = previous {
            self.cpu.invalidate_page(page.as_u64());
            if old != frame && old_flags.contains(OWNED) {
                self.frames.free(old);
            }
        }
        Ok(())
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// Both addresses must be page aligned. An existing mapping is replaced,
    /// its TLB entry invalidated, and its frame released if it was owned.
    /// A free managed frame becomes owned by the mapping; a frame some other
    /// mapping already owns is refused with [`MemError::FrameInUse`]; an
    /// unmanaged frame is mapped as device memory.
    pub fn map(&mut self, virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), MemError> {
        let page = Self::page_addr(virt)?;
        if !is_page_aligned(phys) {
            return Err(MemError::Misaligned);
        }
        let addr = PhysAddr::try_new(phys).map_err(|_| MemError::OutOfRange)?;
        let frame = PhysFrame::containing_address(addr);
        let previous = self.mapping(page)?;

        let owned = match self.frames.state(frame) {
            FrameState::Free => {
                self.frames.claim(frame);
                true
            }
            FrameState::Used => match previous {
                Some((old, old_flags)) if old == frame && old_flags.contains(OWNED) => true,
                _ => return Err(MemError::FrameInUse),
            },
            FrameState::Unmanaged => false,
        };
        let fresh = owned && previous.map(|(old, _)| old) != Some(frame);

        if let Err(err) = self.install(page, frame, flags, owned, previous) {
            if fresh {
                self.frames.free(frame);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the mapping at `virt` and releases its frame if owned.
    ///
    /// Unmapping an address with no mapping is a no-op.
    pub fn unmap(&mut self, virt: u64) -> Result<(), MemError> {
        let page = Self::page_addr(virt)?;
        let entry = match self.walk(page)? {
            Leaf::Missing => return Ok(()),
            Leaf::Huge { .. } => return Err(MemError::HugePageConflict),
            Leaf::Entry(entry) => entry,
        };
        // SAFETY: `walk` returned a pointer into a live level 1 table.
        let entry = unsafe { &mut *entry };
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) {
            return Ok(());
        }
        let frame = PhysFrame::containing_address(entry.addr());
        entry.set_unused();
        self.cpu.invalidate_page(page.as_u64());
        if flags.contains(OWNED) {
            self.frames.free(frame);
        }
        if self.pool.contains(&page.as_u64()) && page.as_u64() < self.pool_hint {
            self.pool_hint = page.as_u64();
        }
        Ok(())
    }

    /// Translates a virtual address, or returns `None` if it is not mapped.
    pub fn translate(&self, virt: u64) -> Option<PhysAddr> {
        let addr = canonical(virt).ok()?;
        match self.walk(addr.align_down(PAGE_SIZE)).ok()? {
            Leaf::Missing => None,
            Leaf::Huge { base, size, .. } => Some(base + (virt & (size - 1))),
            Leaf::Entry(entry) => {
                // SAFETY: `walk` returned a pointer into a live level 1 table.
                let entry = unsafe { &*entry };
                entry
                    .flags()
                    .contains(PageTableFlags::PRESENT)
                    .then(|| entry.addr() + (virt & (PAGE_SIZE - 1)))
            }
        }
    }

    /// Access rights in effect for `virt`, combined over every level.
    pub fn effective_flags(&self, virt: u64) -> Option<PageTableFlags> {
        let addr = canonical(virt).ok()?;
        let rights = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
        let mut allowed = rights;
        let mut no_exec = false;

        let mut table = self.table(self.root).ok()?;
        for (level, index) in [addr.p4_index(), addr.p3_index(), addr.p2_index(), addr.p1_index()]
            .into_iter()
            .enumerate()
        {
            // SAFETY: `table` points at a page table frame owned by this
            // address space.
            let entry = unsafe { &(&*table)[index] };
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return None;
            }
            allowed &= flags & rights;
            no_exec |= flags.contains(PageTableFlags::NO_EXECUTE);
            if level == 3 || (level > 0 && flags.contains(PageTableFlags::HUGE_PAGE)) {
                let mut result = PageTableFlags::PRESENT | allowed;
                if no_exec {
                    result |= PageTableFlags::NO_EXECUTE;
                }
                return Some(result);
            }
            table = self.table(PhysFrame::containing_address(entry.addr())).ok()?;
        }
        None
    }

    /// Finds `count` consecutive unmapped pages inside the page pool,
    /// starting the search at the hint.
    ///
    /// Returns the run and the first unmapped page seen on the way.
    fn find_free_run(&self, count: usize) -> (Result<u64, MemError>, Option<u64>) {
        let mut run_start = self.pool_hint;
        let mut first_free = None;
        let mut run = 0;
        let mut addr = self.pool_hint;
        while addr < self.pool.end {
            if self.translate(addr).is_none() {
                first_free.get_or_insert(addr);
                if run == 0 {
                    run_start = addr;
                }
                run += 1;
                if run == count {
                    return (Ok(run_start), first_free);
                }
            } else {
                run = 0;
            }
            addr += PAGE_SIZE;
        }
        (Err(MemError::OutOfMemory), first_free)
    }

    /// Maps `count` contiguous present, writable pages backed by fresh zeroed
    /// frames and returns the first page.
    ///
    /// On failure nothing stays mapped and every frame taken is returned.
    pub fn alloc_pages(&mut self, count: usize) -> Result<VirtAddr, MemError> {
        if count == 0 {
            return Err(MemError::OutOfRange);
        }
        let (found, first_free) = self.find_free_run(count);
        self.pool_hint = first_free.unwrap_or(self.pool.end);
        let base = found?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        for i in 0..count {
            let page = VirtAddr::new(base + i as u64 * PAGE_SIZE);
            let result = match self.frames.allocate() {
                Some(frame) => self
                    .zero_frame(frame)
                    .and_then(|()| self.install(page, frame, flags, true, None))
                    .map_err(|err| {
                        self.frames.free(frame);
                        err
                    }),
                None => Err(MemError::OutOfMemory),
            };
            if let Err(err) = result {
                log::warn!("alloc_pages({}) failed after {} pages: {}", count, i, err);
                for done in 0..i {
                    self.unmap(base + done as u64 * PAGE_SIZE)?;
                }
                return Err(err);
            }
        }
        if self.pool_hint == base {
            self.pool_hint = base + count as u64 * PAGE_SIZE;
        }
        Ok(VirtAddr::new(base))
    }

    /// Allocates enough pages to hold `bytes`, rounding up.
    pub fn alloc_bytes(&mut self, bytes: usize) -> Result<VirtAddr, MemError> {
        self.alloc_pages(pages_for(bytes))
    }

    /// Unmaps `count` pages starting at `base`, releasing their frames.
    pub fn free_pages(&mut self, base: u64, count: usize) -> Result<(), MemError> {
        Self::page_addr(base)?;
        for i in 0..count as u64 {
            let page = base
                .checked_add(i * PAGE_SIZE)
                .ok_or(MemError::NonCanonical)?;
            self.unmap(page)?;
        }
        Ok(())
    }

    /// Maps a fresh zeroed frame at the page containing `virt`.
    pub(crate) fn map_zeroed(&mut self, virt: u64, flags: PageTableFlags) -> Result<(), MemError> {
        let page = canonical(virt)?.align_down(PAGE_SIZE);
        let frame = self.frames.allocate().ok_or(MemError::OutOfMemory)?;
        let result = self
            .zero_frame(frame)
            .and_then(|()| self.install(page, frame, flags, true, None));
        if result.is_err() {
            self.frames.free(frame);
        }
        result
    }

    pub(crate) fn invalidate(&self, virt: u64) {
        self.cpu.invalidate_page(virt & !(PAGE_SIZE - 1));
    }

    /// Copies bytes out of mapped memory starting at `virt`.
    pub fn read_bytes(&self, virt: u64, buf: &mut [u8]) -> Result<(), MemError> {
        let mut done = 0;
        while done < buf.len() {
            let (ptr, chunk) = self.span(virt, done, buf.len())?;
            // SAFETY: `span` returns a pointer valid for `chunk` bytes.
            unsafe { core::ptr::copy_nonoverlapping(ptr, buf[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes into mapped memory starting at `virt`.
    pub fn write_bytes(&mut self, virt: u64, buf: &[u8]) -> Result<(), MemError> {
        let mut done = 0;
        while done < buf.len() {
            let (ptr, chunk) = self.span(virt, done, buf.len())?;
            // SAFETY: `span` returns a pointer valid for `chunk` bytes.
            unsafe { core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), ptr, chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Resolves the part of `[virt + done, virt + len)` that lies in one page.
    fn span(&self, virt: u64, done: usize, len: usize) -> Result<(*mut u8, usize), MemError> {
        let addr = virt
            .checked_add(done as u64)
            .ok_or(MemError::NonCanonical)?;
        let phys = self.translate(addr).ok_or(MemError::NotMapped)?;
        let offset = (addr % PAGE_SIZE) as usize;
        let chunk = (len - done).min(PAGE_SIZE as usize - offset);
        let base = self
            .phys
            .frame_ptr(PhysFrame::containing_address(phys))
            .ok_or(MemError::OutOfRange)?;
        // SAFETY: `offset` is below PAGE_SIZE, inside the frame.
        Ok((unsafe { base.add(offset) }, chunk))
    }

    /// Reads a little-endian `u64` through a virtual address.
    pub fn read_u64(&self, virt: u64) -> Result<u64, MemError> {
        let mut bytes = [0u8; 8];
        self.read_bytes(virt, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Writes a little-endian `u64` through a virtual address.
    pub fn write_u64(&mut self, virt: u64, value: u64) -> Result<(), MemError> {
        self.write_bytes(virt, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock::{self, MockCpu};
    use alloc::collections::BTreeSet;
    use alloc::vec::Vec;

    const RW: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

    #[test]
    fn map_write_read_then_unmap() {
        let cpu = MockCpu::leak(false);
        let mut space = mock::address_space(cpu);

        space.map(0x1000, 0x2000, RW).unwrap();
        assert_eq!(space.translate(0x1000), Some(PhysAddr::new(0x2000)));
        assert_eq!(space.translate(0x1abc), Some(PhysAddr::new(0x2abc)));

        space.write_u64(0x1008, 0xfeed_face_cafe_beef).unwrap();
        assert_eq!(space.read_u64(0x1008), Ok(0xfeed_face_cafe_beef));

        space.unmap(0x1000).unwrap();
        assert_eq!(space.translate(0x1000), None);
        assert_eq!(space.read_u64(0x1008), Err(MemError::NotMapped));
        assert!(cpu.invalidated().contains(&0x1000));
    }

    #[test]
    fn misaligned_and_non_canonical_addresses_are_rejected() {
        let mut space = mock::address_space(MockCpu::leak(false));
        assert_eq!(space.map(0x1001, 0x2000, RW), Err(MemError::Misaligned));
        assert_eq!(space.map(0x1000, 0x2800, RW), Err(MemError::Misaligned));
        assert_eq!(space.unmap(0x1004), Err(MemError::Misaligned));
        assert_eq!(
            space.map(0x0000_8000_0000_0000, 0x2000, RW),
            Err(MemError::NonCanonical)
        );
        assert_eq!(space.translate(0x1000), None);
    }

    #[test]
    fn upper_half_lookalikes_are_not_sign_extended() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let before = space.frame_stats();
        for virt in [0x0000_8000_0000_0000, 0x0000_ffff_ffff_f000, 0x0001_0000_0000_0000] {
            assert_eq!(space.map(virt, 0x3000, RW), Err(MemError::NonCanonical));
            assert_eq!(space.unmap(virt), Err(MemError::NonCanonical));
            assert_eq!(space.map_zeroed(virt, RW), Err(MemError::NonCanonical));
        }
        assert_eq!(space.translate(0xffff_8000_0000_0000), None);
        assert_eq!(space.translate(0x0000_8000_0000_0000), None);
        assert_eq!(space.effective_flags(0x0000_8000_0000_0000), None);
        assert_eq!(space.frame_stats(), before);

        // The genuine upper-half address still maps.
        space.map(0xffff_8000_0000_0000, 0x3000, RW).unwrap();
        assert_eq!(space.translate(0xffff_8000_0000_0000), Some(PhysAddr::new(0x3000)));
        assert_eq!(space.translate(0x0000_8000_0000_0000), None);
    }

    #[test]
    fn pool_search_skips_the_allocated_prefix_and_reuses_holes() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let a = space.alloc_pages(2).unwrap();
        let b = space.alloc_pages(1).unwrap();
        let c = space.alloc_pages(1).unwrap();
        assert_eq!(b.as_u64(), a.as_u64() + 2 * PAGE_SIZE);
        assert_eq!(c.as_u64(), b.as_u64() + PAGE_SIZE);
        assert_eq!(space.pool_hint, c.as_u64() + PAGE_SIZE);

        // A freed hole below the hint is found again.
        space.free_pages(a.as_u64(), 2).unwrap();
        assert_eq!(space.pool_hint, a.as_u64());
        assert_eq!(space.alloc_pages(1).unwrap(), a);
        assert_eq!(space.pool_hint, a.as_u64() + PAGE_SIZE);

        // A run too long for the hole goes past the live pages.
        let d = space.alloc_pages(3).unwrap();
        assert_eq!(d.as_u64(), c.as_u64() + PAGE_SIZE);
        assert_eq!(space.pool_hint, a.as_u64() + PAGE_SIZE);
        assert_eq!(space.alloc_pages(1).unwrap().as_u64(), a.as_u64() + PAGE_SIZE);
    }

    #[test]
    fn unmap_of_nothing_is_a_no_op() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let before = space.frame_stats();
        assert_eq!(space.unmap(0x7000), Ok(()));
        assert_eq!(space.frame_stats(), before);
    }

    #[test]
    fn remap_releases_the_old_frame_and_flushes() {
        let cpu = MockCpu::leak(false);
        let mut space = mock::address_space(cpu);
        let a = mock::MANAGED_START + 0x40000;
        let b = a + 0x1000;

        space.map(0x4000, a, RW).unwrap();
        assert_eq!(space.frames().state(frame(a)), FrameState::Used);

        space.map(0x4000, b, RW).unwrap();
        assert_eq!(space.translate(0x4000), Some(PhysAddr::new(b)));
        assert_eq!(space.frames().state(frame(a)), FrameState::Free);
        assert_eq!(space.frames().state(frame(b)), FrameState::Used);
        assert_eq!(cpu.invalidated(), [0x4000]);

        // Remapping the same frame only changes flags.
        space.map(0x4000, b, PageTableFlags::PRESENT).unwrap();
        assert_eq!(space.frames().state(frame(b)), FrameState::Used);
        assert!(!space.effective_flags(0x4000).unwrap().contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn a_frame_is_never_mapped_twice() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let a = mock::MANAGED_START + 0x40000;
        space.map(0x4000, a, RW).unwrap();
        assert_eq!(space.map(0x5000, a, RW), Err(MemError::FrameInUse));
        assert_eq!(space.translate(0x5000), None);
    }

    #[test]
    fn unmanaged_frames_are_not_released() {
        let mut space = mock::address_space(MockCpu::leak(false));
        space.map(0x1000, 0x3000, RW).unwrap();
        let before = space.frame_stats();
        space.unmap(0x1000).unwrap();
        assert_eq!(space.frame_stats(), before);
        assert_eq!(space.frames().state(frame(0x3000)), FrameState::Unmanaged);
    }

    #[test]
    fn allocated_pages_never_share_frames() {
        let mut space = mock::address_space(MockCpu::leak(false));
        let mut live: Vec<(VirtAddr, usize)> = Vec::new();

        for count in [1, 3, 2, 5, 1, 4] {
            live.push((space.alloc_pages(count).unwrap(), count));
        }
        let (base, count) = live.remove(1);
        space.free_pages(base.as_u64(), count).unwrap();
        let (base, count) = live.remove(2);
        space.free_pages(base.as_u64(), count).unwrap();
        live.push((space.alloc_pages(6).unwrap(), 6));

        let mut seen = BTreeSet::new();
        for (base, count) in &live {
            for i in 0..*count as u64 {
                let phys = space.translate(base.as_u64() + i * PAGE_SIZE).unwrap();
                assert!(seen.insert(phys), "frame {:?} mapped twice", phys);
                assert_eq!(space.frames().state(frame(phys.as_u64())), FrameState::Used);
            }
        }
    }

    #[test]
    fn alloc_then_free_returns_every_frame() {
        let mut space = mock::address_space(MockCpu::leak(false));
        // The first allocation also builds the pool's page tables.
        let warm = space.alloc_pages(1).unwrap();
        space.free_pages(warm.as_u64(), 1).unwrap();
        let baseline = space.frame_stats();

        let base = space.alloc_bytes(3 * 4096 + 1).unwrap();
        assert_eq!(space.frame_stats().used_frames, baseline.used_frames + 4);
        assert_eq!(space.read_u64(base.as_u64() + 3 * 4096), Ok(0));
        space.free_pages(base.as_u64(), 4).unwrap();
        assert_eq!(space.frame_stats(), baseline);
    }

    #[test]
    fn alloc_pages_rolls_back_on_exhaustion() {
        let mut space = mock::address_space_with(MockCpu::leak(false), 8);
        let warm = space.alloc_pages(1).unwrap();
        space.free_pages(warm.as_u64(), 1).unwrap();
        let baseline = space.frame_stats();

        assert_eq!(space.alloc_pages(64), Err(MemError::OutOfMemory));
        assert_eq!(space.frame_stats(), baseline);
        assert_eq!(space.translate(warm.as_u64()), None);
        assert_eq!(space.alloc_pages(0), Err(MemError::OutOfRange));
    }

    #[test]
    fn huge_pages_translate_and_refuse_small_mappings() {
        let mut space = mock::address_space(MockCpu::leak(false));
        space.map(0x40_0000, 0x3000, RW).unwrap();
        space.unmap(0x40_0000).unwrap();

        // Turn the level 2 entry covering 0x40_0000 into a 2 MiB page.
        let page = VirtAddr::new(0x40_0000);
        let p4 = space.table(space.root()).unwrap();
        unsafe {
            let p3 = space
                .table(PhysFrame::containing_address((&(*p4))[page.p4_index()].addr()))
                .unwrap();
            let p2 = space
                .table(PhysFrame::containing_address((&(*p3))[page.p3_index()].addr()))
                .unwrap();
            (&mut (*p2))[page.p2_index()].set_addr(
                PhysAddr::new(0x20_0000),
                RW | PageTableFlags::HUGE_PAGE,
            );
        }

        assert_eq!(space.translate(0x41_2345), Some(PhysAddr::new(0x21_2345)));
        assert_eq!(space.map(0x40_1000, 0x3000, RW), Err(MemError::HugePageConflict));
        assert_eq!(space.unmap(0x40_1000), Err(MemError::HugePageConflict));
    }

    fn frame(addr: u64) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(addr))
    }
}

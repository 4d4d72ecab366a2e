//! # Physical Page Allocator
//!
//! Built once from the boot memory map. Every region of kind
//! [`MemoryKind::Free`] is threaded onto a [`FreeList`]; all other kinds are
//! only counted. Pages are handed out one at a time under a spin lock.

use crate::free_list::FreeList;
use alloc::sync::Arc;
use core::fmt;
use kernel_info::boot::{MemoryKind, MemoryRegion};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use kernel_vmem::{DirectMap, FrameAlloc};
use log::{debug, info};
use spin::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;

/// Pages per memory kind, for diagnostics.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct KindPages {
    pub free: u64,
    pub reserved: u64,
    pub reclaimable: u64,
    pub module: u64,
    pub framebuffer: u64,
}

impl KindPages {
    const fn slot(&mut self, kind: MemoryKind) -> &mut u64 {
        match kind {
            MemoryKind::Free => &mut self.free,
            MemoryKind::Reserved => &mut self.reserved,
            MemoryKind::Reclaimable => &mut self.reclaimable,
            MemoryKind::Module => &mut self.module,
            MemoryKind::Framebuffer => &mut self.framebuffer,
        }
    }
}

struct Inner {
    list: FreeList,
    usable_pages: u64,
}

pub struct PhysicalPageAllocator {
    mapper: DirectMap,
    inner: Mutex<Inner>,
    total_pages: u64,
    highest_usable: u64,
    highest_mappable: u64,
    by_kind: KindPages,
}

impl PhysicalPageAllocator {
    /// Build the allocator from the platform memory map.
    ///
    /// Free regions are trimmed inward to page boundaries; anything smaller
    /// than a page is ignored.
    ///
    /// # Safety
    /// Every [`MemoryKind::Free`] region must be unused RAM reachable through
    /// `mapper`, and no two regions may overlap.
    pub unsafe fn new(mapper: DirectMap, regions: &[MemoryRegion]) -> Self {
        let mut list = FreeList::new(mapper);
        let mut usable_pages = 0;
        let mut total_pages = 0;
        let mut highest_usable = 0;
        let mut highest_mappable = 0;
        let mut by_kind = KindPages::default();

        for region in regions {
            info!(
                "memmap: [{:#018x}-{:#018x}] {}",
                region.base,
                region.end(),
                region.kind
            );

            let pages = region.size / PAGE_SIZE;
            total_pages += pages;
            *by_kind.slot(region.kind) += pages;

            if region.kind.is_mappable() {
                highest_mappable = highest_mappable.max(region.end());
            }
            if region.kind != MemoryKind::Free {
                continue;
            }

            let base = align_up(region.base, PAGE_SIZE);
            let end = align_down(region.end(), PAGE_SIZE);
            if end <= base {
                continue;
            }

            unsafe { list.add_region(base, end - base) };
            usable_pages += (end - base) / PAGE_SIZE;
            highest_usable = highest_usable.max(end);
        }

        info!(
            "phys: {} MiB of usable physical memory",
            (usable_pages * PAGE_SIZE) >> 20
        );

        Self {
            mapper,
            inner: Mutex::new(Inner { list, usable_pages }),
            total_pages,
            highest_usable,
            highest_mappable,
            by_kind,
        }
    }

    /// Allocate one page, zero-filled if `zero` is set.
    ///
    /// # Errors
    /// [`OutOfMemory`] when the freelist is empty.
    pub fn alloc(&self, zero: bool) -> Result<PhysicalAddress, OutOfMemory> {
        let page = {
            let mut inner = self.inner.lock();
            let page = inner.list.pop_page().ok_or(OutOfMemory)?;
            inner.usable_pages -= 1;
            page
        };

        if zero {
            unsafe { self.mapper.fill_page(page, 0) };
        }
        Ok(page)
    }

    /// Return a page to the freelist.
    ///
    /// The page must have come from [`alloc`](Self::alloc) and must no longer
    /// be referenced by anyone.
    pub fn free(&self, page: PhysicalAddress) {
        debug_assert!(page.is_page_aligned(), "freeing unaligned page {page}");
        let mut inner = self.inner.lock();
        debug_assert!(!inner.list.contains(page), "double free of {page}");
        unsafe { inner.list.push_page(page) };
        inner.usable_pages += 1;
    }

    /// Allocate one page owned by the returned [`Frame`].
    ///
    /// # Errors
    /// [`OutOfMemory`] when the freelist is empty.
    pub fn alloc_frame(self: &Arc<Self>, zero: bool) -> Result<Frame, OutOfMemory> {
        let address = self.alloc(zero)?;
        Ok(Frame {
            address,
            allocator: Arc::clone(self),
        })
    }

    /// Pages currently on the freelist.
    #[must_use]
    pub fn usable_pages(&self) -> u64 {
        self.inner.lock().usable_pages
    }

    /// Pages described by the memory map, of any kind.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// End of the highest free region.
    #[must_use]
    pub const fn highest_usable_address(&self) -> u64 {
        self.highest_usable
    }

    /// End of the highest region the direct map has to cover.
    #[must_use]
    pub const fn highest_mappable_address(&self) -> u64 {
        self.highest_mappable
    }

    #[must_use]
    pub const fn pages_by_kind(&self) -> KindPages {
        self.by_kind
    }

    #[must_use]
    pub const fn mapper(&self) -> DirectMap {
        self.mapper
    }

    /// Whether `page` is currently on the freelist.
    #[must_use]
    pub fn is_free(&self, page: PhysicalAddress) -> bool {
        self.inner.lock().list.contains(page.align_down(PAGE_SIZE))
    }

    /// Log the freelist, head first.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        for (base, size) in inner.list.regions() {
            debug!("phys: free {:#x}..{:#x}", base, base + size);
        }
        debug!("phys: {} usable pages", inner.usable_pages);
    }
}

impl fmt::Debug for PhysicalPageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPageAllocator")
            .field("usable_pages", &self.usable_pages())
            .field("total_pages", &self.total_pages)
            .finish_non_exhaustive()
    }
}

impl FrameAlloc for PhysicalPageAllocator {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.alloc(true).ok()
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        self.free(pa);
    }
}

/// One physical page, returned to its allocator on drop.
pub struct Frame {
    address: PhysicalAddress,
    allocator: Arc<PhysicalPageAllocator>,
}

impl Frame {
    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.address
    }

    /// Copy the contents of `other` into this page.
    pub fn copy_from(&mut self, other: &Self) {
        // Both frames are owned exclusively; `&mut self` rules out aliasing.
        unsafe {
            self.allocator
                .mapper
                .copy_page(other.address, self.address);
        }
    }

    /// The page contents through the direct map.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        let ptr = self
            .allocator
            .mapper
            .phys_to_virt(self.address)
            .as_mut_ptr::<u8>()
            .cast_const();
        unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE as usize) }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Frame").field(&self.address).finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.allocator.free(self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    const RAM_BASE: u64 = 0x0100_0000;

    #[repr(C, align(4096))]
    #[derive(Clone)]
    struct Aligned4K([u8; 4096]);

    fn ram(pages: usize) -> Vec<Aligned4K> {
        vec![Aligned4K([0xAB; 4096]); pages]
    }

    fn allocator(ram: &[Aligned4K], regions: &[MemoryRegion]) -> Arc<PhysicalPageAllocator> {
        let mapper = DirectMap::new((ram.as_ptr() as u64).wrapping_sub(RAM_BASE));
        Arc::new(unsafe { PhysicalPageAllocator::new(mapper, regions) })
    }

    #[test]
    fn only_free_regions_are_usable() {
        let ram = ram(16);
        let regions = [
            MemoryRegion::new(RAM_BASE, 8 * PAGE_SIZE, MemoryKind::Free),
            MemoryRegion::new(RAM_BASE + 8 * PAGE_SIZE, 4 * PAGE_SIZE, MemoryKind::Reserved),
            MemoryRegion::new(RAM_BASE + 12 * PAGE_SIZE, 2 * PAGE_SIZE, MemoryKind::Module),
            MemoryRegion::new(RAM_BASE + 14 * PAGE_SIZE, 2 * PAGE_SIZE, MemoryKind::Reclaimable),
        ];
        let phys = allocator(&ram, &regions);

        assert_eq!(phys.usable_pages(), 8);
        assert_eq!(phys.total_pages(), 16);
        assert_eq!(phys.highest_usable_address(), RAM_BASE + 8 * PAGE_SIZE);
        assert_eq!(phys.highest_mappable_address(), RAM_BASE + 16 * PAGE_SIZE);
        assert_eq!(phys.pages_by_kind().reserved, 4);
        assert_eq!(phys.pages_by_kind().module, 2);

        for _ in 0..8 {
            let page = phys.alloc(false).expect("page");
            assert!(page.as_u64() < RAM_BASE + 8 * PAGE_SIZE);
        }
        assert_eq!(phys.alloc(false), Err(OutOfMemory));
    }

    #[test]
    fn unaligned_regions_are_trimmed() {
        let ram = ram(4);
        let regions = [MemoryRegion::new(RAM_BASE + 0x10, 3 * PAGE_SIZE, MemoryKind::Free)];
        let phys = allocator(&ram, &regions);
        assert_eq!(phys.usable_pages(), 2);
    }

    #[test]
    fn pages_are_conserved() {
        let ram = ram(32);
        let regions = [
            MemoryRegion::new(RAM_BASE, 20 * PAGE_SIZE, MemoryKind::Free),
            MemoryRegion::new(RAM_BASE + 24 * PAGE_SIZE, 8 * PAGE_SIZE, MemoryKind::Free),
        ];
        let phys = allocator(&ram, &regions);
        let before = phys.usable_pages();
        assert_eq!(before, 28);

        let mut held = Vec::new();
        for round in 0..5u64 {
            for _ in 0..(3 + round) {
                let page = phys.alloc(false).expect("page");
                assert!(!phys.is_free(page), "{page} handed out while still free");
                assert!(!held.contains(&page), "{page} handed out twice");
                held.push(page);
            }
            for _ in 0..round {
                phys.free(held.remove(0));
            }
            assert_eq!(phys.usable_pages(), before - held.len() as u64);
        }

        for page in held.drain(..) {
            phys.free(page);
        }
        assert_eq!(phys.usable_pages(), before);
    }

    #[test]
    fn zeroed_pages_are_zero() {
        let ram = ram(2);
        let regions = [MemoryRegion::new(RAM_BASE, 2 * PAGE_SIZE, MemoryKind::Free)];
        let phys = allocator(&ram, &regions);

        let frame = phys.alloc_frame(true).expect("frame");
        assert!(frame.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn frames_free_on_drop_and_copy() {
        let ram = ram(4);
        let regions = [MemoryRegion::new(RAM_BASE, 4 * PAGE_SIZE, MemoryKind::Free)];
        let phys = allocator(&ram, &regions);

        let src = phys.alloc_frame(false).expect("frame");
        let mut dst = phys.alloc_frame(true).expect("frame");
        assert_eq!(phys.usable_pages(), 2);

        dst.copy_from(&src);
        assert!(dst.bytes().iter().all(|&b| b == 0xAB));

        let address = src.address();
        drop(src);
        assert!(phys.is_free(address));
        drop(dst);
        assert_eq!(phys.usable_pages(), 4);
    }
}

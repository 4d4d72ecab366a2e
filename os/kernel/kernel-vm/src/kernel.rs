//! # Kernel Memory
//!
//! [`Vm`] is the virtual memory context of the whole kernel. It is built
//! once at boot, in this order:
//!
//! 1. the physical page allocator, from the boot memory map;
//! 2. the kernel pagemap (image sections and the direct map);
//! 3. the kernel virtual address arena over the heap window;
//! 4. the kernel heap arena and the device mapping arena, both importing
//!    from (3);
//! 5. the kernel address space.
//!
//! Kernel pages are backed eagerly: [`Vm::kernel_alloc`] reserves a range,
//! allocates a zeroed page for every slot of it and maps them read-write.
//! Mappings of caller-owned physical ranges come from a separate arena, so a
//! range can only ever be released the way it was created.

use crate::space::AddressSpace;
use crate::{Pagemap, VmError};
use alloc::sync::Arc;
use kernel_alloc::{
    AllocFlags, Arena, ArenaStats, LockedArena, PhysicalPageAllocator, SpanSource,
};
use kernel_info::boot::{KernelImage, MemoryRegion};
use kernel_info::memory::{
    HHDM_BASE, KERNEL_HEAP_SIZE, USER_ARENA_BASE, USER_ARENA_SIZE, kernel_heap_base,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{DirectMap, KernelLayout, LeafSize, MapFlags, Prot};
use log::{debug, info, warn};

/// Byte pattern freed kernel pages are filled with.
const POISON: u8 = 0xcc;

/// Boot-time knobs of the virtual memory subsystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmConfig {
    /// Leaf size for the direct map window.
    pub direct_map_leaf: LeafSize,
    /// Window user address spaces allocate mappings from.
    pub user_arena_base: u64,
    pub user_arena_size: u64,
    /// Size of the kernel heap window after the direct map.
    pub kernel_heap_size: u64,
    /// Load the kernel pagemap once it is built.
    pub activate: bool,
}

impl VmConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direct_map_leaf: LeafSize::Large,
            user_arena_base: USER_ARENA_BASE,
            user_arena_size: USER_ARENA_SIZE,
            kernel_heap_size: KERNEL_HEAP_SIZE,
            activate: true,
        }
    }

    /// Defaults, with the direct map leaf chosen by probing the CPU.
    #[must_use]
    pub fn detect() -> Self {
        Self::new().with_direct_map_leaf(LeafSize::for_direct_map())
    }

    #[must_use]
    pub const fn with_direct_map_leaf(mut self, leaf: LeafSize) -> Self {
        self.direct_map_leaf = leaf;
        self
    }

    #[must_use]
    pub const fn with_activate(mut self, activate: bool) -> Self {
        self.activate = activate;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Vm {
    kernel_space: AddressSpace,
    heap: LockedArena,
    /// Ranges from `kernel_alloc_at_phys`; their pages belong to the caller.
    mmio: LockedArena,
    kernel_va: Arc<LockedArena>,
    kernel_pagemap: Arc<Pagemap>,
    phys: Arc<PhysicalPageAllocator>,
    config: VmConfig,
}

impl Vm {
    /// Bring up the virtual memory subsystem.
    ///
    /// # Safety
    /// Every free region in `regions` must be unused RAM reachable through
    /// `mapper`, as for [`PhysicalPageAllocator::new`].
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the kernel tables do not fit.
    pub unsafe fn new(
        config: VmConfig,
        mapper: DirectMap,
        regions: &[MemoryRegion],
        image: &KernelImage,
    ) -> Result<Self, VmError> {
        let phys = Arc::new(unsafe { PhysicalPageAllocator::new(mapper, regions) });
        let mappable = phys.highest_mappable_address();

        let layout = KernelLayout {
            image,
            direct_map_base: HHDM_BASE,
            direct_map_end: mappable,
            direct_map_leaf: config.direct_map_leaf,
        };
        let kernel_pagemap = Arc::new(Pagemap::new_kernel(Arc::clone(&phys), mapper, &layout)?);

        let heap_base = kernel_heap_base(mappable);
        let kernel_va = Arc::new(LockedArena::new(Arena::new(
            "kernel-va",
            heap_base,
            config.kernel_heap_size,
            PAGE_SIZE,
            None,
        )?));
        let heap = LockedArena::new(Arena::new(
            "kernel-heap",
            0,
            0,
            PAGE_SIZE,
            Some(Arc::clone(&kernel_va) as Arc<dyn SpanSource>),
        )?);
        let mmio = LockedArena::new(Arena::new(
            "kernel-mmio",
            0,
            0,
            PAGE_SIZE,
            Some(Arc::clone(&kernel_va) as Arc<dyn SpanSource>),
        )?);
        let kernel_space = AddressSpace::kernel("kernel", &kernel_pagemap, &phys, &kernel_va)?;

        if config.activate {
            kernel_pagemap.activate();
        }

        info!(
            "vm: kernel heap window {heap_base:#x}..{:#x}, {} pages free",
            heap_base + config.kernel_heap_size,
            phys.usable_pages()
        );

        Ok(Self {
            kernel_space,
            heap,
            mmio,
            kernel_va,
            kernel_pagemap,
            phys,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    #[must_use]
    pub const fn phys(&self) -> &Arc<PhysicalPageAllocator> {
        &self.phys
    }

    #[must_use]
    pub const fn kernel_pagemap(&self) -> &Arc<Pagemap> {
        &self.kernel_pagemap
    }

    #[must_use]
    pub const fn kernel_va(&self) -> &Arc<LockedArena> {
        &self.kernel_va
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    #[must_use]
    pub fn heap_stats(&self) -> ArenaStats {
        self.heap.stats()
    }

    /// Allocate `npages` zeroed, mapped kernel pages.
    ///
    /// With `bootstrap` set the heap arena will not grow its own bookkeeping,
    /// which is what the kernel heap needs while refilling itself.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the address range or the pages run out;
    /// anything set up so far is undone.
    pub fn kernel_alloc(&self, npages: usize, bootstrap: bool) -> Result<VirtualAddress, VmError> {
        if npages == 0 {
            return Err(VmError::InvalidParameters("zero-page allocation"));
        }

        let size = range_size(npages)?;
        let flags = if bootstrap {
            AllocFlags::INSTANT_FIT.bootstrap()
        } else {
            AllocFlags::INSTANT_FIT
        };
        let base = VirtualAddress::new(self.heap.alloc(size, flags)?);

        for i in 0..npages {
            let va = base + i as u64 * PAGE_SIZE;
            if let Err(e) = self.back_page(va) {
                warn!("vm: kernel_alloc of {npages} pages failed at page {i}: {e}");
                self.unmap_range(base, i, true);
                if let Err(e) = self.heap.free(base.as_u64(), size) {
                    warn!("vm: failed to return {base}: {e}");
                }
                return Err(e);
            }
        }

        debug!("vm: kernel_alloc {npages} pages at {base}");
        Ok(base)
    }

    /// Free pages obtained from [`kernel_alloc`](Self::kernel_alloc).
    ///
    /// The pages are poisoned before they go back to the allocator.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if `ptr` was not handed out by `kernel_alloc`;
    ///   physical mappings go through [`kernel_unmap_phys`](Self::kernel_unmap_phys).
    /// - [`VmError::InvalidParameters`] if `npages` does not match.
    pub fn kernel_free(&self, ptr: VirtualAddress, npages: usize) -> Result<(), VmError> {
        self.release_range(&self.heap, ptr, npages, true)
    }

    /// Map `npages` existing physical pages starting at `phys` into the
    /// kernel heap window, e.g. for device memory. The pages stay with the
    /// caller.
    ///
    /// # Errors
    /// - [`VmError::InvalidParameters`] if `phys` is not page aligned.
    /// - [`VmError::OutOfMemory`] if the address range or tables run out.
    pub fn kernel_alloc_at_phys(
        &self,
        npages: usize,
        phys: PhysicalAddress,
    ) -> Result<VirtualAddress, VmError> {
        if npages == 0 || !phys.is_page_aligned() {
            return Err(VmError::InvalidParameters(
                "physical range must be page aligned and non-empty",
            ));
        }

        let size = range_size(npages)?;
        let base = VirtualAddress::new(self.mmio.alloc(size, AllocFlags::INSTANT_FIT)?);

        for i in 0..npages {
            let offset = i as u64 * PAGE_SIZE;
            let mapped = self.kernel_pagemap.map(
                base + offset,
                phys + offset,
                Prot::READ | Prot::WRITE,
                MapFlags::NONE,
            );
            if let Err(e) = mapped {
                self.unmap_range(base, i, false);
                if let Err(e) = self.mmio.free(base.as_u64(), size) {
                    warn!("vm: failed to return {base}: {e}");
                }
                return Err(e.into());
            }
        }

        debug!("vm: mapped {phys}+{size:#x} at {base}");
        Ok(base)
    }

    /// Undo [`kernel_alloc_at_phys`](Self::kernel_alloc_at_phys). The
    /// physical pages are left alone.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if `ptr` was not handed out by
    ///   `kernel_alloc_at_phys`.
    /// - [`VmError::InvalidParameters`] if `npages` does not match.
    pub fn kernel_unmap_phys(&self, ptr: VirtualAddress, npages: usize) -> Result<(), VmError> {
        self.release_range(&self.mmio, ptr, npages, false)
    }

    fn back_page(&self, va: VirtualAddress) -> Result<(), VmError> {
        let page = self.phys.alloc(true)?;
        if let Err(e) = self
            .kernel_pagemap
            .map(va, page, Prot::READ | Prot::WRITE, MapFlags::NONE)
        {
            self.phys.free(page);
            return Err(e.into());
        }
        Ok(())
    }

    fn release_range(
        &self,
        arena: &LockedArena,
        ptr: VirtualAddress,
        npages: usize,
        free_pages: bool,
    ) -> Result<(), VmError> {
        let size = range_size(npages)?;
        let mut arena = arena.lock();
        match arena.allocation_size(ptr.as_u64()) {
            None => return Err(VmError::NotFound),
            Some(actual) if actual != size => {
                return Err(VmError::InvalidParameters("size does not match allocation"));
            }
            Some(_) => {}
        }

        self.unmap_range(ptr, npages, free_pages);
        arena.free(ptr.as_u64(), size)?;
        Ok(())
    }

    /// Unmap `npages` pages at `base`, poisoning and freeing their frames if
    /// `free_pages` is set.
    fn unmap_range(&self, base: VirtualAddress, npages: usize, free_pages: bool) {
        for i in 0..npages {
            let va = base + i as u64 * PAGE_SIZE;
            match self.kernel_pagemap.unmap(va) {
                Ok(mapping) if free_pages => {
                    // SAFETY: the page was allocated for this range and its
                    // only translation is gone.
                    unsafe { self.phys.mapper().fill_page(mapping.base, POISON) };
                    self.phys.free(mapping.base);
                }
                Ok(_) => {}
                Err(e) => warn!("vm: {va} was not mapped: {e}"),
            }
        }
    }
}

fn range_size(npages: usize) -> Result<u64, VmError> {
    (npages as u64)
        .checked_mul(PAGE_SIZE)
        .ok_or(VmError::InvalidParameters("page count overflows the address space"))
}

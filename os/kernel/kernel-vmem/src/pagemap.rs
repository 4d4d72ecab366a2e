//! # Pagemap (x86-64, PML4-rooted)
//!
//! One translation tree plus the lock that serializes changes to it.
//!
//! ## Highlights
//!
//! - [`Pagemap::map`] walks to the level implied by the leaf size, creating
//!   missing tables on the way, and installs the leaf.
//! - [`Pagemap::unmap`] finds the leaf at whatever level it lives, clears it
//!   and frees tables that became empty.
//! - [`Pagemap::remap`] rewrites the protection of an existing leaf in place.
//! - [`Pagemap::get_mapping`] translates without allocating.
//! - Dropping a pagemap frees every table page it owns. Leaf pages are never
//!   freed here: they belong to whoever installed them.
//!
//! ## Safety
//!
//! Table pages are reached through the [`DirectMap`]. Every access happens
//! with the pagemap lock held, and no reference to a table outlives the call
//! that produced it.

use crate::{
    DirectMap, ENTRIES, FrameAlloc, LeafSize, MapFlags, Mapping, PageEntryBits, PageTable,
    PagemapError, Prot, arch,
};
use alloc::sync::Arc;
use core::ops::Range;
use kernel_info::boot::KernelImage;
use kernel_info::memory::{DIRECT_MAP_MIN, KERNEL_PML4_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};
use log::{debug, info, warn};
use spin::Mutex;

/// Whether a pagemap owns the kernel half or only borrows it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PagemapKind {
    /// Owns all 512 PML4 slots; the upper 256 are shared with every user tree.
    Kernel,
    /// Owns the lower 256 PML4 slots; the upper half is copied from the kernel.
    User,
}

/// What the kernel tree maps at construction.
#[derive(Debug, Clone)]
pub struct KernelLayout<'a> {
    pub image: &'a KernelImage,
    /// Virtual address of physical address zero.
    pub direct_map_base: u64,
    /// End of the highest physical region the direct map must cover.
    pub direct_map_end: u64,
    /// Leaf size used for the whole direct map window.
    pub direct_map_leaf: LeafSize,
}

/// A PML4-rooted translation tree.
pub struct Pagemap<A: FrameAlloc> {
    root: PhysicalAddress,
    kind: PagemapKind,
    mapper: DirectMap,
    frames: Arc<A>,
    /// User trees keep the kernel tree, and with it the shared PDPTs, alive.
    kernel: Option<Arc<Self>>,
    lock: Mutex<()>,
}

impl<A: FrameAlloc> Pagemap<A> {
    pub(crate) fn empty(
        frames: Arc<A>,
        mapper: DirectMap,
        kind: PagemapKind,
        kernel: Option<Arc<Self>>,
    ) -> Result<Self, PagemapError> {
        let root = frames.alloc_4k().ok_or(PagemapError::OutOfMemory)?;
        Ok(Self {
            root,
            kind,
            mapper,
            frames,
            kernel,
            lock: Mutex::new(()),
        })
    }

    /// Build the kernel tree.
    ///
    /// Preallocates the 256 upper-half PDPTs, maps the kernel image sections
    /// (text `R-X`, rodata `R--`, data `RW-`) and the direct map window
    /// `[0, max(4 GiB, direct_map_end))` with `layout.direct_map_leaf`.
    ///
    /// # Errors
    /// [`PagemapError::OutOfMemory`] when table pages run out. Everything
    /// allocated so far is released again.
    pub fn new_kernel(
        frames: Arc<A>,
        mapper: DirectMap,
        layout: &KernelLayout<'_>,
    ) -> Result<Self, PagemapError> {
        let pagemap = Self::empty(frames, mapper, PagemapKind::Kernel, None)?;

        let root = unsafe { pagemap.table(pagemap.root) };
        for index in KERNEL_PML4_START..ENTRIES {
            let pdpt = pagemap
                .frames
                .alloc_4k()
                .ok_or(PagemapError::OutOfMemory)?;
            root.set(index, PageEntryBits::table(pdpt));
        }

        pagemap.map_image(layout.image)?;
        pagemap.map_direct(layout)?;
        Ok(pagemap)
    }

    /// Build a user tree sharing the kernel half of `kernel`.
    ///
    /// # Errors
    /// [`PagemapError::OutOfMemory`] if the root cannot be allocated.
    pub fn new_user(kernel: &Arc<Self>) -> Result<Self, PagemapError> {
        let user = Self::empty(
            Arc::clone(&kernel.frames),
            kernel.mapper,
            PagemapKind::User,
            Some(Arc::clone(kernel)),
        )?;
        kernel.copy(&user)?;
        Ok(user)
    }

    fn map_image(&self, image: &KernelImage) -> Result<(), PagemapError> {
        let sections: [(&str, &Range<u64>, Prot); 3] = [
            ("text", &image.text, Prot::READ | Prot::EXECUTE),
            ("rodata", &image.rodata, Prot::READ),
            ("data", &image.data, Prot::READ | Prot::WRITE),
        ];

        for (name, range, prot) in sections {
            let start = align_down(range.start, PAGE_SIZE);
            let end = align_up(range.end, PAGE_SIZE);
            debug!("pagemap: kernel {name} {start:#x}..{end:#x} as {prot:?}");

            let mut va = start;
            while va < end {
                self.map(
                    VirtualAddress::new(va),
                    PhysicalAddress::new(image.physical_of(va)),
                    prot,
                    MapFlags::NONE,
                )?;
                va += PAGE_SIZE;
            }
        }
        Ok(())
    }

    fn map_direct(&self, layout: &KernelLayout<'_>) -> Result<(), PagemapError> {
        let leaf = layout.direct_map_leaf;
        let end = align_up(layout.direct_map_end.max(DIRECT_MAP_MIN), leaf.bytes());
        let flags = MapFlags::NONE.sized(leaf);

        let mut pa = 0;
        while pa < end {
            self.map(
                VirtualAddress::new(layout.direct_map_base + pa),
                PhysicalAddress::new(pa),
                Prot::READ | Prot::WRITE,
                flags,
            )?;
            pa += leaf.bytes();
        }

        info!(
            "pagemap: direct map of {} MiB at {:#x} using {:?} leaves",
            end >> 20,
            layout.direct_map_base,
            leaf
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> PagemapKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> DirectMap {
        self.mapper
    }

    /// The kernel tree a user tree shares its upper half with.
    #[inline]
    #[must_use]
    pub const fn kernel(&self) -> Option<&Arc<Self>> {
        self.kernel.as_ref()
    }

    /// # Safety
    /// `pa` must be a table page of this tree and the caller must not create
    /// a second live reference to the same page.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut(pa) }
    }

    fn check_owned(&self, va: VirtualAddress) -> Result<(), PagemapError> {
        if self.kind == PagemapKind::User && va.is_higher_half() {
            return Err(PagemapError::InvalidParameters(
                "kernel half is managed by the kernel pagemap",
            ));
        }
        Ok(())
    }

    const fn missing(level: u8) -> PagemapError {
        if level == 1 {
            PagemapError::NotFound
        } else {
            PagemapError::NotADirectory
        }
    }

    /// Table referenced by `table[index]`, creating it if `allocate` is set.
    fn next_table(
        &self,
        table: PhysicalAddress,
        index: usize,
        level: u8,
        allocate: bool,
    ) -> Result<PhysicalAddress, PagemapError> {
        let entries = unsafe { self.table(table) };
        let entry = entries.get(index);
        if entry.present() {
            if entry.is_leaf_at(level) {
                return Err(PagemapError::InvalidParameters(
                    "range is covered by a larger leaf",
                ));
            }
            return Ok(entry.physical_address());
        }

        if !allocate {
            return Err(PagemapError::NotADirectory);
        }

        let next = self.frames.alloc_4k().ok_or(PagemapError::OutOfMemory)?;
        entries.set(index, PageEntryBits::table(next));
        Ok(next)
    }

    /// Install a translation `va → pa`.
    ///
    /// The leaf size comes from `flags`; both addresses must be aligned to it.
    /// A table previously hanging where a large or huge leaf goes is freed.
    /// Replacing an existing leaf invalidates its TLB entry; replacing it
    /// with a different page is reported as a warning; use
    /// [`replace`](Self::replace) where that is intended.
    ///
    /// # Errors
    /// - [`PagemapError::OutOfMemory`] if a missing level cannot be allocated.
    /// - [`PagemapError::InvalidParameters`] on misalignment, on a normal leaf
    ///   below an existing larger leaf, or on a kernel address in a user tree.
    pub fn map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<(), PagemapError> {
        self.install(va, pa, prot, flags, false)
    }

    /// [`map`](Self::map) for callers that swap the page behind a present
    /// translation on purpose, such as copy-on-write.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn replace(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<(), PagemapError> {
        self.install(va, pa, prot, flags, true)
    }

    fn install(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Prot,
        flags: MapFlags,
        replacing: bool,
    ) -> Result<(), PagemapError> {
        let size = flags.leaf_size();
        if !va.is_aligned(size.bytes()) || !pa.is_aligned(size.bytes()) {
            return Err(PagemapError::InvalidParameters(
                "address not aligned to leaf size",
            ));
        }
        self.check_owned(va)?;

        let _guard = self.lock.lock();
        let leaf_level = size.level();

        let mut table = self.root;
        for level in ((leaf_level + 1)..=4).rev() {
            table = self.next_table(table, va.table_index(level), level, true)?;
        }

        let index = va.table_index(leaf_level);
        let entries = unsafe { self.table(table) };
        let old = entries.get(index);
        entries.set(index, PageEntryBits::leaf(pa, prot, flags, size));

        if old.present() {
            if old.is_leaf_at(leaf_level) {
                let was = old.physical_address();
                if was == pa || replacing {
                    debug!("pagemap: {va} now maps {pa} as {prot:?} (was {was})");
                } else {
                    warn!("pagemap: {va} now maps {pa} (was {was})");
                }
                arch::invalidate_page(va);
            } else {
                self.free_tables(old.physical_address(), leaf_level - 1);
                self.flush_all();
            }
        }
        Ok(())
    }

    /// Remove the translation covering `va`, whatever its leaf size.
    ///
    /// Tables left empty are freed, except the shared upper-half PDPTs.
    ///
    /// # Errors
    /// [`PagemapError::NotADirectory`] if an intermediate level is missing,
    /// [`PagemapError::NotFound`] if the final entry is not present.
    pub fn unmap(&self, va: VirtualAddress) -> Result<Mapping, PagemapError> {
        self.check_owned(va)?;
        let _guard = self.lock.lock();

        let mut path = [(PhysicalAddress::zero(), 0usize); 4];
        let mut depth = 0;
        let mut table = self.root;
        let mut level = 4u8;

        let mapping = loop {
            let index = va.table_index(level);
            path[depth] = (table, index);
            depth += 1;

            let entries = unsafe { self.table(table) };
            let entry = entries.get(index);
            if !entry.present() {
                return Err(Self::missing(level));
            }
            if entry.is_leaf_at(level) {
                entries.clear(index);
                break Self::mapping_of(entry, level);
            }

            table = entry.physical_address();
            level -= 1;
        };

        arch::invalidate_page(va);
        self.prune(&path[..depth]);
        Ok(mapping)
    }

    /// Change the protection of the translation covering `va`, keeping its
    /// physical page and leaf size.
    ///
    /// # Errors
    /// As [`get_mapping`](Self::get_mapping).
    pub fn remap(&self, va: VirtualAddress, prot: Prot, flags: MapFlags) -> Result<(), PagemapError> {
        self.check_owned(va)?;
        let _guard = self.lock.lock();

        let (table, index, level, entry) = self.find_leaf(va)?;
        let size = LeafSize::from_level(level);
        let entries = unsafe { self.table(table) };
        entries.set(
            index,
            PageEntryBits::leaf(entry.physical_address(), prot, flags.sized(size), size),
        );
        arch::invalidate_page(va);
        Ok(())
    }

    /// Translate `va` without allocating anything.
    ///
    /// # Errors
    /// [`PagemapError::NotADirectory`] if an intermediate level is missing,
    /// [`PagemapError::NotFound`] if the final entry is not present.
    pub fn get_mapping(&self, va: VirtualAddress) -> Result<Mapping, PagemapError> {
        let _guard = self.lock.lock();
        let (_, _, level, entry) = self.find_leaf(va)?;
        Ok(Self::mapping_of(entry, level))
    }

    /// Make this tree the live translation.
    pub fn activate(&self) {
        // SAFETY: every tree carries the kernel half, so the code, stack and
        // data of the caller stay mapped across the switch.
        unsafe { arch::load_root(self.root) }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        arch::active_root() == self.root
    }

    /// Share this tree's kernel half with `dest`.
    ///
    /// Only the upper-half references are copied. Duplicating per-task
    /// translations is not supported; address spaces fork by copying their
    /// objects instead.
    ///
    /// # Errors
    /// - [`PagemapError::NotImplemented`] if this tree has lower-half tables.
    /// - [`PagemapError::InvalidParameters`] when copying onto itself or into
    ///   a kernel tree.
    pub fn copy(&self, dest: &Self) -> Result<(), PagemapError> {
        if core::ptr::eq(self, dest) || self.root == dest.root {
            return Err(PagemapError::InvalidParameters("copy onto itself"));
        }
        if dest.kind == PagemapKind::Kernel {
            return Err(PagemapError::InvalidParameters(
                "cannot copy into a kernel pagemap",
            ));
        }

        let _src_guard = self.lock.lock();
        let _dst_guard = dest.lock.lock();

        let src = unsafe { self.table(self.root) };
        if src.present().any(|(index, _)| index < KERNEL_PML4_START) {
            return Err(PagemapError::NotImplemented);
        }

        let dst = unsafe { dest.table(dest.root) };
        for index in KERNEL_PML4_START..ENTRIES {
            dst.set(index, src.get(index));
        }
        Ok(())
    }

    /// Tear the tree down; see the [`Drop`] impl.
    pub fn destroy(self) {
        drop(self);
    }

    /// Log every level of the walk for `va`.
    pub fn dump_walk(&self, va: VirtualAddress) {
        let _guard = self.lock.lock();
        let mut table = self.root;
        for level in (1..=4u8).rev() {
            let index = va.table_index(level);
            let entry = unsafe { self.table(table) }.get(index);
            debug!(
                "L{level}[{index:3}]={:016x} P={} RW={} US={} PS={} NX={}",
                entry.into_bits(),
                entry.present(),
                entry.writable(),
                entry.user_access(),
                entry.large_page(),
                entry.no_execute()
            );
            if !entry.present() || entry.is_leaf_at(level) {
                return;
            }
            table = entry.physical_address();
        }
    }

    fn find_leaf(
        &self,
        va: VirtualAddress,
    ) -> Result<(PhysicalAddress, usize, u8, PageEntryBits), PagemapError> {
        let mut table = self.root;
        for level in (1..=4u8).rev() {
            let index = va.table_index(level);
            let entry = unsafe { self.table(table) }.get(index);
            if !entry.present() {
                return Err(Self::missing(level));
            }
            if entry.is_leaf_at(level) {
                return Ok((table, index, level, entry));
            }
            table = entry.physical_address();
        }
        Err(PagemapError::NotFound)
    }

    const fn mapping_of(entry: PageEntryBits, level: u8) -> Mapping {
        Mapping {
            base: entry.physical_address(),
            prot: entry.prot(),
            size: LeafSize::from_level(level),
            user: entry.user_access(),
        }
    }

    /// Free empty tables bottom-up along a walk.
    fn prune(&self, path: &[(PhysicalAddress, usize)]) {
        for i in (1..path.len()).rev() {
            let (table, _) = path[i];
            if !unsafe { self.table(table) }.is_empty() {
                return;
            }

            let (parent, index) = path[i - 1];
            if parent == self.root && index >= KERNEL_PML4_START {
                return;
            }
            unsafe { self.table(parent) }.clear(index);
            self.frames.free_4k(table);
        }
    }

    /// Free the table at `table` (holding `level` entries) and every table
    /// below it. Leaves are left alone.
    fn free_tables(&self, table: PhysicalAddress, level: u8) {
        if level > 1 {
            let entries = unsafe { self.table(table) };
            for (_, entry) in entries.present() {
                if !entry.is_leaf_at(level) {
                    self.free_tables(entry.physical_address(), level - 1);
                }
            }
        }
        self.frames.free_4k(table);
    }

    fn flush_all(&self) {
        if self.is_active() {
            self.activate();
        }
    }
}

impl<A: FrameAlloc> Drop for Pagemap<A> {
    /// Free every table page this tree owns, then the root.
    ///
    /// A kernel tree owns all slots; a user tree only the lower half.
    fn drop(&mut self) {
        let owned = match self.kind {
            PagemapKind::Kernel => 0..ENTRIES,
            PagemapKind::User => 0..KERNEL_PML4_START,
        };

        let root = unsafe { self.table(self.root) };
        for (index, entry) in root.present() {
            if owned.contains(&index) {
                self.free_tables(entry.physical_address(), 3);
            }
        }
        self.frames.free_4k(self.root);
        debug!("pagemap: released {:?} tree at {}", self.kind, self.root);
    }
}

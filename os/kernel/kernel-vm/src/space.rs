//! # Address Spaces
//!
//! An [`AddressSpace`] is a pagemap, an arena of free virtual ranges and the
//! list of mappings (entries) that tie virtual ranges to memory objects.
//! A single spin lock serializes map, unmap, fault and copy on one space.
//!
//! User spaces get a private pagemap that shares the kernel half, and hand
//! out addresses from a fixed window of the lower half. A kernel-mode space
//! installs into the kernel pagemap and imports its ranges from the kernel
//! virtual address arena.

use crate::fault::FaultFlags;
use crate::kernel::{Vm, VmConfig};
use crate::object::MemoryObject;
use crate::{Pagemap, VmError};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::{
    AllocFlags, Arena, ArenaError, LockedArena, PhysicalPageAllocator, SpanSource,
};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use kernel_vmem::info::USERSPACE_END;
use kernel_vmem::{MapFlags, PagemapError, Prot};
use log::{debug, warn};
use spin::Mutex;

struct Entry {
    start: VirtualAddress,
    size: u64,
    object: Arc<MemoryObject>,
    prot: Prot,
    claim: Claim,
}

/// Which arena holds an entry's virtual range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Claim {
    /// None: a fixed user mapping outside the arena window.
    Unclaimed,
    /// The space's own arena.
    Local,
    /// The kernel virtual address arena, for fixed kernel-mode mappings.
    KernelVa,
}

impl Entry {
    const fn end(&self) -> u64 {
        self.start.as_u64() + self.size
    }

    const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end()
    }

    const fn overlaps(&self, start: VirtualAddress, size: u64) -> bool {
        start.as_u64() < self.end() && self.start.as_u64() < start.as_u64().saturating_add(size)
    }

    fn page_address(&self, page: usize) -> Option<VirtualAddress> {
        let va = self.start + page as u64 * PAGE_SIZE;
        self.contains(va).then_some(va)
    }

    /// Give the virtual range back to whichever arena it was claimed from.
    fn release_claim(
        &self,
        arena: &mut Arena,
        kernel_va: Option<&LockedArena>,
    ) -> Result<(), ArenaError> {
        let (base, size) = (self.start.as_u64(), self.size);
        match (self.claim, kernel_va) {
            (Claim::Local, _) => arena.free(base, size),
            (Claim::KernelVa, Some(kernel_va)) => kernel_va.free(base, size),
            (Claim::KernelVa, None) | (Claim::Unclaimed, _) => Ok(()),
        }
    }
}

struct Inner {
    arena: Arena,
    entries: Vec<Entry>,
}

pub struct AddressSpace {
    inner: Mutex<Inner>,
    pagemap: Arc<Pagemap>,
    phys: Arc<PhysicalPageAllocator>,
    /// Set for kernel-mode spaces, which share the kernel pagemap.
    kernel_va: Option<Arc<LockedArena>>,
    name: String,
    is_user: bool,
}

impl AddressSpace {
    /// A new, empty address space.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the pagemap root cannot be allocated.
    pub fn new(vm: &Vm, name: &str, is_user: bool) -> Result<Self, VmError> {
        if is_user {
            Self::user(name, vm.kernel_pagemap(), vm.phys(), vm.config())
        } else {
            Self::kernel(name, vm.kernel_pagemap(), vm.phys(), vm.kernel_va())
        }
    }

    fn user(
        name: &str,
        kernel: &Arc<Pagemap>,
        phys: &Arc<PhysicalPageAllocator>,
        config: &VmConfig,
    ) -> Result<Self, VmError> {
        let pagemap = Arc::new(Pagemap::new_user(kernel)?);
        let arena = Arena::new(
            "user",
            config.user_arena_base,
            config.user_arena_size,
            PAGE_SIZE,
            None,
        )?;
        Ok(Self::with_parts(name, pagemap, arena, phys, None))
    }

    pub(crate) fn kernel(
        name: &str,
        pagemap: &Arc<Pagemap>,
        phys: &Arc<PhysicalPageAllocator>,
        source: &Arc<LockedArena>,
    ) -> Result<Self, VmError> {
        let arena = Arena::new(
            "kernel",
            0,
            0,
            PAGE_SIZE,
            Some(Arc::clone(source) as Arc<dyn SpanSource>),
        )?;
        Ok(Self::with_parts(
            name,
            Arc::clone(pagemap),
            arena,
            phys,
            Some(Arc::clone(source)),
        ))
    }

    fn with_parts(
        name: &str,
        pagemap: Arc<Pagemap>,
        arena: Arena,
        phys: &Arc<PhysicalPageAllocator>,
        kernel_va: Option<Arc<LockedArena>>,
    ) -> Self {
        debug!("space {name}: created, root {}", pagemap.root());
        Self {
            inner: Mutex::new(Inner {
                arena,
                entries: Vec::new(),
            }),
            pagemap,
            phys: Arc::clone(phys),
            is_user: kernel_va.is_none(),
            kernel_va,
            name: String::from(name),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.is_user
    }

    #[must_use]
    pub const fn pagemap(&self) -> &Arc<Pagemap> {
        &self.pagemap
    }

    /// Map `object` at `hint`, or wherever the arena finds room.
    ///
    /// A hint is aligned down to a page and `size` grows by the same amount.
    /// The space takes over the passed reference to `object`.
    ///
    /// # Errors
    /// - [`VmError::InvalidParameters`] for a zero size, a fixed range that
    ///   overlaps another mapping or leaves this space's half, or a fixed
    ///   kernel range the kernel address arena has already handed out.
    /// - [`VmError::OutOfMemory`] if the arena has no room.
    pub fn map(
        &self,
        object: Arc<MemoryObject>,
        hint: Option<VirtualAddress>,
        size: u64,
        prot: Prot,
    ) -> Result<VirtualAddress, VmError> {
        if size == 0 {
            return Err(VmError::InvalidParameters("zero-sized mapping"));
        }

        let mut inner = self.inner.lock();
        let (start, size, claim) = match hint {
            Some(hint) => {
                let start = hint.align_down(PAGE_SIZE);
                let size = align_up(size.saturating_add(hint.page_offset()), PAGE_SIZE);
                self.check_range(start, size)?;
                if inner.entries.iter().any(|e| e.overlaps(start, size)) {
                    return Err(VmError::InvalidParameters(
                        "range overlaps an existing mapping",
                    ));
                }

                let claim = match inner.arena.alloc_at(start.as_u64(), size, false) {
                    Ok(_) => Claim::Local,
                    Err(ArenaError::NotFound) => self.claim_kernel_range(start, size)?,
                    Err(e) => return Err(e.into()),
                };
                (start, size, claim)
            }
            None => {
                let size = align_up(size, PAGE_SIZE);
                let start = inner.arena.alloc(size, AllocFlags::INSTANT_FIT)?;
                (VirtualAddress::new(start), size, Claim::Local)
            }
        };

        debug!(
            "space {}: map {start}+{size:#x} as {prot:?}",
            self.name
        );
        inner.entries.push(Entry {
            start,
            size,
            object,
            prot,
            claim,
        });
        Ok(start)
    }

    /// Map a fresh anonymous object.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn new_anon(
        &self,
        hint: Option<VirtualAddress>,
        size: u64,
        prot: Prot,
    ) -> Result<VirtualAddress, VmError> {
        let span = size.saturating_add(hint.map_or(0, VirtualAddress::page_offset));
        let object = MemoryObject::new(span, Arc::clone(&self.phys));
        self.map(object, hint, size, prot)
    }

    /// Remove the mapping that covers exactly `[address, address + size)`.
    ///
    /// # Errors
    /// - [`VmError::NotFound`] if no mapping intersects the range.
    /// - [`VmError::NotImplemented`] if the range is only part of a mapping.
    pub fn unmap(&self, address: VirtualAddress, size: u64) -> Result<(), VmError> {
        let start = address.align_down(PAGE_SIZE);
        let size = align_up(size.saturating_add(address.page_offset()), PAGE_SIZE);

        let mut inner = self.inner.lock();
        let Some(index) = inner
            .entries
            .iter()
            .position(|e| e.start == start && e.size == size)
        else {
            return Err(if inner.entries.iter().any(|e| e.overlaps(start, size)) {
                VmError::NotImplemented
            } else {
                VmError::NotFound
            });
        };

        let entry = inner.entries.remove(index);
        self.unmap_pages(&entry);
        entry.release_claim(&mut inner.arena, self.kernel_va.as_deref())?;
        drop(inner);

        debug!("space {}: unmapped {start}+{size:#x}", self.name);
        entry.object.release();
        Ok(())
    }

    /// Resolve a page fault at `address`.
    ///
    /// Returns `false` if no mapping covers the address, the access is not
    /// allowed by the mapping, or the object could not supply a page.
    pub fn fault(&self, address: VirtualAddress, flags: FaultFlags) -> bool {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.iter().find(|e| e.contains(address)) else {
            debug!("space {}: no mapping at {address}", self.name);
            return false;
        };

        let needed = if flags.write() {
            Prot::WRITE
        } else if flags.execute() {
            Prot::EXECUTE
        } else {
            Prot::READ
        };
        if !entry.prot.allows(needed) {
            debug!(
                "space {}: {needed:?} access at {address} denied by {:?}",
                self.name, entry.prot
            );
            return false;
        }
        if flags.user() && !self.is_user {
            return false;
        }

        #[allow(clippy::cast_possible_truncation)]
        let page = ((address - entry.start) / PAGE_SIZE) as usize;
        entry
            .object
            .fault(&self.pagemap, entry.start, page, flags, entry.prot)
    }

    /// Fork this space into `dest`.
    ///
    /// Every mapping is duplicated with a copy of its object. Pages that are
    /// already resident are installed in `dest` right away; shared ones are
    /// installed read-only on both sides so the first write privatizes them.
    /// On failure `dest` is left as it was and the source keeps its
    /// translations.
    ///
    /// # Errors
    /// - [`VmError::InvalidParameters`] when copying onto itself, between
    ///   kernel-mode spaces, or onto a range `dest` already uses.
    /// - [`VmError::OutOfMemory`] if pages or tables run out.
    pub fn copy(&self, dest: &Self) -> Result<(), VmError> {
        if core::ptr::eq(self, dest) {
            return Err(VmError::InvalidParameters("copy onto itself"));
        }
        if !self.is_user || !dest.is_user {
            return Err(VmError::InvalidParameters(
                "only user address spaces can be copied",
            ));
        }

        let src = self.inner.lock();
        let mut dst = dest.inner.lock();

        if src
            .entries
            .iter()
            .any(|entry| dst.entries.iter().any(|e| e.overlaps(entry.start, entry.size)))
        {
            return Err(VmError::InvalidParameters(
                "destination range already mapped",
            ));
        }

        let mut staged = Vec::with_capacity(src.entries.len());
        if let Err(e) = dest.install_copies(&src.entries, &mut dst.arena, &mut staged) {
            warn!(
                "space {}: copy into {} failed, rolling back {} mappings: {e}",
                self.name,
                dest.name,
                staged.len()
            );
            for entry in &staged {
                dest.unmap_pages(entry);
                if let Err(e) = entry.release_claim(&mut dst.arena, None) {
                    warn!("space {}: lost range {}: {e}", dest.name, entry.start);
                }
            }
            return Err(e);
        }

        if cfg!(feature = "cow") {
            for entry in &staged {
                self.protect_shared(entry);
            }
        }

        debug!(
            "space {}: copied {} mappings into {}",
            self.name,
            staged.len(),
            dest.name
        );
        dst.entries.append(&mut staged);
        Ok(())
    }

    /// Build a copy of every `source` entry and install its resident pages
    /// into this space. Each entry lands in `staged` as soon as its range is
    /// claimed, so the caller can undo a partial copy.
    fn install_copies(
        &self,
        source: &[Entry],
        arena: &mut Arena,
        staged: &mut Vec<Entry>,
    ) -> Result<(), VmError> {
        for entry in source {
            let object = entry.object.copy()?;
            if entry.claim == Claim::Local {
                arena.alloc_at(entry.start.as_u64(), entry.size, false)?;
            }
            staged.push(Entry {
                start: entry.start,
                size: entry.size,
                object: Arc::clone(&object),
                prot: entry.prot,
                claim: entry.claim,
            });

            for (page, anon) in object.resident() {
                let Some(va) = entry.page_address(page) else {
                    continue;
                };

                let lock = anon.lock();
                let prot = if lock.is_shared() {
                    entry.prot.without_write()
                } else {
                    entry.prot
                };
                self.pagemap
                    .map(va, anon.physical_page(), prot, MapFlags::USER)?;
                drop(lock);
            }
        }
        Ok(())
    }

    /// Drop write access to every page `copy` shares with this space.
    fn protect_shared(&self, copy: &Entry) {
        let prot = copy.prot.without_write();
        for (page, anon) in copy.object.resident() {
            let Some(va) = copy.page_address(page) else {
                continue;
            };

            let lock = anon.lock();
            if !lock.is_shared() {
                continue;
            }
            match self.pagemap.remap(va, prot, MapFlags::USER) {
                Ok(()) | Err(PagemapError::NotFound | PagemapError::NotADirectory) => {}
                Err(e) => warn!("space {}: failed to protect {va}: {e}", self.name),
            }
            drop(lock);
        }
    }

    /// Tear the space down: release every object and free the pagemap.
    pub fn release(self) {
        drop(self);
    }

    pub fn activate(&self) {
        self.pagemap.activate();
    }

    /// `(start, size, prot)` of every mapping.
    #[must_use]
    pub fn entries(&self) -> Vec<(VirtualAddress, u64, Prot)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| (e.start, e.size, e.prot))
            .collect()
    }

    /// The object mapped at `va`.
    #[must_use]
    pub fn object_at(&self, va: VirtualAddress) -> Option<Arc<MemoryObject>> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.contains(va))
            .map(|e| Arc::clone(&e.object))
    }

    /// Copy `data` into the space at `va`, faulting pages in as a write
    /// from this space's owner would.
    ///
    /// # Errors
    /// [`VmError::AccessViolation`] at the first page that cannot be written.
    pub fn write_bytes(&self, va: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let chunk = chunk_len(at, data.len() - done);
            let src = &data[done..done + chunk];
            self.with_page(at, true, |dst| unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), dst, chunk);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes out of the space at `va`, faulting pages in as a read
    /// from this space's owner would.
    ///
    /// # Errors
    /// [`VmError::AccessViolation`] at the first page that cannot be read.
    pub fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done as u64;
            let chunk = chunk_len(at, buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            self.with_page(at, false, |src| unsafe {
                core::ptr::copy_nonoverlapping(src.cast_const(), dst.as_mut_ptr(), chunk);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Run `f` on the direct-map pointer for `va`, faulting once if the
    /// current translation does not allow the access.
    fn with_page(
        &self,
        va: VirtualAddress,
        write: bool,
        f: impl FnOnce(*mut u8),
    ) -> Result<(), VmError> {
        let mut faulted = false;
        loop {
            let present = {
                let inner = self.inner.lock();
                if !inner.entries.iter().any(|e| e.contains(va)) {
                    return Err(VmError::AccessViolation(va));
                }

                match self.pagemap.get_mapping(va) {
                    Ok(mapping) if !write || mapping.prot.write() => {
                        let pa = mapping.translate(va);
                        // The entry lock keeps the page from being replaced
                        // or released while `f` runs.
                        f(self.pagemap.mapper().phys_to_virt(pa).as_mut_ptr());
                        return Ok(());
                    }
                    Ok(_) => true,
                    Err(_) => false,
                }
            };

            let flags = FaultFlags::new()
                .with_present(present)
                .with_write(write)
                .with_user(self.is_user);
            if faulted || !self.fault(va, flags) {
                return Err(VmError::AccessViolation(va));
            }
            faulted = true;
        }
    }

    fn check_range(&self, start: VirtualAddress, size: u64) -> Result<(), VmError> {
        let end = start
            .as_u64()
            .checked_add(size)
            .ok_or(VmError::InvalidParameters("range overflows"))?;
        if self.is_user && end > USERSPACE_END {
            return Err(VmError::InvalidParameters(
                "user mapping reaches into the kernel half",
            ));
        }
        if !self.is_user && !start.is_higher_half() {
            return Err(VmError::InvalidParameters(
                "kernel mapping in the lower half",
            ));
        }
        Ok(())
    }

    /// Claim a fixed range outside this space's arena.
    ///
    /// User spaces own their half and take it as is. Kernel-mode spaces share
    /// the kernel pagemap, so the range has to be free in the kernel address
    /// arena or it may already back the heap or another space.
    fn claim_kernel_range(&self, start: VirtualAddress, size: u64) -> Result<Claim, VmError> {
        let Some(kernel_va) = &self.kernel_va else {
            return Ok(Claim::Unclaimed);
        };
        match kernel_va.alloc_at(start.as_u64(), size, false) {
            Ok(_) => Ok(Claim::KernelVa),
            Err(e) => {
                debug!("space {}: kernel range {start}+{size:#x} refused: {e}", self.name);
                Err(VmError::InvalidParameters(
                    "fixed range is not free kernel address space",
                ))
            }
        }
    }

    /// Remove every translation this entry may have installed.
    fn unmap_pages(&self, entry: &Entry) {
        for (page, _) in entry.object.resident() {
            let Some(va) = entry.page_address(page) else {
                continue;
            };
            match self.pagemap.unmap(va) {
                Ok(_) | Err(PagemapError::NotFound | PagemapError::NotADirectory) => {}
                Err(e) => warn!("space {}: failed to unmap {va}: {e}", self.name),
            }
        }
    }
}

const fn chunk_len(at: VirtualAddress, remaining: usize) -> usize {
    let room = (PAGE_SIZE - at.page_offset()) as usize;
    if room < remaining { room } else { remaining }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("name", &self.name)
            .field("user", &self.is_user)
            .field("root", &self.pagemap.root())
            .field("mappings", &self.inner.lock().entries.len())
            .finish()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let entries = core::mem::take(&mut self.inner.get_mut().entries);
        for entry in &entries {
            // The kernel pagemap outlives this space; user pagemaps go away
            // as a whole below.
            if !self.is_user {
                self.unmap_pages(entry);
            }
            if let Err(e) =
                entry.release_claim(&mut self.inner.get_mut().arena, self.kernel_va.as_deref())
            {
                warn!("space {}: lost range {}: {e}", self.name, entry.start);
            }
        }
        debug!(
            "space {}: released {} mappings",
            self.name,
            entries.len()
        );
    }
}

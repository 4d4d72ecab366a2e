//! # Page Table Management
//!
//! x86-64 four-level paging for the kernel's virtual memory subsystem.
//!
//! ## What you get
//! - [`Pagemap`]: one translation tree (PML4 root) with `map`, `unmap`,
//!   `remap`, `get_mapping`, `activate`, `copy` and teardown on drop.
//! - [`PageEntryBits`] and [`PageTable`]: the raw entry and table layouts.
//! - [`Prot`], [`MapFlags`], [`LeafSize`], [`Mapping`]: the architecture
//!   neutral vocabulary callers speak.
//! - [`DirectMap`]: access to physical memory through a fixed offset.
//! - [`FrameAlloc`]: where table pages come from.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        └───► PTE                 → 4 KiB leaf
//!   │        │        └────────────► PDE   with PS=1     → 2 MiB leaf
//!   │        └─────────────────────► PDPTE with PS=1     → 1 GiB leaf
//!   └──────────────────────────────► PML4E (always a table pointer)
//! ```
//!
//! Intermediate levels are created on demand by `map` and pruned again by
//! `unmap` once they hold nothing. A large or huge leaf never coexists with a
//! deeper table for the same range.
//!
//! ## Kernel and user trees
//!
//! The kernel tree owns all 256 upper-half PDPTs from the start. A user tree
//! copies those 256 PML4 entries, so kernel mappings added later show up in
//! every address space without touching the user trees.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod arch;
mod page_entry_bits;
mod page_table;
mod pagemap;
mod prot;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{ENTRIES, PageTable};
pub use crate::pagemap::{KernelLayout, Pagemap, PagemapKind};
pub use crate::prot::{LeafSize, MapFlags, Mapping, Prot};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of physical pages for page table levels.
pub trait FrameAlloc {
    /// Allocate one zero-filled 4 KiB page.
    fn alloc_4k(&self) -> Option<PhysicalAddress>;

    /// Return a page obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&self, pa: PhysicalAddress);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagemapError {
    #[error("out of physical memory for page tables")]
    OutOfMemory,
    #[error("no table at an intermediate level")]
    NotADirectory,
    #[error("no translation installed")]
    NotFound,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
}

/// Access to physical memory through a linear offset.
///
/// In the kernel the offset is [`HHDM_BASE`](info::HHDM_BASE): every physical
/// page `pa` is reachable at `HHDM_BASE + pa`. Hosted tests use the distance
/// between a heap buffer and the fake physical base it stands in for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's higher-half direct map.
    #[inline]
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(info::HHDM_BASE)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }

    /// Map a physical address to a typed mutable reference.
    ///
    /// # Safety
    /// - `pa` must be covered by this direct map and properly aligned for `T`.
    /// - The caller guarantees exclusive access for the returned lifetime.
    #[inline]
    #[must_use]
    pub unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }

    /// Fill one page with `byte`.
    ///
    /// # Safety
    /// `pa` must be a page of RAM covered by this direct map that nobody else
    /// is accessing.
    #[inline]
    pub unsafe fn fill_page(&self, pa: PhysicalAddress, byte: u8) {
        unsafe {
            core::ptr::write_bytes(self.phys_to_virt(pa).as_mut_ptr::<u8>(), byte, PAGE_SIZE as usize);
        }
    }

    /// Copy one page worth of bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both pages must be RAM covered by this direct map, distinct, and not
    /// written by anyone else during the copy.
    #[inline]
    pub unsafe fn copy_page(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_virt(src).as_mut_ptr::<u8>().cast_const(),
                self.phys_to_virt(dst).as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            );
        }
    }
}

#[cfg(test)]
mod tests;

//! # Page Table Page
//!
//! One 4 KiB-aligned page of 512 entries. The same layout is used at every
//! level of the walk; what an entry means depends on the level it sits at
//! (see [`PageEntryBits::is_leaf_at`]).

use crate::PageEntryBits;

/// Number of entries in one table page.
pub const ENTRIES: usize = 512;

/// A 4 KiB-aligned page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: usize) {
        self.entries[index] = PageEntryBits::new();
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Present entries with their indices.
    pub fn present(&self) -> impl Iterator<Item = (usize, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }

    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); ENTRIES];
    }
}

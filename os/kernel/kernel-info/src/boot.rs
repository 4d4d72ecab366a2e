//! # Boot Memory Inputs
//!
//! Plain descriptions of physical memory and of the loaded kernel image, as
//! handed over by the boot layer.

use core::fmt;
use core::ops::Range;

/// Kind of a physical memory region reported by the platform.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM, handed to the physical page allocator.
    Free,
    /// Firmware or device owned; never touched.
    Reserved,
    /// Firmware tables that could be reclaimed once parsed.
    Reclaimable,
    /// Boot modules (initrd and friends).
    Module,
    /// The linear framebuffer.
    Framebuffer,
}

impl MemoryKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Reclaimable => "reclaimable",
            Self::Module => "module",
            Self::Framebuffer => "framebuffer",
        }
    }

    /// Whether the region is backed by RAM the direct map should cover.
    #[must_use]
    pub const fn is_mappable(self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the physical memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub size: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: MemoryKind) -> Self {
        Self { base, size, kind }
    }

    /// One past the last byte of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Where the kernel image lives and how its sections are laid out.
///
/// Section ranges are virtual addresses. The physical address of any byte in
/// the image is `va - virtual_base + physical_base`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub virtual_base: u64,
    pub physical_base: u64,
    /// Executable, read-only.
    pub text: Range<u64>,
    /// Read-only, not executable.
    pub rodata: Range<u64>,
    /// Read-write, not executable (includes `.bss`).
    pub data: Range<u64>,
}

impl KernelImage {
    /// Physical address backing the virtual address `va` of the image.
    #[must_use]
    pub const fn physical_of(&self, va: u64) -> u64 {
        va - self.virtual_base + self.physical_base
    }
}

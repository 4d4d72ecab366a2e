//! # Protection and Mapping Attributes
//!
//! Architecture-neutral descriptions of what a translation allows
//! ([`Prot`]), how it is installed ([`MapFlags`], [`LeafSize`]) and what a
//! query returns ([`Mapping`]).

use bitfield_struct::bitfield;
use core::ops::BitOr;
use kernel_memory_addresses::{HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// Access rights of a mapping.
///
/// ```rust
/// # use kernel_vmem::Prot;
/// let rw = Prot::READ | Prot::WRITE;
/// assert!(rw.allows(Prot::WRITE));
/// assert!(!rw.allows(Prot::EXECUTE));
/// assert_eq!(rw.without_write(), Prot::READ);
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    #[bits(5)]
    __: u8,
}

impl Prot {
    pub const NONE: Self = Self::new();
    pub const READ: Self = Self::new().with_read(true);
    pub const WRITE: Self = Self::new().with_write(true);
    pub const EXECUTE: Self = Self::new().with_execute(true);
    pub const ALL: Self = Self::new()
        .with_read(true)
        .with_write(true)
        .with_execute(true);

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    /// Whether every right in `needed` is granted.
    #[inline]
    #[must_use]
    pub const fn allows(self, needed: Self) -> bool {
        self.into_bits() & needed.into_bits() == needed.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn without_write(self) -> Self {
        self.with_write(false)
    }
}

impl BitOr for Prot {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// How a translation is installed.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MapFlags {
    /// Accessible from user mode.
    pub user: bool,
    /// 2 MiB leaf at L2.
    pub large: bool,
    /// 1 GiB leaf at L3.
    pub huge: bool,
    #[bits(5)]
    __: u8,
}

impl MapFlags {
    pub const NONE: Self = Self::new();
    pub const USER: Self = Self::new().with_user(true);
    pub const LARGE: Self = Self::new().with_large(true);
    pub const HUGE: Self = Self::new().with_huge(true);

    /// Leaf size requested by these flags. `huge` wins over `large`.
    #[inline]
    #[must_use]
    pub const fn leaf_size(self) -> LeafSize {
        if self.huge() {
            LeafSize::Huge
        } else if self.large() {
            LeafSize::Large
        } else {
            LeafSize::Normal
        }
    }

    /// The same flags, requesting a leaf of `size`.
    #[inline]
    #[must_use]
    pub const fn sized(self, size: LeafSize) -> Self {
        self.with_large(matches!(size, LeafSize::Large))
            .with_huge(matches!(size, LeafSize::Huge))
    }
}

impl BitOr for MapFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

/// Size class of a leaf translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LeafSize {
    /// 4 KiB, mapped by an L1 entry.
    Normal,
    /// 2 MiB, mapped by an L2 entry with PS set.
    Large,
    /// 1 GiB, mapped by an L3 entry with PS set.
    Huge,
}

impl LeafSize {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Normal => PAGE_SIZE,
            Self::Large => LARGE_PAGE_SIZE,
            Self::Huge => HUGE_PAGE_SIZE,
        }
    }

    /// Table level holding a leaf of this size.
    #[inline]
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::Large => 2,
            Self::Huge => 3,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            3 => Self::Huge,
            2 => Self::Large,
            _ => Self::Normal,
        }
    }

    /// Leaf size for the direct map: 1 GiB when the CPU supports it,
    /// 2 MiB otherwise. Probed once per call; callers keep the result.
    #[must_use]
    pub fn for_direct_map() -> Self {
        if crate::arch::supports_huge_pages() {
            Self::Huge
        } else {
            Self::Large
        }
    }
}

/// Result of a translation query.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mapping {
    /// Physical base of the leaf.
    pub base: PhysicalAddress,
    pub prot: Prot,
    pub size: LeafSize,
    pub user: bool,
}

impl Mapping {
    /// Physical address `va` translates to through this leaf.
    #[inline]
    #[must_use]
    pub const fn translate(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + (va.as_u64() & (self.size.bytes() - 1)))
    }
}

//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses used by the paging and memory
//! management crates. Both types are `#[repr(transparent)]` wrappers around
//! `u64` and cost nothing at runtime; their only purpose is to make it a type
//! error to hand a virtual address to something that expects a physical one.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated by the page tables. |
//! | [`PhysicalAddress`] | An address of RAM or MMIO as seen by the memory bus. |
//!
//! Everything in the virtual memory subsystem is accounted in units of
//! [`PAGE_SIZE`]; the larger leaf sizes used by the page tables are exposed as
//! [`LARGE_PAGE_SIZE`] (2 MiB) and [`HUGE_PAGE_SIZE`] (1 GiB).
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.align_down(PAGE_SIZE).as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! assert!(va.is_higher_half());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of a large (2 MiB) leaf in bytes.
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Size of a huge (1 GiB) leaf in bytes.
pub const HUGE_PAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Align `x` down to a power-of-two `align`.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a power-of-two `align`.
///
/// Saturates at the highest aligned value instead of wrapping.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1234, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Number of base pages needed to cover `bytes`.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(u64::MAX, PAGE_SIZE), u64::MAX & !(PAGE_SIZE - 1));
        assert_eq!(pages_for(8192), 2);
        assert_eq!(pages_for(8193), 3);
    }

    #[test]
    fn table_indices_split_the_address() {
        let va = VirtualAddress::new(0xFFFF_8880_4020_1123);
        assert_eq!(va.table_index(4), 273);
        assert_eq!(va.table_index(3), 1);
        assert_eq!(va.table_index(2), 1);
        assert_eq!(va.table_index(1), 1);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn lower_half_is_not_kernel() {
        assert!(!VirtualAddress::new(0x0000_0800_0000_0000).is_higher_half());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_higher_half());
    }
}

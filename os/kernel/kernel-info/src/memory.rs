//! # Memory Layout

/// End of the canonical lower half; everything at or above belongs to the kernel.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// The direct map always covers at least this much physical memory,
/// regardless of how much RAM is installed.
pub const DIRECT_MAP_MIN: u64 = 4 * 1024 * 1024 * 1024;

/// First address handed out by a user address space's arena.
pub const USER_ARENA_BASE: u64 = 0x0000_0800_0000_0000;

/// Size of a user address space's arena.
pub const USER_ARENA_SIZE: u64 = 0x0000_0001_0000_0000;

/// Size of the kernel heap window placed right after the direct map.
pub const KERNEL_HEAP_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// First PML4 slot of the shared kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Start of the kernel heap window for a direct map covering `mappable` bytes.
///
/// The window begins right after the direct map, which is at least
/// [`DIRECT_MAP_MIN`] large and rounded up to a gigabyte.
#[must_use]
pub const fn kernel_heap_base(mappable: u64) -> u64 {
    const GIB: u64 = 1024 * 1024 * 1024;
    let span = if mappable > DIRECT_MAP_MIN {
        mappable
    } else {
        DIRECT_MAP_MIN
    };
    HHDM_BASE + span.div_ceil(GIB) * GIB
}

const _: () = {
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(USER_ARENA_BASE + USER_ARENA_SIZE <= USERSPACE_END);
    assert!(USER_ARENA_BASE.is_multiple_of(4096));
    assert!(kernel_heap_base(0) + KERNEL_HEAP_SIZE < KERNEL_BASE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_follows_direct_map() {
        assert_eq!(kernel_heap_base(0), HHDM_BASE + DIRECT_MAP_MIN);
        assert_eq!(
            kernel_heap_base(DIRECT_MAP_MIN + 1),
            HHDM_BASE + DIRECT_MAP_MIN + 1024 * 1024 * 1024
        );
    }
}

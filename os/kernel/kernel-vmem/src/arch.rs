//! # CPU Paging Control
//!
//! The few privileged instructions the page table code needs: loading the
//! translation root, invalidating a single TLB entry and probing for
//! gigabyte-page support.
//!
//! Bare-metal x86-64 builds issue the real instructions. Hosted builds
//! (tests, tooling) record the active root in a process-wide cell instead, so
//! activation stays observable without privileges.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use core::arch::asm;

    #[inline]
    pub unsafe fn write_cr3(value: u64) {
        unsafe {
            asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }

    #[inline]
    pub fn read_cr3() -> u64 {
        let value: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    #[inline]
    pub fn invlpg(va: u64) {
        unsafe {
            asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicU64, Ordering};

    static ACTIVE_ROOT: AtomicU64 = AtomicU64::new(0);

    #[inline]
    pub unsafe fn write_cr3(value: u64) {
        ACTIVE_ROOT.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn read_cr3() -> u64 {
        ACTIVE_ROOT.load(Ordering::SeqCst)
    }

    #[inline]
    pub const fn invlpg(_va: u64) {}
}

/// CR3 physical address bits [51:12].
const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Make `root` the live translation root.
///
/// # Safety
/// `root` must be a fully populated PML4 that maps the currently executing
/// code, stack and data.
#[inline]
pub unsafe fn load_root(root: PhysicalAddress) {
    unsafe { imp::write_cr3(root.as_u64() & CR3_ADDR_MASK) }
}

/// Physical address of the live translation root.
#[inline]
#[must_use]
pub fn active_root() -> PhysicalAddress {
    PhysicalAddress::new(imp::read_cr3() & CR3_ADDR_MASK)
}

/// Drop the TLB entry for the page containing `va` on this CPU.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    imp::invlpg(va.as_u64());
}

/// Whether the CPU supports 1 GiB leaves (CPUID `0x8000_0001`, EDX bit 26).
#[must_use]
pub fn supports_huge_pages() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use core::arch::x86_64::__cpuid;

        #[allow(unused_unsafe)]
        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
        if max_ext < 0x8000_0001 {
            return false;
        }

        #[allow(unused_unsafe)]
        let ext = unsafe { __cpuid(0x8000_0001) };
        ext.edx & (1 << 26) != 0
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

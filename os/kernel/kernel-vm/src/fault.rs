//! # Page Fault Entry
//!
//! The interrupt layer hands over the faulting address and the raw error
//! code; [`dispatch_fault`] resolves it against an address space and tells
//! the caller what to do if that fails.

use crate::space::AddressSpace;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::arch;
use log::error;

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FaultFlags {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 1 = write access.
    pub write: bool,
    /// 1 = access from user mode.
    pub user: bool,
    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool,
    /// 1 = instruction fetch.
    pub execute: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl FaultFlags {
    pub const PRESENT: Self = Self::new().with_present(true);
    pub const WRITE: Self = Self::new().with_write(true);
    pub const USER: Self = Self::new().with_user(true);
    pub const EXECUTE: Self = Self::new().with_execute(true);

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.execute() {
            if self.user() {
                "user-mode instruction fetch on protected page"
            } else {
                "kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "write access to protected page"
        } else {
            "read access to protected page"
        }
    }
}

impl core::ops::BitOr for FaultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// What the interrupt layer should do after a page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultResolution {
    /// The access can be retried.
    Resolved,
    /// Unresolved fault from user mode: terminate the task.
    KillTask {
        address: VirtualAddress,
        flags: FaultFlags,
    },
    /// Unresolved fault in the kernel: this is fatal.
    Panic {
        address: VirtualAddress,
        flags: FaultFlags,
        root: PhysicalAddress,
    },
}

/// Resolve a fault at `address` in `space`.
pub fn dispatch_fault(
    space: &AddressSpace,
    address: VirtualAddress,
    flags: FaultFlags,
) -> FaultResolution {
    if space.fault(address, flags) {
        return FaultResolution::Resolved;
    }

    error!(
        "page fault: {} at {address} in {} (err={:#x})",
        flags.explain(),
        space.name(),
        flags.into_bits()
    );

    if flags.user() {
        FaultResolution::KillTask { address, flags }
    } else {
        FaultResolution::Panic {
            address,
            flags,
            root: arch::active_root(),
        }
    }
}

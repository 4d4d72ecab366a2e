use crate::{LeafSize, MapFlags, Prot};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// Models the common superset of the fields found at all four paging levels
/// (PML4E, PDPTE, PDE, PTE). An entry either points to the next-level table
/// or, at L1 or with the `large_page` (PS) bit set at L2/L3, maps a physical
/// page directly.
///
/// ### Bit layout
///
/// | Bits      | Name       | Meaning |
/// |-----------|------------|---------|
/// | 0         | `P`        | Valid entry if set |
/// | 1         | `RW`       | Writable if set |
/// | 2         | `US`       | User-mode accessible if set |
/// | 3         | `PWT`      | Write-through caching |
/// | 4         | `PCD`      | Disable caching |
/// | 5         | `A`        | Accessed |
/// | 6         | `D`        | Dirty (leaf only) |
/// | 7         | `PS`       | Large page (L2/L3 only) |
/// | 8         | `G`        | Global (leaf only) |
/// | 9–11      | avail low  | Ignored by hardware |
/// | 12–51     | `addr`     | Physical frame bits [51:12] |
/// | 52–58     | avail high | Ignored by hardware |
/// | 59–62     | `PKU`      | Protection key |
/// | 63        | `NX`       | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::{LeafSize, MapFlags, PageEntryBits, Prot};
/// let e = PageEntryBits::leaf(
///     PhysicalAddress::new(0x12_3000),
///     Prot::READ | Prot::WRITE,
///     MapFlags::USER,
///     LeafSize::Normal,
/// );
/// assert!(e.present() && e.writable() && e.user_access() && e.no_execute());
/// assert_eq!(e.physical_address().as_u64(), 0x12_3000);
/// assert_eq!(e.prot(), Prot::READ | Prot::WRITE);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1). Clear for read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow CPL3 access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// At L3 and L2 a set bit turns the entry into a 1 GiB or 2 MiB leaf.
    /// Must be clear at L4; at L1 the position is PAT and always left clear.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    ///
    /// Permissions are the intersection over the walk; one NX on the path
    /// blocks execution.
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Entry pointing at a next-level table.
    ///
    /// Intermediate entries are maximally permissive; the leaf decides.
    #[inline]
    #[must_use]
    pub const fn table(phys: PhysicalAddress) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true);
        e.set_physical_address(phys);
        e
    }

    /// Leaf entry mapping `phys` with the given protection.
    #[inline]
    #[must_use]
    pub const fn leaf(phys: PhysicalAddress, prot: Prot, flags: MapFlags, size: LeafSize) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(prot.write())
            .with_user_access(flags.user())
            .with_large_page(!matches!(size, LeafSize::Normal))
            .with_no_execute(!prot.execute());
        e.set_physical_address(phys);
        e
    }

    /// Protection granted by a leaf entry.
    #[inline]
    #[must_use]
    pub const fn prot(&self) -> Prot {
        Prot::new()
            .with_read(self.present())
            .with_write(self.writable())
            .with_execute(!self.no_execute())
    }

    /// Whether an entry at table `level` terminates the walk.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(&self, level: u8) -> bool {
        level == 1 || (level <= 3 && self.large_page())
    }
}

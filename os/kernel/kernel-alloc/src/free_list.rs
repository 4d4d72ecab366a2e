use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::DirectMap;

/// Header stored at the beginning of every **free** physical region.
///
/// ```text
/// +-------------------+----------------------------------+
/// | Region (header)   |  rest of the region (free pages) |
/// +-------------------+----------------------------------+
/// ^ region base (page aligned)
/// ```
///
/// - `size` is the length of the whole region in bytes, a multiple of the
///   page size.
/// - `next` is the physical address of the next region or [`NONE`].
#[repr(C)]
struct Region {
    size: u64,
    next: u64,
}

/// End-of-list marker. Physical address zero is a valid page, so it cannot
/// double as the terminator.
const NONE: u64 = u64::MAX;

/// A LIFO list of variable-size physical regions, threaded through the free
/// memory itself.
///
/// # Invariants
/// - Regions are page aligned, non-overlapping and at least one page long.
/// - Headers are only touched through the direct map while the owning lock
///   is held.
pub(crate) struct FreeList {
    head: u64,
    mapper: DirectMap,
}

impl FreeList {
    pub(crate) const fn new(mapper: DirectMap) -> Self {
        Self { head: NONE, mapper }
    }

    /// # Safety
    /// `pa` must be the base of a region on this list.
    #[allow(clippy::mut_from_ref)]
    unsafe fn region(&self, pa: u64) -> &mut Region {
        unsafe { self.mapper.phys_to_mut(PhysicalAddress::new(pa)) }
    }

    /// Thread `[base, base + size)` onto the front of the list.
    ///
    /// # Safety
    /// The range must be free RAM, reachable through the direct map and not
    /// already on the list. `base` and `size` must be page aligned.
    pub(crate) unsafe fn add_region(&mut self, base: u64, size: u64) {
        debug_assert!(base.is_multiple_of(PAGE_SIZE) && size.is_multiple_of(PAGE_SIZE));
        if size == 0 {
            return;
        }
        unsafe {
            core::ptr::write(
                self.mapper.phys_to_virt(PhysicalAddress::new(base)).as_mut_ptr(),
                Region {
                    size,
                    next: self.head,
                },
            );
        }
        self.head = base;
    }

    /// Take one page off the head region.
    ///
    /// The page comes from the top of the region so the header at its base
    /// stays in place; the region is unlinked once it is used up.
    pub(crate) fn pop_page(&mut self) -> Option<PhysicalAddress> {
        if self.head == NONE {
            return None;
        }

        let head = self.head;
        let region = unsafe { self.region(head) };
        region.size -= PAGE_SIZE;
        let page = head + region.size;
        if region.size == 0 {
            self.head = region.next;
        }
        Some(PhysicalAddress::new(page))
    }

    /// Push a single page back as a one-page region.
    ///
    /// # Safety
    /// `pa` must be a page that was handed out by [`pop_page`](Self::pop_page)
    /// and is no longer in use.
    pub(crate) unsafe fn push_page(&mut self, pa: PhysicalAddress) {
        unsafe { self.add_region(pa.as_u64(), PAGE_SIZE) }
    }

    /// `(base, size)` of every region, head first.
    pub(crate) fn regions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NONE {
                return None;
            }
            let region = unsafe { self.region(cursor) };
            let item = (cursor, region.size);
            cursor = region.next;
            Some(item)
        })
    }

    /// Whether the page at `pa` is reachable from the list.
    pub(crate) fn contains(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.as_u64();
        self.regions()
            .any(|(base, size)| pa >= base && pa < base + size)
    }
}

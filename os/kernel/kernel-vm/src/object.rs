//! # Memory Objects
//!
//! The backing store of one mapping. An object owns an [`AnonMap`] of the
//! pages it has touched and, if it was produced by [`MemoryObject::copy`], a
//! weak back-reference to the object it was forked from.
//!
//! Faults are resolved here:
//!
//! ```text
//!             ┌─ local anon ──► write and shared? ──► privatize
//!  fault(p) ──┤
//!             └─ no local anon ─► parent alive? ─► parent anon (created on demand), duplicated
//!                                       └───────► fresh zero-filled page
//! ```
//!
//! A shared page is only ever installed read-only, so the next write to it
//! faults again and takes the privatization path.
//!
//! ## Pages the parent touches after the fork
//!
//! A fork shares every page resident at that moment. A page neither side had
//! touched is looked up in the parent when the child first faults on it, so
//! if the parent wrote it in between, the child starts from the parent's
//! current contents rather than from zeroes. Pages resident at fork time
//! never leak this way: after the fork each side only ever sees its own
//! writes to them.

use crate::anon::{Anon, AnonMap};
use crate::fault::FaultFlags;
use crate::{Pagemap, VmError};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::PhysicalPageAllocator;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use kernel_vmem::{MapFlags, PagemapKind, Prot};
use log::{debug, warn};
use spin::Mutex;

pub struct MemoryObject {
    /// Bytes, a multiple of the page size.
    size: u64,
    amap: Mutex<AnonMap>,
    parent: Option<Weak<MemoryObject>>,
    phys: Arc<PhysicalPageAllocator>,
}

impl MemoryObject {
    /// An empty anonymous object covering `size` bytes.
    #[must_use]
    pub fn new(size: u64, phys: Arc<PhysicalPageAllocator>) -> Arc<Self> {
        Arc::new(Self {
            size: align_up(size, PAGE_SIZE),
            amap: Mutex::new(AnonMap::default()),
            parent: None,
            phys,
        })
    }

    /// Fork this object.
    ///
    /// The child starts with the same resident pages (shared or duplicated,
    /// see [`AnonMap::copy`]) and remembers `self` as its parent.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if pages had to be duplicated and ran out.
    pub fn copy(self: &Arc<Self>) -> Result<Arc<Self>, VmError> {
        let amap = self.amap.lock().copy(&self.phys)?;
        Ok(Arc::new(Self {
            size: self.size,
            amap: Mutex::new(amap),
            parent: Some(Arc::downgrade(self)),
            phys: Arc::clone(&self.phys),
        }))
    }

    #[must_use]
    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Drop one reference; the last one releases every resident page this
    /// object still holds.
    pub fn release(self: Arc<Self>) {
        drop(self);
    }

    /// References held by mappings and other handles.
    #[must_use]
    pub fn refcount(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// The object this one was forked from, if it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn is_copy(&self) -> bool {
        self.parent.is_some()
    }

    /// The anon resident at page index `page`.
    #[must_use]
    pub fn anon_at(&self, page: usize) -> Option<Arc<Anon>> {
        self.amap.lock().get(page).cloned()
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.amap.lock().len()
    }

    /// Snapshot of every resident page, in page order.
    #[must_use]
    pub fn resident(&self) -> Vec<(usize, Arc<Anon>)> {
        self.amap
            .lock()
            .iter()
            .map(|(page, anon)| (page, Arc::clone(anon)))
            .collect()
    }

    /// Resolve a fault on page `page` of a mapping of this object starting
    /// at `start`, and install the result in `pagemap` with the mapping's
    /// protection `prot`.
    ///
    /// Returns `false` if the fault could not be resolved.
    pub fn fault(
        &self,
        pagemap: &Pagemap,
        start: VirtualAddress,
        page: usize,
        flags: FaultFlags,
        prot: Prot,
    ) -> bool {
        match self.resolve(pagemap, start, page, flags.write(), prot) {
            Ok(()) => true,
            Err(e) => {
                warn!("object: fault on page {page} of mapping at {start}: {e}");
                false
            }
        }
    }

    fn resolve(
        &self,
        pagemap: &Pagemap,
        start: VirtualAddress,
        page: usize,
        write: bool,
        prot: Prot,
    ) -> Result<(), VmError> {
        if page as u64 >= self.size / PAGE_SIZE {
            return Err(VmError::InvalidParameters("fault beyond the end of the object"));
        }

        let mut privatized = false;
        let anon = {
            let mut amap = self.amap.lock();
            match amap.get(page).cloned() {
                Some(anon) => {
                    let lock = anon.lock();
                    if write && lock.is_shared() {
                        let private = lock.duplicate(&self.phys)?;
                        drop(lock);
                        privatized = true;
                        amap.insert(private)
                    } else {
                        drop(lock);
                        anon
                    }
                }
                None => {
                    let anon = match self.parent() {
                        Some(parent) => {
                            let mut parent_map = parent.amap.lock();
                            let shared = match parent_map.get(page).cloned() {
                                Some(anon) => anon,
                                None => parent_map.insert(Anon::zeroed(&self.phys, page)?),
                            };
                            shared.lock().duplicate(&self.phys)?
                        }
                        None => Anon::zeroed(&self.phys, page)?,
                    };
                    amap.insert(anon)
                }
            }
        };

        let lock = anon.lock();
        let prot = if lock.is_shared() {
            prot.without_write()
        } else {
            prot
        };
        let flags = match pagemap.kind() {
            PagemapKind::User => MapFlags::USER,
            PagemapKind::Kernel => MapFlags::NONE,
        };
        let va = start + page as u64 * PAGE_SIZE;
        if privatized {
            pagemap.replace(va, anon.physical_page(), prot, flags)?;
        } else {
            pagemap.map(va, anon.physical_page(), prot, flags)?;
        }
        drop(lock);
        Ok(())
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("size", &self.size)
            .field("resident", &self.resident_pages())
            .field("copy", &self.is_copy())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        debug!(
            "object: releasing {:#x} bytes, {} resident pages",
            self.size,
            self.amap.get_mut().len()
        );
    }
}

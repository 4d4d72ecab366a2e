//! # Anonymous Pages
//!
//! An [`Anon`] is one resident page of anonymous memory. Its reference count
//! is the number of [`AnonMap`] entries pointing at it; more than one means
//! the page is shared copy-on-write and must be privatized before anyone
//! writes to it. The page goes back to the physical allocator when the last
//! map lets go.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use kernel_alloc::{Frame, OutOfMemory, PhysicalPageAllocator};
use kernel_memory_addresses::PhysicalAddress;
use log::trace;
use spin::{Mutex, MutexGuard};

pub struct Anon {
    frame: Frame,
    /// Page index within the owning object.
    offset: usize,
    refcnt: Mutex<usize>,
}

impl Anon {
    /// A fresh zero-filled page at `offset`, referenced once.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no physical page is left.
    pub fn zeroed(phys: &Arc<PhysicalPageAllocator>, offset: usize) -> Result<Self, OutOfMemory> {
        Ok(Self {
            frame: phys.alloc_frame(true)?,
            offset,
            refcnt: Mutex::new(1),
        })
    }

    /// Take the anon lock. Everything that reads or changes the reference
    /// count goes through the returned guard.
    pub fn lock(&self) -> AnonLock<'_> {
        AnonLock {
            anon: self,
            refcnt: self.refcnt.lock(),
        }
    }

    #[must_use]
    pub fn refcount(&self) -> usize {
        *self.refcnt.lock()
    }

    #[must_use]
    pub const fn physical_page(&self) -> PhysicalAddress {
        self.frame.address()
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Contents of the page.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.frame.bytes()
    }
}

impl fmt::Debug for Anon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anon")
            .field("page", &self.frame.address())
            .field("offset", &self.offset)
            .field("refcnt", &self.refcount())
            .finish()
    }
}

/// A locked [`Anon`].
pub struct AnonLock<'a> {
    anon: &'a Anon,
    refcnt: MutexGuard<'a, usize>,
}

impl AnonLock<'_> {
    #[must_use]
    pub fn refcount(&self) -> usize {
        *self.refcnt
    }

    /// Whether another map still references this page.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        *self.refcnt > 1
    }

    /// A private copy of the page, referenced once.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no physical page is left.
    pub fn duplicate(&self, phys: &Arc<PhysicalPageAllocator>) -> Result<Anon, OutOfMemory> {
        let mut frame = phys.alloc_frame(false)?;
        frame.copy_from(&self.anon.frame);
        trace!(
            "anon: privatized {} into {}",
            self.anon.frame.address(),
            frame.address()
        );
        Ok(Anon {
            frame,
            offset: self.anon.offset,
            refcnt: Mutex::new(1),
        })
    }

    fn retain(&mut self) {
        *self.refcnt += 1;
    }

    fn release(&mut self) {
        debug_assert!(*self.refcnt > 0, "anon reference count underflow");
        *self.refcnt = self.refcnt.saturating_sub(1);
    }
}

/// The resident pages of one memory object, keyed by page index.
#[derive(Default)]
pub struct AnonMap {
    anons: BTreeMap<usize, Arc<Anon>>,
}

impl AnonMap {
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<&Arc<Anon>> {
        self.anons.get(&offset)
    }

    /// Put a freshly created anon in place, dropping this map's reference to
    /// whatever was at the same offset before.
    pub fn insert(&mut self, anon: Anon) -> Arc<Anon> {
        debug_assert_eq!(anon.refcount(), 1);
        let anon = Arc::new(anon);
        if let Some(old) = self.anons.insert(anon.offset, Arc::clone(&anon)) {
            old.lock().release();
        }
        anon
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.anons.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anons.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<Anon>)> {
        self.anons.iter().map(|(&offset, anon)| (offset, anon))
    }

    /// A map for a forked object.
    ///
    /// With copy-on-write every anon is shared and gains a reference;
    /// otherwise every page is duplicated right away.
    ///
    /// # Errors
    /// [`OutOfMemory`] if a page cannot be duplicated.
    pub fn copy(&self, phys: &Arc<PhysicalPageAllocator>) -> Result<Self, OutOfMemory> {
        let mut copy = Self::default();
        for (&offset, anon) in &self.anons {
            if cfg!(feature = "cow") {
                anon.lock().retain();
                copy.anons.insert(offset, Arc::clone(anon));
            } else {
                let private = anon.lock().duplicate(phys)?;
                copy.anons.insert(offset, Arc::new(private));
            }
        }
        Ok(copy)
    }
}

impl fmt::Debug for AnonMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.anons.iter()).finish()
    }
}

impl Drop for AnonMap {
    fn drop(&mut self) {
        for anon in self.anons.values() {
            anon.lock().release();
        }
    }
}

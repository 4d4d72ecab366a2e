//! # Resource Arena
//!
//! A general purpose allocator for integer ranges after Bonwick and Adams,
//! *Magazines and Vmem* (USENIX 2001). An arena manages one or more **spans**
//! in units of a fixed **quantum** and never dereferences what it hands out,
//! so the same code serves virtual address ranges and plain identifiers.
//!
//! ## Segments
//!
//! Every span is partitioned into segments that are either allocated or free.
//! Segments are external boundary tags kept in address order, each span
//! preceded by a marker segment:
//!
//! ```text
//!  queue:  [SPAN 0x1000+0x8000] [ALLOC 0x1000+0x2000] [FREE 0x3000+0x6000] [SPAN ...] ...
//!
//!  freelists[n]: free segments with 2^n <= size < 2^(n+1)
//!  hash[h]:      allocated segments, keyed by base address
//! ```
//!
//! Freeing coalesces with free neighbours inside the same span. A span that
//! was imported from a [`SpanSource`] goes back to it as soon as it is
//! entirely free again.
//!
//! ## Bootstrap
//!
//! Segment slots come from an inline pool first and a growable vector after
//! that. An allocation flagged [`AllocFlags::bootstrap`] only uses slots that
//! are already on hand, which lets an arena feed the very heap its vector
//! would grow into.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::iter::successors;
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

/// One freelist per power of two.
const FREELISTS: usize = 64;
const HASH_BUCKETS: usize = 16;

/// Slots available before the arena ever allocates.
const BOOTSTRAP_SLOTS: usize = 64;

/// Slots kept in reserve after every non-bootstrap operation.
const MIN_SPARE: usize = 4;

/// Minimum size of an import, in quanta.
const IMPORT_QUANTA: u64 = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena exhausted")]
    OutOfMemory,
    #[error("no such allocation")]
    NotFound,
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentKind {
    Allocated,
    Free,
    /// Marks the start of an imported or added span.
    Span,
}

/// Where to look for a free segment.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum AllocPolicy {
    /// Take any segment from the first freelist guaranteed to fit.
    #[default]
    InstantFit,
    /// Smallest adequate segment.
    BestFit,
    /// First fit after the previous allocation, wrapping around.
    NextFit,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct AllocFlags {
    pub policy: AllocPolicy,
    /// Do not grow segment storage.
    pub bootstrap: bool,
}

impl AllocFlags {
    pub const INSTANT_FIT: Self = Self::with(AllocPolicy::InstantFit);
    pub const BEST_FIT: Self = Self::with(AllocPolicy::BestFit);
    pub const NEXT_FIT: Self = Self::with(AllocPolicy::NextFit);

    const fn with(policy: AllocPolicy) -> Self {
        Self {
            policy,
            bootstrap: false,
        }
    }

    #[must_use]
    pub const fn bootstrap(self) -> Self {
        Self {
            bootstrap: true,
            ..self
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ArenaStats {
    /// Bytes handed out.
    pub in_use: u64,
    /// Bytes currently imported from the source.
    pub imported: u64,
    /// Bytes in all spans.
    pub total: u64,
    pub allocs: u64,
    pub frees: u64,
}

/// Where an arena gets more spans from when it runs dry.
pub trait SpanSource: Send + Sync {
    /// Hand out `size` bytes.
    ///
    /// # Errors
    /// [`ArenaError::OutOfMemory`] when the source is exhausted.
    fn import(&self, size: u64) -> Result<u64, ArenaError>;

    /// Take back a span obtained from [`import`](Self::import).
    fn export(&self, base: u64, size: u64);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct SegId(u32);

type Link = Option<SegId>;

/// The intrusive list a segment is threaded on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum List {
    Free(usize),
    Hash(usize),
    Spans,
    Spare,
}

#[derive(Debug, Copy, Clone)]
struct Segment {
    kind: SegmentKind,
    imported: bool,
    base: u64,
    size: u64,
    prev: Link,
    next: Link,
    list: Option<List>,
    list_prev: Link,
    list_next: Link,
}

impl Segment {
    const EMPTY: Self = Self {
        kind: SegmentKind::Free,
        imported: false,
        base: 0,
        size: 0,
        prev: None,
        next: None,
        list: None,
        list_prev: None,
        list_next: None,
    };

    const fn end(&self) -> u64 {
        self.base + self.size
    }
}

struct Heads {
    freelists: [Link; FREELISTS],
    hash: [Link; HASH_BUCKETS],
    spans: Link,
    spare: Link,
}

pub struct Arena {
    name: &'static str,
    quantum: u64,
    boot: [Segment; BOOTSTRAP_SLOTS],
    extra: Vec<Segment>,
    spare_count: usize,
    queue_head: Link,
    queue_tail: Link,
    heads: Heads,
    cursor: u64,
    source: Option<Arc<dyn SpanSource>>,
    stats: ArenaStats,
}

#[inline]
const fn freelist_index(size: u64) -> usize {
    (63 - size.leading_zeros()) as usize
}

impl Arena {
    /// Create an arena over `[base, base + size)`.
    ///
    /// `size` may be zero for an arena that only lives off imports from
    /// `source`.
    ///
    /// # Errors
    /// [`ArenaError::InvalidParameters`] if the quantum is not a power of two
    /// or the initial span is not quantum aligned.
    pub fn new(
        name: &'static str,
        base: u64,
        size: u64,
        quantum: u64,
        source: Option<Arc<dyn SpanSource>>,
    ) -> Result<Self, ArenaError> {
        if !quantum.is_power_of_two() {
            return Err(ArenaError::InvalidParameters("quantum must be a power of two"));
        }

        let mut arena = Self {
            name,
            quantum,
            boot: [Segment::EMPTY; BOOTSTRAP_SLOTS],
            extra: Vec::new(),
            spare_count: 0,
            queue_head: None,
            queue_tail: None,
            heads: Heads {
                freelists: [None; FREELISTS],
                hash: [None; HASH_BUCKETS],
                spans: None,
                spare: None,
            },
            cursor: base,
            source,
            stats: ArenaStats::default(),
        };

        for i in (0..BOOTSTRAP_SLOTS).rev() {
            #[allow(clippy::cast_possible_truncation)]
            arena.release_slot(SegId(i as u32));
        }

        if size > 0 {
            arena.add_span(base, size)?;
        }

        debug!(
            "arena {}: created [{base:#x}, {:#x}) quantum {quantum:#x}",
            arena.name,
            base.wrapping_add(size)
        );
        Ok(arena)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn quantum(&self) -> u64 {
        self.quantum
    }

    #[must_use]
    pub const fn stats(&self) -> ArenaStats {
        self.stats
    }

    /// Add a span the arena owns outright.
    ///
    /// # Errors
    /// [`ArenaError::InvalidParameters`] for a misaligned, empty or
    /// overlapping span.
    pub fn add_span(&mut self, base: u64, size: u64) -> Result<(), ArenaError> {
        self.check_range(base, size)?;
        let overlaps = self
            .list_iter(self.heads.spans)
            .map(|id| self.seg(id))
            .any(|span| base < span.end() && span.base < base + size);
        if overlaps {
            return Err(ArenaError::InvalidParameters("span overlaps an existing span"));
        }

        self.reserve_slots(2, false)?;
        self.insert_span(base, size, false);
        Ok(())
    }

    /// Allocate `size` bytes, rounded up to the quantum.
    ///
    /// # Errors
    /// - [`ArenaError::InvalidParameters`] for a zero size.
    /// - [`ArenaError::OutOfMemory`] when no segment fits and nothing could be
    ///   imported, or when a bootstrap allocation runs out of slots.
    pub fn alloc(&mut self, size: u64, flags: AllocFlags) -> Result<u64, ArenaError> {
        if size == 0 {
            return Err(ArenaError::InvalidParameters("zero-sized allocation"));
        }
        let size = size
            .checked_next_multiple_of(self.quantum)
            .ok_or(ArenaError::OutOfMemory)?;

        let needed = if self.source.is_some() { 4 } else { 2 };
        self.reserve_slots(needed, flags.bootstrap)?;

        let found = match self.find(size, flags.policy) {
            Some(found) => found,
            None => {
                self.import(size)?;
                self.find(size, flags.policy).ok_or(ArenaError::OutOfMemory)?
            }
        };

        let (id, addr) = found;
        self.carve(id, addr, size);
        self.cursor = addr + size;
        Ok(addr)
    }

    /// Claim exactly `[addr, addr + size)`.
    ///
    /// # Errors
    /// - [`ArenaError::NotFound`] if `addr` lies outside every span.
    /// - [`ArenaError::InvalidParameters`] if the range is misaligned or not
    ///   entirely free.
    pub fn alloc_at(&mut self, addr: u64, size: u64, bootstrap: bool) -> Result<u64, ArenaError> {
        self.check_range(addr, size)?;
        self.reserve_slots(2, bootstrap)?;

        let id = self
            .queue_iter()
            .find(|&id| {
                let seg = self.seg(id);
                seg.kind != SegmentKind::Span && seg.base <= addr && addr < seg.end()
            })
            .ok_or(ArenaError::NotFound)?;

        let seg = self.seg(id);
        if seg.kind != SegmentKind::Free || addr + size > seg.end() {
            return Err(ArenaError::InvalidParameters("range is already in use"));
        }

        self.carve(id, addr, size);
        Ok(addr)
    }

    /// Give back a range obtained from [`alloc`](Self::alloc) or
    /// [`alloc_at`](Self::alloc_at).
    ///
    /// # Errors
    /// - [`ArenaError::NotFound`] if nothing is allocated at `addr`.
    /// - [`ArenaError::InvalidParameters`] if `size` does not match.
    pub fn free(&mut self, addr: u64, size: u64) -> Result<(), ArenaError> {
        let size = size.next_multiple_of(self.quantum);
        let id = self
            .list_iter(self.heads.hash[self.hash_bucket(addr)])
            .find(|&id| self.seg(id).base == addr)
            .ok_or(ArenaError::NotFound)?;
        if self.seg(id).size != size {
            return Err(ArenaError::InvalidParameters("size does not match allocation"));
        }

        self.list_remove(id);
        self.seg_mut(id).kind = SegmentKind::Free;
        self.stats.in_use -= size;
        self.stats.frees += 1;

        if let Some(next) = self.seg(id).next
            && self.seg(next).kind == SegmentKind::Free
        {
            let absorbed = self.seg(next).size;
            self.list_remove(next);
            self.queue_remove(next);
            self.release_slot(next);
            self.seg_mut(id).size += absorbed;
        }

        if let Some(prev) = self.seg(id).prev
            && self.seg(prev).kind == SegmentKind::Free
        {
            let Segment { base, size, .. } = *self.seg(prev);
            self.list_remove(prev);
            self.queue_remove(prev);
            self.release_slot(prev);
            let seg = self.seg_mut(id);
            seg.base = base;
            seg.size += size;
        }

        let seg = *self.seg(id);
        if let Some(span) = seg.prev
            && self.seg(span).kind == SegmentKind::Span
            && self.seg(span).imported
            && self.seg(span).size == seg.size
        {
            self.return_span(span, id);
            return Ok(());
        }

        self.freelist_insert(id);
        Ok(())
    }

    /// Size of the allocation starting at `addr`, if there is one.
    #[must_use]
    pub fn allocation_size(&self, addr: u64) -> Option<u64> {
        self.list_iter(self.heads.hash[self.hash_bucket(addr)])
            .map(|id| self.seg(id))
            .find(|seg| seg.base == addr)
            .map(|seg| seg.size)
    }

    /// `(base, size, kind)` of every segment in address order.
    pub fn segments(&self) -> impl Iterator<Item = (u64, u64, SegmentKind)> + '_ {
        self.queue_iter().map(|id| {
            let seg = self.seg(id);
            (seg.base, seg.size, seg.kind)
        })
    }

    pub fn dump(&self) {
        debug!("arena {}: {:?}", self.name, self.stats);
        for (base, size, kind) in self.segments() {
            debug!("  {kind:?}\t{base:#x}..{:#x}", base + size);
        }
    }

    fn check_range(&self, base: u64, size: u64) -> Result<(), ArenaError> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(ArenaError::InvalidParameters("empty or overflowing range"));
        }
        if base % self.quantum != 0 || size % self.quantum != 0 {
            return Err(ArenaError::InvalidParameters("range is not quantum aligned"));
        }
        Ok(())
    }

    fn find(&self, size: u64, policy: AllocPolicy) -> Option<(SegId, u64)> {
        let id = match policy {
            AllocPolicy::InstantFit => self.find_instant(size),
            AllocPolicy::BestFit => self.find_best(size),
            AllocPolicy::NextFit => return self.find_next(size),
        }?;
        Some((id, self.seg(id).base))
    }

    fn find_instant(&self, size: u64) -> Option<SegId> {
        let own = freelist_index(size);
        let start = if size.is_power_of_two() { own } else { own + 1 };
        (start..FREELISTS)
            .find_map(|i| self.heads.freelists[i])
            .or_else(|| {
                self.list_iter(self.heads.freelists[own])
                    .find(|&id| self.seg(id).size >= size)
            })
    }

    fn find_best(&self, size: u64) -> Option<SegId> {
        (freelist_index(size)..FREELISTS).find_map(|i| {
            self.list_iter(self.heads.freelists[i])
                .filter(|&id| self.seg(id).size >= size)
                .min_by_key(|&id| (self.seg(id).size, self.seg(id).base))
        })
    }

    fn find_next(&self, size: u64) -> Option<(SegId, u64)> {
        let cursor = self.cursor;
        let after_cursor = self.queue_iter().find_map(|id| {
            let seg = self.seg(id);
            if seg.kind != SegmentKind::Free || seg.end() <= cursor {
                return None;
            }
            let start = seg.base.max(cursor);
            (seg.end() - start >= size).then_some((id, start))
        });

        after_cursor.or_else(|| {
            self.queue_iter().find_map(|id| {
                let seg = self.seg(id);
                (seg.kind == SegmentKind::Free && seg.size >= size).then_some((id, seg.base))
            })
        })
    }

    /// Turn `[addr, addr + size)` of free segment `id` into an allocation.
    fn carve(&mut self, id: SegId, addr: u64, size: u64) {
        self.list_remove(id);
        let Segment { base, .. } = *self.seg(id);
        let end = self.seg(id).end();

        if addr > base {
            let lead = self.take_slot();
            *self.seg_mut(lead) = Segment {
                base,
                size: addr - base,
                ..Segment::EMPTY
            };
            self.queue_insert_before(Some(id), lead);
            self.freelist_insert(lead);
        }

        if addr + size < end {
            let tail = self.take_slot();
            *self.seg_mut(tail) = Segment {
                base: addr + size,
                size: end - addr - size,
                ..Segment::EMPTY
            };
            let next = self.seg(id).next;
            self.queue_insert_before(next, tail);
            self.freelist_insert(tail);
        }

        let seg = self.seg_mut(id);
        seg.kind = SegmentKind::Allocated;
        seg.base = addr;
        seg.size = size;
        let bucket = self.hash_bucket(addr);
        self.list_push(List::Hash(bucket), id);

        self.stats.in_use += size;
        self.stats.allocs += 1;
    }

    fn import(&mut self, size: u64) -> Result<(), ArenaError> {
        let Some(source) = self.source.clone() else {
            return Err(ArenaError::OutOfMemory);
        };

        let span = size.max(IMPORT_QUANTA * self.quantum);
        let base = source.import(span)?;
        self.insert_span(base, span, true);
        self.stats.imported += span;
        debug!("arena {}: imported {base:#x}+{span:#x}", self.name);
        Ok(())
    }

    fn insert_span(&mut self, base: u64, size: u64, imported: bool) {
        let at = self.queue_iter().find(|&id| self.seg(id).base >= base);

        let marker = self.take_slot();
        *self.seg_mut(marker) = Segment {
            kind: SegmentKind::Span,
            imported,
            base,
            size,
            ..Segment::EMPTY
        };
        self.queue_insert_before(at, marker);
        self.list_push(List::Spans, marker);

        let free = self.take_slot();
        *self.seg_mut(free) = Segment {
            imported,
            base,
            size,
            ..Segment::EMPTY
        };
        self.queue_insert_before(at, free);
        self.freelist_insert(free);

        self.stats.total += size;
    }

    /// Drop an entirely free imported span and hand it back to the source.
    fn return_span(&mut self, span: SegId, free: SegId) {
        let Segment { base, size, .. } = *self.seg(span);

        self.queue_remove(free);
        self.release_slot(free);
        self.list_remove(span);
        self.queue_remove(span);
        self.release_slot(span);

        self.stats.imported -= size;
        self.stats.total -= size;
        debug!("arena {}: returning {base:#x}+{size:#x}", self.name);

        if let Some(source) = &self.source {
            source.export(base, size);
        }
    }

    fn reserve_slots(&mut self, needed: usize, bootstrap: bool) -> Result<(), ArenaError> {
        if bootstrap {
            return if self.spare_count >= needed {
                Ok(())
            } else {
                Err(ArenaError::OutOfMemory)
            };
        }

        let wanted = needed + MIN_SPARE;
        if self.spare_count >= wanted {
            return Ok(());
        }

        let grow = wanted - self.spare_count;
        self.extra
            .try_reserve(grow)
            .map_err(|_| ArenaError::OutOfMemory)?;
        for _ in 0..grow {
            let id = u32::try_from(BOOTSTRAP_SLOTS + self.extra.len())
                .map_err(|_| ArenaError::OutOfMemory)?;
            self.extra.push(Segment::EMPTY);
            self.release_slot(SegId(id));
        }
        Ok(())
    }

    fn take_slot(&mut self) -> SegId {
        let Some(id) = self.heads.spare else {
            panic!("arena {}: out of segment slots", self.name);
        };
        self.list_remove(id);
        self.spare_count -= 1;
        id
    }

    fn release_slot(&mut self, id: SegId) {
        *self.seg_mut(id) = Segment::EMPTY;
        self.list_push(List::Spare, id);
        self.spare_count += 1;
    }

    fn seg(&self, id: SegId) -> &Segment {
        let i = id.0 as usize;
        if i < BOOTSTRAP_SLOTS {
            &self.boot[i]
        } else {
            &self.extra[i - BOOTSTRAP_SLOTS]
        }
    }

    fn seg_mut(&mut self, id: SegId) -> &mut Segment {
        let i = id.0 as usize;
        if i < BOOTSTRAP_SLOTS {
            &mut self.boot[i]
        } else {
            &mut self.extra[i - BOOTSTRAP_SLOTS]
        }
    }

    fn hash_bucket(&self, addr: u64) -> usize {
        ((addr / self.quantum).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 60) as usize
    }

    fn freelist_insert(&mut self, id: SegId) {
        let index = freelist_index(self.seg(id).size);
        self.list_push(List::Free(index), id);
    }

    const fn head_mut(&mut self, list: List) -> &mut Link {
        match list {
            List::Free(i) => &mut self.heads.freelists[i],
            List::Hash(i) => &mut self.heads.hash[i],
            List::Spans => &mut self.heads.spans,
            List::Spare => &mut self.heads.spare,
        }
    }

    fn list_iter(&self, head: Link) -> impl Iterator<Item = SegId> + '_ {
        successors(head, |&id| self.seg(id).list_next)
    }

    fn list_push(&mut self, list: List, id: SegId) {
        let head = *self.head_mut(list);
        if let Some(old) = head {
            self.seg_mut(old).list_prev = Some(id);
        }
        let seg = self.seg_mut(id);
        seg.list = Some(list);
        seg.list_prev = None;
        seg.list_next = head;
        *self.head_mut(list) = Some(id);
    }

    fn list_remove(&mut self, id: SegId) {
        let Segment {
            list,
            list_prev,
            list_next,
            ..
        } = *self.seg(id);
        let Some(list) = list else {
            return;
        };

        match list_prev {
            Some(prev) => self.seg_mut(prev).list_next = list_next,
            None => *self.head_mut(list) = list_next,
        }
        if let Some(next) = list_next {
            self.seg_mut(next).list_prev = list_prev;
        }

        let seg = self.seg_mut(id);
        seg.list = None;
        seg.list_prev = None;
        seg.list_next = None;
    }

    fn queue_iter(&self) -> impl Iterator<Item = SegId> + '_ {
        successors(self.queue_head, |&id| self.seg(id).next)
    }

    /// Insert `id` in front of `at`, or at the tail if `at` is `None`.
    fn queue_insert_before(&mut self, at: Link, id: SegId) {
        let prev = match at {
            Some(at) => self.seg(at).prev,
            None => self.queue_tail,
        };

        let seg = self.seg_mut(id);
        seg.prev = prev;
        seg.next = at;

        match prev {
            Some(prev) => self.seg_mut(prev).next = Some(id),
            None => self.queue_head = Some(id),
        }
        match at {
            Some(at) => self.seg_mut(at).prev = Some(id),
            None => self.queue_tail = Some(id),
        }
    }

    fn queue_remove(&mut self, id: SegId) {
        let Segment { prev, next, .. } = *self.seg(id);
        match prev {
            Some(prev) => self.seg_mut(prev).next = next,
            None => self.queue_head = next,
        }
        match next {
            Some(next) => self.seg_mut(next).prev = prev,
            None => self.queue_tail = prev,
        }
        let seg = self.seg_mut(id);
        seg.prev = None;
        seg.next = None;
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("quantum", &self.quantum)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.stats.in_use != 0 {
            warn!(
                "arena {}: dropped with {:#x} bytes in use",
                self.name, self.stats.in_use
            );
        }

        let Some(source) = &self.source else {
            return;
        };
        for id in self.list_iter(self.heads.spans) {
            let span = self.seg(id);
            if span.imported {
                source.export(span.base, span.size);
            }
        }
    }
}

/// An [`Arena`] behind a spin lock, usable as a [`SpanSource`].
pub struct LockedArena {
    inner: Mutex<Arena>,
}

impl LockedArena {
    #[must_use]
    pub const fn new(arena: Arena) -> Self {
        Self {
            inner: Mutex::new(arena),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Arena> {
        self.inner.lock()
    }

    /// See [`Arena::alloc`].
    ///
    /// # Errors
    /// As for [`Arena::alloc`].
    pub fn alloc(&self, size: u64, flags: AllocFlags) -> Result<u64, ArenaError> {
        self.inner.lock().alloc(size, flags)
    }

    /// See [`Arena::alloc_at`].
    ///
    /// # Errors
    /// As for [`Arena::alloc_at`].
    pub fn alloc_at(&self, addr: u64, size: u64, bootstrap: bool) -> Result<u64, ArenaError> {
        self.inner.lock().alloc_at(addr, size, bootstrap)
    }

    /// See [`Arena::free`].
    ///
    /// # Errors
    /// As for [`Arena::free`].
    pub fn free(&self, addr: u64, size: u64) -> Result<(), ArenaError> {
        self.inner.lock().free(addr, size)
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        self.inner.lock().stats()
    }
}

impl fmt::Debug for LockedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner.lock(), f)
    }
}

impl SpanSource for LockedArena {
    fn import(&self, size: u64) -> Result<u64, ArenaError> {
        self.alloc(size, AllocFlags::INSTANT_FIT.bootstrap())
    }

    fn export(&self, base: u64, size: u64) {
        if let Err(e) = self.free(base, size) {
            warn!("arena {}: failed to take back {base:#x}+{size:#x}: {e}", self.inner.lock().name);
        }
    }
}

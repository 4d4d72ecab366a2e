//! # Kernel Memory Allocation
//!
//! The two allocators everything else in the virtual memory subsystem draws
//! from:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Resource Arena (vmem)                  │
//! │    • address ranges in quantum units                │
//! │    • instant-fit / best-fit / next-fit              │
//! │    • imports spans from a parent arena              │
//! └─────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────┐
//! │           Physical Page Allocator                   │
//! │    • built from the boot memory map                 │
//! │    • freelist threaded through free RAM             │
//! │    • single 4 KiB pages, optionally zeroed          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The arena never touches the memory it hands out; it only does the
//! bookkeeping for an abstract integer range. The physical allocator stores
//! its freelist inside the free pages themselves and reaches them through a
//! [`DirectMap`](kernel_vmem::DirectMap).
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::arena::{AllocFlags, Arena};
//!
//! let mut arena = Arena::new("ids", 0x1000, 0x10_000, 0x1000, None).unwrap();
//! let a = arena.alloc(0x2000, AllocFlags::INSTANT_FIT).unwrap();
//! arena.free(a, 0x2000).unwrap();
//! assert_eq!(arena.stats().in_use, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arena;
mod free_list;
pub mod phys;

pub use crate::arena::{
    AllocFlags, AllocPolicy, Arena, ArenaError, ArenaStats, LockedArena, SegmentKind, SpanSource,
};
pub use crate::phys::{Frame, KindPages, OutOfMemory, PhysicalPageAllocator};

//! # Virtual Memory
//!
//! Address spaces, copy-on-write memory objects and demand paging on top of
//! the allocators in `kernel-alloc` and the page tables in `kernel-vmem`.
//!
//! ```text
//!  AddressSpace ──entries──► MemoryObject ──AnonMap──► Anon ──► physical page
//!       │                        │  ▲
//!       │                        └──┘ weak parent (forked objects)
//!       └──► Pagemap (user tree, kernel half shared)
//! ```
//!
//! - [`Vm`] builds everything at boot and hands out eagerly backed kernel
//!   pages.
//! - [`AddressSpace`] is what tasks own: `map`, `unmap`, `fault`, `copy`.
//! - [`dispatch_fault`] turns a page fault into a verdict for the interrupt
//!   layer.
//!
//! Lock order: address space, child object map, parent object map, anon,
//! pagemap, physical allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod anon;
mod error;
pub mod fault;
pub mod kernel;
pub mod object;
pub mod space;

pub use crate::anon::{Anon, AnonLock, AnonMap};
pub use crate::error::VmError;
pub use crate::fault::{FaultFlags, FaultResolution, dispatch_fault};
pub use crate::kernel::{Vm, VmConfig};
pub use crate::object::MemoryObject;
pub use crate::space::AddressSpace;

/// The page table type every address space uses.
pub type Pagemap = kernel_vmem::Pagemap<kernel_alloc::PhysicalPageAllocator>;

//! # Kernel Memory Layout and Boot Inputs
//!
//! This crate is the single source of truth for the virtual address layout
//! the memory subsystem builds, and for the data the boot layer hands over
//! before any of it is initialized.
//!
//! ## Overview
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`memory`] | Layout constants: direct map base, kernel image base, user and kernel heap windows. |
//! | [`boot`] | The physical memory map ([`MemoryRegion`](boot::MemoryRegion)) and the kernel image sections ([`KernelImage`](boot::KernelImage)). |
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │          (unmapped)             │
//! USER_ARENA_BASE       ├─────────────────────────────────┤ 0x0000_0800_0000_0000
//!                       │   User arena (demand paged)     │
//!                       │      USER_ARENA_SIZE            │
//!                       ├─────────────────────────────────┤
//!                       │          (unmapped)             │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  non-canonical / guard region   │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Direct map of physical memory │
//!                       │   [0, max(4 GiB, top of RAM))   │
//!                       ├─────────────────────────────────┤
//!                       │   Kernel heap window            │
//!                       │      KERNEL_HEAP_SIZE           │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The upper half (PML4 slots 256..512) is shared by every address space;
//! the lower half is private to a task.
//!
//! ## Boot Inputs
//!
//! The bootloader supplies, once and before the memory subsystem starts:
//! * an ordered list of `{base, size, kind}` regions, and
//! * the kernel image's virtual/physical load bases and section boundaries.
//!
//! Both are plain data; nothing in this crate touches hardware.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;

//! A small machine for the integration tests: host memory standing in for
//! physical RAM, and a [`Vm`] booted on top of it.

#![allow(dead_code)]

use kernel_info::boot::{KernelImage, MemoryKind, MemoryRegion};
use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vm::{Vm, VmConfig};
use kernel_vmem::{DirectMap, LeafSize};

pub const RAM_BASE: u64 = 0x0100_0000;

#[repr(C, align(4096))]
#[derive(Clone)]
pub struct Aligned4K([u8; 4096]);

pub struct Machine {
    // Declared first so it is dropped before the memory it lives in.
    pub vm: Vm,
    ram: Vec<Aligned4K>,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_pages(1024)
    }

    pub fn with_pages(pages: usize) -> Self {
        let ram = vec![Aligned4K([0; 4096]); pages];
        let mapper = DirectMap::new((ram.as_ptr() as u64).wrapping_sub(RAM_BASE));
        let regions = [MemoryRegion::new(
            RAM_BASE,
            pages as u64 * PAGE_SIZE,
            MemoryKind::Free,
        )];
        let config = VmConfig::new()
            .with_direct_map_leaf(LeafSize::Huge)
            .with_activate(false);

        let vm = unsafe { Vm::new(config, mapper, &regions, &image()) }.expect("vm");
        Self { vm, ram }
    }

    pub fn free_pages(&self) -> u64 {
        self.vm.phys().usable_pages()
    }

    /// Contents of the physical page at `pa`.
    pub fn page(&self, pa: PhysicalAddress) -> &[u8] {
        let offset = (pa.as_u64() - RAM_BASE) as usize;
        let page = &self.ram[offset / 4096];
        &page.0[..]
    }
}

pub fn image() -> KernelImage {
    KernelImage {
        virtual_base: KERNEL_BASE,
        physical_base: PHYS_LOAD,
        text: KERNEL_BASE..KERNEL_BASE + 0x3000,
        rodata: KERNEL_BASE + 0x3000..KERNEL_BASE + 0x4800,
        data: KERNEL_BASE + 0x5000..KERNEL_BASE + 0x8000,
    }
}

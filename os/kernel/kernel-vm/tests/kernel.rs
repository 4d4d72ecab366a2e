mod common;

use common::{Machine, RAM_BASE};
use kernel_info::memory::{HHDM_BASE, kernel_heap_base};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vm::{AddressSpace, FaultFlags, FaultResolution, VmError, dispatch_fault};
use kernel_vmem::{LeafSize, Prot};

#[test]
fn boot_builds_the_kernel_map() {
    let machine = Machine::new();
    let pagemap = machine.vm.kernel_pagemap();

    let direct = pagemap
        .get_mapping(VirtualAddress::new(HHDM_BASE + RAM_BASE))
        .expect("direct map");
    assert_eq!(direct.size, LeafSize::Huge);
    assert_eq!(direct.translate(VirtualAddress::new(HHDM_BASE + RAM_BASE)).as_u64(), RAM_BASE);

    assert!(machine.vm.kernel_space().entries().is_empty());
    assert!(!machine.vm.kernel_space().is_user());
}

#[test]
fn kernel_pages_are_mapped_and_zeroed() {
    let machine = Machine::new();
    let free = machine.free_pages();

    let base = machine.vm.kernel_alloc(3, false).expect("alloc");
    assert!(base.as_u64() >= kernel_heap_base(machine.vm.phys().highest_mappable_address()));
    assert_eq!(machine.vm.heap_stats().in_use, 3 * PAGE_SIZE);

    for i in 0..3 {
        let mapping = machine
            .vm
            .kernel_pagemap()
            .get_mapping(base + i * PAGE_SIZE)
            .expect("mapping");
        assert_eq!(mapping.prot, Prot::READ | Prot::WRITE);
        assert!(!mapping.user);
        assert!(machine.page(mapping.base).iter().all(|&b| b == 0));
        assert!(!machine.vm.phys().is_free(mapping.base));
    }

    machine.vm.kernel_free(base, 3).expect("free");
    assert_eq!(machine.vm.heap_stats().in_use, 0);
    assert_eq!(machine.free_pages(), free);
}

#[test]
fn freed_kernel_pages_are_poisoned() {
    let machine = Machine::new();
    let base = machine.vm.kernel_alloc(1, false).expect("alloc");
    let page = machine
        .vm
        .kernel_pagemap()
        .get_mapping(base)
        .expect("mapping")
        .base;

    machine.vm.kernel_free(base, 1).expect("free");
    assert!(machine.vm.phys().is_free(page));
    assert!(machine.vm.kernel_pagemap().get_mapping(base).is_err());
    // The freelist keeps its bookkeeping at the start of the page.
    assert!(machine.page(page)[64..].iter().all(|&b| b == 0xcc));
}

#[test]
fn bad_kernel_frees_are_reported() {
    let machine = Machine::new();
    let base = machine.vm.kernel_alloc(2, false).expect("alloc");

    assert_eq!(
        machine.vm.kernel_free(base + PAGE_SIZE, 1),
        Err(VmError::NotFound)
    );
    assert!(matches!(
        machine.vm.kernel_free(base, 1),
        Err(VmError::InvalidParameters(_))
    ));
    assert!(machine.vm.kernel_pagemap().get_mapping(base).is_ok());

    assert_eq!(machine.vm.kernel_free(base, 2), Ok(()));
    assert_eq!(machine.vm.kernel_free(base, 2), Err(VmError::NotFound));
}

#[test]
fn bootstrap_allocations_succeed() {
    let machine = Machine::new();
    let a = machine.vm.kernel_alloc(1, true).expect("alloc");
    let b = machine.vm.kernel_alloc(1, true).expect("alloc");
    assert_ne!(a, b);
    machine.vm.kernel_free(a, 1).expect("free");
    machine.vm.kernel_free(b, 1).expect("free");
}

#[test]
fn failed_kernel_allocations_roll_back() {
    let machine = Machine::with_pages(320);
    let free = machine.free_pages();
    assert!(free < 128);

    assert_eq!(machine.vm.kernel_alloc(128, false), Err(VmError::OutOfMemory));
    assert_eq!(machine.free_pages(), free);
    assert_eq!(machine.vm.heap_stats().in_use, 0);
    assert_eq!(
        machine.vm.kernel_alloc(0, false),
        Err(VmError::InvalidParameters("zero-page allocation"))
    );
}

#[test]
fn physical_ranges_map_without_owning_pages() {
    let machine = Machine::new();
    let phys = machine.vm.phys();
    let low = PhysicalAddress::new(RAM_BASE);
    assert!(phys.is_free(low));
    let free = machine.free_pages();

    let base = machine.vm.kernel_alloc_at_phys(2, low).expect("map");
    let mapping = machine
        .vm
        .kernel_pagemap()
        .get_mapping(base + PAGE_SIZE)
        .expect("mapping");
    assert_eq!(mapping.base, low + PAGE_SIZE);

    machine.vm.kernel_unmap_phys(base, 2).expect("unmap");
    assert!(machine.vm.kernel_pagemap().get_mapping(base).is_err());
    assert!(phys.is_free(low));
    assert_eq!(machine.free_pages(), free);

    assert!(matches!(
        machine
            .vm
            .kernel_alloc_at_phys(1, PhysicalAddress::new(RAM_BASE + 0x10)),
        Err(VmError::InvalidParameters(_))
    ));
}

#[test]
fn faults_are_dispatched_by_origin() {
    let machine = Machine::new();
    let task = AddressSpace::new(&machine.vm, "task", true).expect("space");
    let base = task
        .new_anon(None, 4096, Prot::READ | Prot::WRITE)
        .expect("map");

    assert_eq!(
        dispatch_fault(&task, base, FaultFlags::WRITE | FaultFlags::USER),
        FaultResolution::Resolved
    );

    let stray = base + 0x10_0000;
    let flags = FaultFlags::USER;
    assert_eq!(
        dispatch_fault(&task, stray, flags),
        FaultResolution::KillTask {
            address: stray,
            flags
        }
    );

    let kernel = machine.vm.kernel_space();
    let wild = VirtualAddress::new(0xffff_c000_0000_0000);
    assert!(matches!(
        dispatch_fault(kernel, wild, FaultFlags::WRITE),
        FaultResolution::Panic { address, .. } if address == wild
    ));
}

#[test]
fn fixed_kernel_mappings_cannot_take_heap_pages() {
    let machine = Machine::new();
    let va = machine.vm.kernel_alloc(1, false).expect("alloc");
    let page = machine
        .vm
        .kernel_pagemap()
        .get_mapping(va)
        .expect("mapping")
        .base;

    let kernel = machine.vm.kernel_space();
    assert!(matches!(
        kernel.new_anon(Some(va), 4096, Prot::READ | Prot::WRITE),
        Err(VmError::InvalidParameters(_))
    ));
    assert!(kernel.entries().is_empty());
    assert!(!kernel.fault(va, FaultFlags::WRITE));
    assert_eq!(
        machine
            .vm
            .kernel_pagemap()
            .get_mapping(va)
            .expect("mapping")
            .base,
        page
    );

    // The direct map is not free address space either.
    assert!(matches!(
        kernel.new_anon(
            Some(VirtualAddress::new(HHDM_BASE + RAM_BASE)),
            4096,
            Prot::READ
        ),
        Err(VmError::InvalidParameters(_))
    ));

    machine.vm.kernel_free(va, 1).expect("free");
    assert!(machine.vm.phys().is_free(page));
}

#[test]
fn fixed_kernel_mappings_claim_their_range() {
    let machine = Machine::new();
    let heap_base = kernel_heap_base(machine.vm.phys().highest_mappable_address());
    let fixed = VirtualAddress::new(heap_base + 0x10_0000);
    let rw = Prot::READ | Prot::WRITE;

    let kernel = machine.vm.kernel_space();
    assert_eq!(kernel.new_anon(Some(fixed), 2 * PAGE_SIZE, rw), Ok(fixed));
    assert_eq!(
        machine.vm.kernel_va().lock().allocation_size(fixed.as_u64()),
        Some(2 * PAGE_SIZE)
    );

    // Another kernel-mode space shares the pagemap and must not get it too.
    let driver = AddressSpace::new(&machine.vm, "driver", false).expect("space");
    assert!(matches!(
        driver.new_anon(Some(fixed + PAGE_SIZE), PAGE_SIZE, rw),
        Err(VmError::InvalidParameters(_))
    ));

    assert!(kernel.fault(fixed, FaultFlags::WRITE));
    kernel.unmap(fixed, 2 * PAGE_SIZE).expect("unmap");
    assert_eq!(
        machine.vm.kernel_va().lock().allocation_size(fixed.as_u64()),
        None
    );
    assert_eq!(driver.new_anon(Some(fixed), PAGE_SIZE, rw), Ok(fixed));
}

#[test]
fn physical_mappings_and_heap_pages_are_released_separately() {
    let machine = Machine::new();
    let phys = machine.vm.phys();
    let page = phys.alloc(true).expect("page");

    let device = machine.vm.kernel_alloc_at_phys(1, page).expect("map");
    assert_eq!(machine.vm.kernel_free(device, 1), Err(VmError::NotFound));
    assert!(!phys.is_free(page));
    assert!(machine.vm.kernel_pagemap().get_mapping(device).is_ok());

    let heap = machine.vm.kernel_alloc(1, false).expect("alloc");
    assert_eq!(machine.vm.kernel_unmap_phys(heap, 1), Err(VmError::NotFound));
    assert!(machine.vm.kernel_pagemap().get_mapping(heap).is_ok());

    machine.vm.kernel_unmap_phys(device, 1).expect("unmap");
    assert!(!phys.is_free(page));
    assert!(machine.page(page).iter().all(|&b| b == 0));

    machine.vm.kernel_free(heap, 1).expect("free");
    phys.free(page);
}

use super::*;
use crate::pagemap::PagemapKind;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::boot::KernelImage;
use kernel_info::memory::{HHDM_BASE, KERNEL_BASE, PHYS_LOAD};
use spin::Mutex;

const RAM_BASE: u64 = 0x0100_0000;

#[repr(C, align(4096))]
#[derive(Clone)]
struct Aligned4K([u8; 4096]);

/// Host buffer standing in for physical RAM at `RAM_BASE`.
struct TestFrames {
    ram: Vec<Aligned4K>,
    free: Mutex<Vec<u64>>,
}

impl TestFrames {
    fn with_frames(n: usize) -> Arc<Self> {
        let ram = vec![Aligned4K([0; 4096]); n];
        let free = (0..n as u64).rev().map(|i| RAM_BASE + i * 4096).collect();
        Arc::new(Self {
            ram,
            free: Mutex::new(free),
        })
    }

    fn mapper(&self) -> DirectMap {
        DirectMap::new((self.ram.as_ptr() as u64).wrapping_sub(RAM_BASE))
    }

    fn outstanding(&self) -> usize {
        self.ram.len() - self.free.lock().len()
    }
}

impl FrameAlloc for TestFrames {
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        let pa = PhysicalAddress::new(self.free.lock().pop()?);
        unsafe { self.mapper().fill_page(pa, 0) };
        Some(pa)
    }

    fn free_4k(&self, pa: PhysicalAddress) {
        let mut free = self.free.lock();
        assert!(!free.contains(&pa.as_u64()), "double free of {pa}");
        free.push(pa.as_u64());
    }
}

fn bare(frames: &Arc<TestFrames>) -> Pagemap<TestFrames> {
    Pagemap::empty(Arc::clone(frames), frames.mapper(), PagemapKind::User, None)
        .expect("root")
}

fn image() -> KernelImage {
    KernelImage {
        virtual_base: KERNEL_BASE,
        physical_base: PHYS_LOAD,
        text: KERNEL_BASE..KERNEL_BASE + 0x3000,
        rodata: KERNEL_BASE + 0x3000..KERNEL_BASE + 0x4800,
        data: KERNEL_BASE + 0x5000..KERNEL_BASE + 0x8000,
    }
}

fn kernel(frames: &Arc<TestFrames>, leaf: LeafSize) -> Arc<Pagemap<TestFrames>> {
    let image = image();
    let layout = KernelLayout {
        image: &image,
        direct_map_base: HHDM_BASE,
        direct_map_end: RAM_BASE + (frames.ram.len() as u64) * 4096,
        direct_map_leaf: leaf,
    };
    Arc::new(Pagemap::new_kernel(Arc::clone(frames), frames.mapper(), &layout).expect("kernel"))
}

#[test]
fn map_normal_creates_tables_and_leaf() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_4000_0000_1000);
    let pa = PhysicalAddress::new(0x0000_0000_0020_0000);

    pm.map(va, pa, Prot::READ | Prot::WRITE, MapFlags::USER)
        .expect("map");
    // root + PDPT + PD + PT
    assert_eq!(frames.outstanding(), 4);

    let m = pm.get_mapping(va).expect("mapping");
    assert_eq!(m.base, pa);
    assert_eq!(m.prot, Prot::READ | Prot::WRITE);
    assert_eq!(m.size, LeafSize::Normal);
    assert!(m.user);
    assert_eq!(m.translate(va + 0x123), pa + 0x123);
}

#[test]
fn unmap_prunes_empty_tables() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_4000_0000_1000);
    let other = VirtualAddress::new(0x0000_4000_0000_2000);

    pm.map(va, PhysicalAddress::new(0x20_0000), Prot::READ, MapFlags::USER)
        .expect("map");
    pm.map(other, PhysicalAddress::new(0x20_1000), Prot::READ, MapFlags::USER)
        .expect("map");
    assert_eq!(frames.outstanding(), 4);

    let removed = pm.unmap(va).expect("unmap");
    assert_eq!(removed.base, PhysicalAddress::new(0x20_0000));
    // The PT still holds `other`.
    assert_eq!(frames.outstanding(), 4);
    assert_eq!(pm.get_mapping(va), Err(PagemapError::NotFound));

    pm.unmap(other).expect("unmap");
    assert_eq!(frames.outstanding(), 1);
    assert_eq!(pm.get_mapping(other), Err(PagemapError::NotADirectory));
}

#[test]
fn query_distinguishes_missing_level_from_missing_leaf() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_0800_0000_0000);
    pm.map(va, PhysicalAddress::new(0x30_0000), Prot::READ, MapFlags::USER)
        .expect("map");

    assert_eq!(pm.get_mapping(va + 0x1000), Err(PagemapError::NotFound));
    assert_eq!(
        pm.get_mapping(VirtualAddress::new(0x0000_1000_0000_0000)),
        Err(PagemapError::NotADirectory)
    );
    assert_eq!(pm.unmap(va + 0x1000), Err(PagemapError::NotFound));
}

#[test]
fn large_leaf_is_found_at_its_level() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    let pa = PhysicalAddress::new(0x0400_0000);

    pm.map(va, pa, Prot::READ | Prot::WRITE, MapFlags::LARGE)
        .expect("map");
    // root + PDPT + PD, no PT.
    assert_eq!(frames.outstanding(), 3);

    let m = pm.get_mapping(va + 0x5123).expect("mapping");
    assert_eq!(m.size, LeafSize::Large);
    assert_eq!(m.translate(va + 0x5123), pa + 0x5123);

    let removed = pm.unmap(va + 0x5000).expect("unmap");
    assert_eq!(removed.size, LeafSize::Large);
    assert_eq!(frames.outstanding(), 1);
}

#[test]
fn huge_leaf_over_table_frees_subtree() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_0040_0000_0000);

    pm.map(va + 0x1000, PhysicalAddress::new(0x20_0000), Prot::READ, MapFlags::NONE)
        .expect("map");
    assert_eq!(frames.outstanding(), 4);

    pm.map(va, PhysicalAddress::new(0x4000_0000), Prot::READ, MapFlags::HUGE)
        .expect("map huge");
    // PD and PT are gone.
    assert_eq!(frames.outstanding(), 2);
    assert_eq!(
        pm.get_mapping(va + 0x1000).expect("mapping").size,
        LeafSize::Huge
    );
}

#[test]
fn normal_leaf_below_large_leaf_is_rejected() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_4000_0020_0000);
    pm.map(va, PhysicalAddress::new(0x0400_0000), Prot::READ, MapFlags::LARGE)
        .expect("map");

    assert!(matches!(
        pm.map(va + 0x1000, PhysicalAddress::new(0x1000), Prot::READ, MapFlags::NONE),
        Err(PagemapError::InvalidParameters(_))
    ));
}

#[test]
fn misaligned_map_is_rejected() {
    let frames = TestFrames::with_frames(4);
    let pm = bare(&frames);
    assert!(matches!(
        pm.map(
            VirtualAddress::new(0x1000),
            PhysicalAddress::new(0x20_0000),
            Prot::READ,
            MapFlags::LARGE
        ),
        Err(PagemapError::InvalidParameters(_))
    ));
    assert_eq!(frames.outstanding(), 1);
}

#[test]
fn remap_changes_protection_in_place() {
    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_0800_0000_3000);
    let pa = PhysicalAddress::new(0x0123_4000);
    pm.map(va, pa, Prot::ALL, MapFlags::USER).expect("map");

    pm.remap(va, Prot::READ | Prot::EXECUTE, MapFlags::USER)
        .expect("remap");
    let m = pm.get_mapping(va).expect("mapping");
    assert_eq!(m.base, pa);
    assert_eq!(m.prot, Prot::READ | Prot::EXECUTE);
    assert_eq!(frames.outstanding(), 4);

    assert_eq!(
        pm.remap(va + 0x1000, Prot::READ, MapFlags::USER),
        Err(PagemapError::NotFound)
    );
}

/// Collects warnings so tests can check what a call reported.
struct WarningLog(Mutex<Vec<String>>);

static WARNINGS: WarningLog = WarningLog(Mutex::new(Vec::new()));

impl log::Log for WarningLog {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            self.0.lock().push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

fn warnings_about(va: VirtualAddress) -> usize {
    // Another test may have installed it first; either way it is ours.
    let _ = log::set_logger(&WARNINGS);
    log::set_max_level(log::LevelFilter::Warn);

    let needle = format!("{va} now maps");
    WARNINGS
        .0
        .lock()
        .iter()
        .filter(|message| message.contains(&needle))
        .count()
}

#[test]
fn replacing_a_leaf_with_another_page_warns() {
    assert_eq!(warnings_about(VirtualAddress::zero()), 0);

    let frames = TestFrames::with_frames(16);
    let pm = bare(&frames);
    let va = VirtualAddress::new(0x0000_0900_0000_5000);
    let pa = PhysicalAddress::new(0x0123_4000);

    pm.map(va, pa, Prot::READ, MapFlags::USER).expect("map");
    pm.map(va, pa, Prot::READ | Prot::WRITE, MapFlags::USER)
        .expect("map");
    assert_eq!(warnings_about(va), 0);

    pm.map(va, PhysicalAddress::new(0x0567_8000), Prot::READ, MapFlags::USER)
        .expect("map");
    assert_eq!(warnings_about(va), 1);

    pm.replace(va, PhysicalAddress::new(0x0789_a000), Prot::READ, MapFlags::USER)
        .expect("replace");
    assert_eq!(warnings_about(va), 1);
    assert_eq!(pm.get_mapping(va).expect("mapping").base.as_u64(), 0x0789_a000);
    assert_eq!(frames.outstanding(), 4);
}

#[test]
fn kernel_tree_maps_image_and_direct_map() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Huge);
    // root + 256 PDPTs + PD + PT for the image.
    assert_eq!(frames.outstanding(), 259);

    let text = k.get_mapping(VirtualAddress::new(KERNEL_BASE + 0x1000)).expect("text");
    assert_eq!(text.prot, Prot::READ | Prot::EXECUTE);
    assert_eq!(text.base, PhysicalAddress::new(PHYS_LOAD + 0x1000));
    assert!(!text.user);

    let rodata = k.get_mapping(VirtualAddress::new(KERNEL_BASE + 0x4000)).expect("rodata");
    assert_eq!(rodata.prot, Prot::READ);

    let data = k.get_mapping(VirtualAddress::new(KERNEL_BASE + 0x7000)).expect("data");
    assert_eq!(data.prot, Prot::READ | Prot::WRITE);

    let gap = VirtualAddress::new(KERNEL_BASE + 0x9000);
    assert_eq!(k.get_mapping(gap), Err(PagemapError::NotFound));

    let dm = VirtualAddress::new(HHDM_BASE + 0x1234_5678);
    let m = k.get_mapping(dm).expect("direct map");
    assert_eq!(m.size, LeafSize::Huge);
    assert_eq!(m.translate(dm), PhysicalAddress::new(0x1234_5678));
    assert_eq!(
        k.get_mapping(VirtualAddress::new(HHDM_BASE + (4 << 30))),
        Err(PagemapError::NotADirectory)
    );
}

#[test]
fn kernel_tree_with_large_direct_map() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Large);
    // Four PDs cover 4 GiB of 2 MiB leaves.
    assert_eq!(frames.outstanding(), 263);

    let dm = VirtualAddress::new(HHDM_BASE + 0xFFFF_F123);
    let m = k.get_mapping(dm).expect("direct map");
    assert_eq!(m.size, LeafSize::Large);
    assert_eq!(m.translate(dm), PhysicalAddress::new(0xFFFF_F123));
}

#[test]
fn user_tree_shares_kernel_half() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Huge);
    let before = frames.outstanding();

    let user = Pagemap::new_user(&k).expect("user");
    assert_eq!(frames.outstanding(), before + 1);
    assert!(k.get_mapping(VirtualAddress::new(KERNEL_BASE)).is_ok());
    assert_eq!(
        user.get_mapping(VirtualAddress::new(KERNEL_BASE)),
        k.get_mapping(VirtualAddress::new(KERNEL_BASE))
    );

    // Added after the user tree was built, still visible through it.
    let heap = VirtualAddress::new(HHDM_BASE + (8 << 30));
    k.map(heap, PhysicalAddress::new(RAM_BASE), Prot::READ | Prot::WRITE, MapFlags::NONE)
        .expect("kernel map");
    assert_eq!(
        user.get_mapping(heap).expect("shared").base,
        PhysicalAddress::new(RAM_BASE)
    );

    assert!(matches!(
        user.map(heap + 0x1000, PhysicalAddress::new(RAM_BASE), Prot::READ, MapFlags::NONE),
        Err(PagemapError::InvalidParameters(_))
    ));

    let lower = VirtualAddress::new(0x0000_0800_0000_0000);
    user.map(lower, PhysicalAddress::new(RAM_BASE + 0x1000), Prot::READ, MapFlags::USER)
        .expect("user map");
    assert_eq!(k.get_mapping(lower), Err(PagemapError::NotADirectory));

    let with_heap_tables = frames.outstanding();
    user.destroy();
    // root + PDPT + PD + PT of the lower half
    assert_eq!(frames.outstanding(), with_heap_tables - 4);
}

#[test]
fn copy_only_shares_kernel_half() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Huge);
    let a = Pagemap::new_user(&k).expect("user");
    let b = Pagemap::new_user(&k).expect("user");

    assert!(matches!(a.copy(&a), Err(PagemapError::InvalidParameters(_))));
    assert!(matches!(a.copy(&k), Err(PagemapError::InvalidParameters(_))));

    a.map(
        VirtualAddress::new(0x0000_0800_0000_0000),
        PhysicalAddress::new(RAM_BASE),
        Prot::READ,
        MapFlags::USER,
    )
    .expect("map");
    assert_eq!(a.copy(&b), Err(PagemapError::NotImplemented));
}

#[test]
fn dropping_kernel_tree_returns_every_table() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Large);
    let user = Pagemap::new_user(&k).expect("user");
    drop(k);
    // The user tree keeps the kernel tree alive.
    assert!(frames.outstanding() > 0);
    drop(user);
    assert_eq!(frames.outstanding(), 0);
}

#[test]
fn activate_loads_root() {
    let frames = TestFrames::with_frames(512);
    let k = kernel(&frames, LeafSize::Huge);
    let user = Pagemap::new_user(&k).expect("user");

    user.activate();
    assert!(user.is_active());
    assert_eq!(arch::active_root(), user.root());
    k.activate();
    assert!(!user.is_active());
}

#[test]
fn entry_bits_round_trip_protection() {
    let e = PageEntryBits::leaf(
        PhysicalAddress::new(0x4000_0000),
        Prot::READ,
        MapFlags::NONE,
        LeafSize::Huge,
    );
    assert!(e.large_page());
    assert!(e.is_leaf_at(3));
    assert!(!e.is_leaf_at(4));
    assert_eq!(e.prot(), Prot::READ);
    assert!(!e.user_access());

    let t = PageEntryBits::table(PhysicalAddress::new(0x5000));
    assert!(t.present() && t.writable() && t.user_access());
    assert!(!t.is_leaf_at(2));
}

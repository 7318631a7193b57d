//! Kernel boot path.
//!
//! Parses the Multiboot2 boot information, brings up the memory subsystem in
//! the order the hardware demands (page allocator, kernel reservations, page
//! directory, heap), discovers storage and mounts the root filesystem. Every
//! subsystem reports failures as `Result`; this is the one place that
//! escalates them to a fatal halt.

use arrayvec::ArrayVec;
use log::info;

use crate::constants::memory::PAGE_SIZE;
use crate::devices::block::DeviceRegistry;
use crate::errors::KernelError;
use crate::filesys::vfs::Vfs;
use crate::memory::page_allocator::PageAllocator;
use crate::memory::paging::{self, PageDirectory};
use crate::memory::{MemoryRegion, MemoryRegionKind, PhysAddr};

/// More entries than any firmware hands out; held in an `ArrayVec` because
/// the list is needed before the heap exists.
pub const MAX_MEMORY_REGIONS: usize = 32;

pub type MemoryRegions = ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>;

/// The kernel's singleton state, constructed once at boot and threaded
/// through subsystem calls.
pub struct Kernel {
    pub page_allocator: PageAllocator,
    pub kernel_directory: PageDirectory,
    /// Root frame of the directory currently loaded in CR3.
    pub current_directory: PhysAddr,
    pub registry: DeviceRegistry,
    pub vfs: Option<Vfs>,
}

impl Kernel {
    /// Loads `directory` into the CPU and records it as current.
    pub fn switch_directory(&mut self, directory: &PageDirectory) {
        paging::load_directory(directory);
        self.current_directory = directory.root();
    }

    /// Reloads the kernel's own directory, e.g. after tearing down another
    /// address space.
    pub fn switch_to_kernel_directory(&mut self) {
        paging::load_directory(&self.kernel_directory);
        self.current_directory = self.kernel_directory.root();
    }
}

/// Flattens the Multiboot2 memory map into the allocator's region list.
pub fn memory_regions_from(
    boot_info: &multiboot2::BootInformation<'_>,
) -> Result<MemoryRegions, KernelError> {
    let memory_map = boot_info
        .memory_map_tag()
        .ok_or(KernelError::InvalidArgument)?;

    let mut regions = MemoryRegions::new();
    for area in memory_map.memory_areas() {
        let kind = match multiboot2::MemoryAreaType::from(area.typ()) {
            multiboot2::MemoryAreaType::Available => MemoryRegionKind::Available,
            multiboot2::MemoryAreaType::Reserved => MemoryRegionKind::Reserved,
            multiboot2::MemoryAreaType::AcpiAvailable => MemoryRegionKind::AcpiReclaimable,
            multiboot2::MemoryAreaType::ReservedHibernate => MemoryRegionKind::Nvs,
            multiboot2::MemoryAreaType::Defective => MemoryRegionKind::BadRam,
            multiboot2::MemoryAreaType::Custom(_) => MemoryRegionKind::Reserved,
        };

        let region = MemoryRegion {
            addr: area.start_address(),
            length: area.size(),
            kind,
        };
        if regions.try_push(region).is_err() {
            return Err(KernelError::OutOfMemory);
        }
    }

    Ok(regions)
}

/// Marks every frame overlapping `[start, end]` as used.
pub fn reserve_range(allocator: &mut PageAllocator, start: u32, end: u32) {
    for page in start / PAGE_SIZE..=end / PAGE_SIZE {
        allocator.reserve(PhysAddr::new(page * PAGE_SIZE));
    }
}

/// Storage bring-up shared by the boot path: partition scan plus root mount.
/// Disk controller drivers have registered their devices by the time this
/// runs; with no partitions the kernel comes up diskless.
pub fn mount_root(registry: &mut DeviceRegistry) -> Result<Option<Vfs>, KernelError> {
    crate::filesys::mbr::scan_logical_block_devices(registry)?;

    if registry.num_logical_block_devices() == 0 {
        info!("no partitions found; running without a root filesystem");
        return Ok(None);
    }

    Ok(Some(Vfs::mount_first(registry)?))
}

#[cfg(all(not(test), target_arch = "x86"))]
mod entry {
    use log::info;

    use super::{memory_regions_from, mount_root, reserve_range, Kernel};
    use crate::constants::memory::PAGE_SIZE;
    use crate::devices::block::DeviceRegistry;
    use crate::memory::heap::{heap_init, KERNEL_HEAP};
    use crate::memory::page_allocator::{largest_memory_hole, PageAllocator};
    use crate::memory::paging::{self, PageDirectory, PageFlags};
    use crate::memory::{IdentityMapper, VirtAddr};

    const MULTIBOOT2_BOOTLOADER_MAGIC: u32 = 0x36D7_6289;

    extern "C" {
        static _kernel_start: u8;
        static _kernel_end: u8;
    }

    /// Entry point reached from the loader stub with the Multiboot2 magic
    /// and the physical address of the boot information blob.
    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, mbi_addr: u32) -> ! {
        crate::logging::init();

        if magic != MULTIBOOT2_BOOTLOADER_MAGIC {
            panic!("not booted by a multiboot2 loader (magic {:#010x})", magic);
        }
        if mbi_addr & 7 != 0 {
            panic!("boot information blob is misaligned");
        }

        let boot_info = unsafe {
            multiboot2::BootInformation::load(
                mbi_addr as usize as *const multiboot2::BootInformationHeader,
            )
        }
        .unwrap_or_else(|_| panic!("cannot parse the boot information blob"));

        let mut regions =
            memory_regions_from(&boot_info).unwrap_or_else(|err| panic!("memory map: {}", err));

        let mapper = IdentityMapper;
        let mut page_allocator = PageAllocator::init(&mut regions, &mapper)
            .unwrap_or_else(|err| panic!("page allocator: {}", err));

        // Protect the kernel image and the boot-info blob before anything
        // else allocates frames.
        let kernel_start = unsafe { &_kernel_start as *const u8 as u32 };
        let kernel_end = unsafe { &_kernel_end as *const u8 as u32 };
        reserve_range(&mut page_allocator, kernel_start, kernel_end);
        reserve_range(
            &mut page_allocator,
            mbi_addr,
            mbi_addr + boot_info.total_size() as u32,
        );

        let kernel_directory = PageDirectory::create(
            &mut page_allocator,
            &mapper,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        )
        .unwrap_or_else(|err| panic!("page directory: {}", err));

        paging::load_directory(&kernel_directory);
        unsafe { paging::enable_paging() };

        // The heap's virtual window is the largest reserved hole: no
        // available frame ever lives there, so the mappings collide with
        // nothing.
        let (hole_addr, hole_size) = largest_memory_hole(&regions)
            .unwrap_or_else(|| panic!("no reserved hole to host the kernel heap"));
        let heap = heap_init(
            VirtAddr::new(hole_addr as u32),
            (hole_size / PAGE_SIZE as u64) as u32,
            &kernel_directory,
            &mut page_allocator,
            &mapper,
        )
        .unwrap_or_else(|err| panic!("heap: {}", err));
        KERNEL_HEAP.init(heap);

        let mut kernel = Kernel {
            current_directory: kernel_directory.root(),
            page_allocator,
            kernel_directory,
            registry: DeviceRegistry::new(),
            vfs: None,
        };

        // Disk controller drivers register their block devices here, through
        // the BlockDriver contract, before the partition scan.
        kernel.vfs = mount_root(&mut kernel.registry)
            .unwrap_or_else(|err| panic!("root filesystem: {}", err));

        info!("reached end of kernel init routine");
        crate::idle_loop()
    }
}

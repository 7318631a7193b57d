//! The kernel heap.
//!
//! A first-fit byte allocator over a virtually mapped region. Every chunk
//! carries an inline header; chunks tile the region with no gaps, and
//! adjacent free chunks are merged immediately on free. Request sizes are
//! rounded up to [`HEAP_GRANULARITY`] so payloads stay 8-aligned.

use core::alloc::{GlobalAlloc, Layout};
use core::cmp::min;
use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::constants::memory::{HEAP_GRANULARITY, PAGE_SIZE};
use crate::errors::KernelError;
use crate::memory::page_allocator::PageAllocator;
use crate::memory::paging::{PageDirectory, PageFlags};
use crate::memory::{PhysMapper, VirtAddr};

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    prev: *mut ChunkHeader,
    size: usize,
    allocated: bool,
}

const HEADER_SIZE: usize = core::mem::size_of::<ChunkHeader>();

pub struct Heap {
    base: *mut u8,
    size: usize,
}

// Single execution context; the heap is reached only through its owner (or
// the spin-locked global wrapper).
unsafe impl Send for Heap {}

impl Heap {
    /// Takes over `size` bytes at `base` and seeds the single spanning free
    /// chunk.
    ///
    /// # Safety
    /// `base` must be 8-aligned and writable for `size` bytes, and the
    /// region must not be touched behind the heap's back afterwards.
    pub unsafe fn from_region(base: *mut u8, size: usize) -> Heap {
        let first = base as *mut ChunkHeader;
        (*first).next = ptr::null_mut();
        (*first).prev = ptr::null_mut();
        (*first).size = size - HEADER_SIZE;
        (*first).allocated = false;

        Heap { base, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// First-fit search. The winning chunk is split when the remainder past
    /// `size + header` is at least one byte; otherwise it is handed out
    /// whole and the slack becomes internal fragmentation.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, KernelError> {
        let size = round_up(size.max(1), HEAP_GRANULARITY);

        let mut result: *mut ChunkHeader = ptr::null_mut();
        let mut chunk = self.first_chunk();
        while !chunk.is_null() {
            unsafe {
                if !(*chunk).allocated && (*chunk).size > size {
                    result = chunk;
                    break;
                }
                chunk = (*chunk).next;
            }
        }

        if result.is_null() {
            return Err(KernelError::OutOfMemory);
        }

        unsafe {
            if (*result).size >= size + HEADER_SIZE + 1 {
                let new_chunk = (result as *mut u8).add(HEADER_SIZE + size) as *mut ChunkHeader;
                (*new_chunk).allocated = false;
                (*new_chunk).size = (*result).size - size - HEADER_SIZE;
                (*new_chunk).prev = result;
                (*new_chunk).next = (*result).next;
                if !(*new_chunk).next.is_null() {
                    (*(*new_chunk).next).prev = new_chunk;
                }

                (*result).size = size;
                (*result).next = new_chunk;
            }

            (*result).allocated = true;
            Ok(NonNull::new_unchecked((result as *mut u8).add(HEADER_SIZE)))
        }
    }

    /// Allocates `size` zeroed bytes.
    pub fn kmalloc(&mut self, size: usize) -> Result<NonNull<u8>, KernelError> {
        let result = self.allocate(size)?;
        unsafe { ptr::write_bytes(result.as_ptr(), 0x00, size) };
        Ok(result)
    }

    /// Allocates `size` zeroed bytes at an `alignment` boundary by
    /// over-allocating `alignment` extra bytes and rounding the pointer up.
    /// The bytes skipped over are unrecoverable until the chunk is freed.
    pub fn kmalloc_aligned(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<u8>, KernelError> {
        let result = self.allocate(size + alignment)?;

        let addr = result.as_ptr() as usize;
        let aligned = addr + (alignment - (addr % alignment));

        unsafe {
            ptr::write_bytes(aligned as *mut u8, 0x00, size);
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    /// Moves an allocation to a new chunk of `size` bytes, preserving
    /// `min(old, new)` bytes of payload and zeroing any grown tail.
    ///
    /// # Safety
    /// `old` must be a pointer previously returned by `kmalloc`/`kcalloc`/
    /// `krealloc` on this heap and not yet freed.
    pub unsafe fn krealloc(
        &mut self,
        old: *mut u8,
        size: usize,
    ) -> Result<NonNull<u8>, KernelError> {
        let old_chunk = old.sub(HEADER_SIZE) as *mut ChunkHeader;
        let old_size = (*old_chunk).size;

        let result = self.allocate(size)?;
        let preserved = min(old_size, size);
        ptr::copy_nonoverlapping(old, result.as_ptr(), preserved);
        if preserved < size {
            ptr::write_bytes(result.as_ptr().add(preserved), 0x00, size - preserved);
        }

        self.kfree(old);
        Ok(result)
    }

    /// Allocates a zeroed array of `num` elements of `element_size` bytes.
    pub fn kcalloc(&mut self, num: usize, element_size: usize) -> Result<NonNull<u8>, KernelError> {
        let size = num
            .checked_mul(element_size)
            .ok_or(KernelError::InvalidArgument)?;
        self.kmalloc(size)
    }

    /// Releases an allocation and merges it with free neighbors on both
    /// sides, each side at most once per call.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this heap obtained from `kmalloc`,
    /// `kcalloc` or `krealloc`.
    pub unsafe fn kfree(&mut self, ptr: *mut u8) {
        let mut chunk = ptr.sub(HEADER_SIZE) as *mut ChunkHeader;
        (*chunk).allocated = false;

        let prev = (*chunk).prev;
        if !prev.is_null() && !(*prev).allocated {
            (*prev).next = (*chunk).next;
            (*prev).size += (*chunk).size + HEADER_SIZE;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = prev;
            }

            chunk = prev;
        }

        let next = (*chunk).next;
        if !next.is_null() && !(*next).allocated {
            (*chunk).size += (*next).size + HEADER_SIZE;
            (*chunk).next = (*next).next;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = chunk;
            }
        }
    }

    /// Releases the allocated chunk whose payload contains `ptr`.
    ///
    /// Aligned allocations hand out a pointer past the chunk start, so the
    /// header is not immediately before it; this walks the chunk list
    /// instead.
    ///
    /// # Safety
    /// `ptr` must point into a live allocation of this heap.
    pub unsafe fn free_containing(&mut self, ptr: *mut u8) {
        let mut chunk = self.first_chunk();
        while !chunk.is_null() {
            let payload = (chunk as *mut u8).add(HEADER_SIZE);
            let end = payload.add((*chunk).size);
            if (*chunk).allocated && payload <= ptr && ptr < end {
                self.kfree(payload);
                return;
            }
            chunk = (*chunk).next;
        }
    }

    /// Sum of `header + size` over all chunks. Always equals the region
    /// size: chunks tile the heap with no gaps.
    pub fn total_accounted(&self) -> usize {
        let mut total = 0;
        let mut chunk = self.first_chunk();
        while !chunk.is_null() {
            unsafe {
                total += HEADER_SIZE + (*chunk).size;
                chunk = (*chunk).next;
            }
        }
        total
    }

    fn first_chunk(&self) -> *mut ChunkHeader {
        self.base as *mut ChunkHeader
    }
}

fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) / to * to
}

/// Builds the kernel heap: allocates `num_pages` frames, maps them
/// consecutively at `virtual_base` in `directory`, and seeds the chunk list.
pub fn heap_init(
    virtual_base: VirtAddr,
    num_pages: u32,
    directory: &PageDirectory,
    allocator: &mut PageAllocator,
    mapper: &impl PhysMapper,
) -> Result<Heap, KernelError> {
    if num_pages < 1 {
        return Err(KernelError::InvalidArgument);
    }

    let mut current = virtual_base;
    for _ in 0..num_pages {
        let frame = allocator.alloc()?;
        directory.map(
            mapper,
            current,
            frame,
            PageFlags::PRESENT | PageFlags::WRITABLE,
        )?;
        current = VirtAddr::new(current.as_u32().wrapping_add(PAGE_SIZE));
    }

    let size = num_pages as usize * PAGE_SIZE as usize;
    log::info!("kernel heap: {} bytes at {:#x}", size, virtual_base.as_u32());

    Ok(unsafe { Heap::from_region(virtual_base.as_u32() as usize as *mut u8, size) })
}

/// Spin-locked heap wrapper backing the `alloc` crate on freestanding
/// builds. Empty until the boot path installs the initialized heap.
pub struct LockedHeap {
    inner: Mutex<Option<Heap>>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        LockedHeap {
            inner: Mutex::new(None),
        }
    }

    pub fn init(&self, heap: Heap) {
        *self.inner.lock() = Some(heap);
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.inner.lock();
        let Some(heap) = guard.as_mut() else {
            return ptr::null_mut();
        };

        let result = if layout.align() <= HEAP_GRANULARITY {
            heap.kmalloc(layout.size())
        } else {
            heap.kmalloc_aligned(layout.align(), layout.size())
        };

        match result {
            Ok(allocation) => allocation.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = self.inner.lock();
        if let Some(heap) = guard.as_mut() {
            if layout.align() <= HEAP_GRANULARITY {
                heap.kfree(ptr);
            } else {
                heap.free_containing(ptr);
            }
        }
    }
}

#[cfg(not(test))]
#[global_allocator]
pub static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const HEAP_BYTES: usize = 64 * 1024;

    /// 8-aligned backing region plus a heap spanning it.
    fn test_heap() -> (Vec<u64>, Heap) {
        let mut backing = vec![0u64; HEAP_BYTES / 8];
        let heap = unsafe { Heap::from_region(backing.as_mut_ptr() as *mut u8, HEAP_BYTES) };
        (backing, heap)
    }

    #[test]
    fn kmalloc_returns_zeroed_usable_memory() {
        let (_backing, mut heap) = test_heap();

        let allocation = heap.kmalloc(100).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts_mut(allocation.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));

        // The region is writable without tripping neighboring chunks.
        bytes.fill(0xAB);
        let second = heap.kmalloc(100).unwrap();
        let second_bytes = unsafe { core::slice::from_raw_parts(second.as_ptr(), 100) };
        assert!(second_bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn freed_chunk_is_reused() {
        let (_backing, mut heap) = test_heap();

        let a = heap.kmalloc(256).unwrap();
        let _b = heap.kmalloc(64).unwrap();
        unsafe { heap.kfree(a.as_ptr()) };

        let again = heap.kmalloc(128).unwrap();
        assert_eq!(again.as_ptr(), a.as_ptr());
    }

    #[test]
    fn adjacent_free_chunks_coalesce() {
        let (_backing, mut heap) = test_heap();

        let a = heap.kmalloc(512).unwrap();
        let b = heap.kmalloc(512).unwrap();
        let _guard = heap.kmalloc(64).unwrap();

        unsafe {
            heap.kfree(a.as_ptr());
            heap.kfree(b.as_ptr());
        }

        // Both chunks plus the header between them are one region again; an
        // allocation bigger than either alone fits at the front.
        let combined = heap.kmalloc(512 + HEADER_SIZE + 256).unwrap();
        assert_eq!(combined.as_ptr(), a.as_ptr());
    }

    #[test]
    fn accounting_covers_the_whole_region() {
        let (_backing, mut heap) = test_heap();
        assert_eq!(heap.total_accounted(), HEAP_BYTES);

        let a = heap.kmalloc(100).unwrap();
        let b = heap.kmalloc(1000).unwrap();
        let c = heap.kmalloc(10).unwrap();
        assert_eq!(heap.total_accounted(), HEAP_BYTES);

        unsafe {
            heap.kfree(b.as_ptr());
            heap.kfree(a.as_ptr());
        }
        assert_eq!(heap.total_accounted(), HEAP_BYTES);

        unsafe { heap.kfree(c.as_ptr()) };
        assert_eq!(heap.total_accounted(), HEAP_BYTES);
    }

    #[test]
    fn aligned_allocation_is_aligned() {
        let (_backing, mut heap) = test_heap();

        for alignment in [16usize, 64, 256, 4096] {
            let allocation = heap.kmalloc_aligned(alignment, 128).unwrap();
            assert_eq!(allocation.as_ptr() as usize % alignment, 0);
            let bytes = unsafe { core::slice::from_raw_parts(allocation.as_ptr(), 128) };
            assert!(bytes.iter().all(|&b| b == 0));
        }
        assert_eq!(heap.total_accounted(), HEAP_BYTES);
    }

    #[test]
    fn free_containing_releases_aligned_allocations() {
        let (_backing, mut heap) = test_heap();

        let allocation = heap.kmalloc_aligned(4096, 128).unwrap();
        unsafe { heap.free_containing(allocation.as_ptr()) };

        // The whole region is free again.
        assert_eq!(heap.total_accounted(), HEAP_BYTES);
        let big = heap.kmalloc(HEAP_BYTES - 2 * HEADER_SIZE - 8);
        assert!(big.is_ok());
    }

    #[test]
    fn krealloc_preserves_min_of_old_and_new() {
        let (_backing, mut heap) = test_heap();

        let a = heap.kmalloc(64).unwrap();
        let payload = unsafe { core::slice::from_raw_parts_mut(a.as_ptr(), 64) };
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = i as u8;
        }

        // Grow: old bytes preserved, tail zeroed.
        let grown = unsafe { heap.krealloc(a.as_ptr(), 128) }.unwrap();
        let grown_bytes = unsafe { core::slice::from_raw_parts(grown.as_ptr(), 128) };
        for (i, &byte) in grown_bytes.iter().take(64).enumerate() {
            assert_eq!(byte, i as u8);
        }
        assert!(grown_bytes[64..].iter().all(|&b| b == 0));

        // Shrink: only the new size is carried over.
        let shrunk = unsafe { heap.krealloc(grown.as_ptr(), 16) }.unwrap();
        let shrunk_bytes = unsafe { core::slice::from_raw_parts(shrunk.as_ptr(), 16) };
        for (i, &byte) in shrunk_bytes.iter().enumerate() {
            assert_eq!(byte, i as u8);
        }
        assert_eq!(heap.total_accounted(), HEAP_BYTES);
    }

    #[test]
    fn kcalloc_sizes_and_overflow() {
        let (_backing, mut heap) = test_heap();

        let a = heap.kcalloc(16, 32).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(a.as_ptr(), 16 * 32) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert_eq!(
            heap.kcalloc(usize::MAX, 2),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn exhaustion_is_an_error() {
        let (_backing, mut heap) = test_heap();

        assert_eq!(heap.kmalloc(HEAP_BYTES), Err(KernelError::OutOfMemory));

        // Small allocations up to exhaustion, then failure, then recovery.
        let mut live = Vec::new();
        loop {
            match heap.kmalloc(1024) {
                Ok(allocation) => live.push(allocation),
                Err(err) => {
                    assert_eq!(err, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert!(!live.is_empty());

        let a = live.pop().unwrap();
        unsafe { heap.kfree(a.as_ptr()) };
        assert!(heap.kmalloc(512).is_ok());

        for allocation in live {
            unsafe { heap.kfree(allocation.as_ptr()) };
        }
        assert_eq!(heap.total_accounted(), HEAP_BYTES);
    }

    #[test]
    fn heap_init_rejects_zero_pages() {
        use crate::memory::test_support::PhysArena;
        use crate::memory::{MemoryRegion, MemoryRegionKind};

        let arena = PhysArena::new(8 * 1024 * 1024);
        let mut regions = [MemoryRegion {
            addr: 0x1000,
            length: 6 * 1024 * 1024,
            kind: MemoryRegionKind::Available,
        }];
        let mut allocator = PageAllocator::init(&mut regions, &arena).unwrap();
        let directory =
            PageDirectory::create(&mut allocator, &arena, PageFlags::PRESENT).unwrap();

        assert_eq!(
            heap_init(VirtAddr::new(0x1000_0000), 0, &directory, &mut allocator, &arena)
                .err(),
            Some(KernelError::InvalidArgument)
        );

        directory.free(&mut allocator, &arena);
    }
}

//! General-purpose kernel allocator.
//!
//! A fixed table of slab caches keyed by object size serves everything up
//! to 16 KiB; larger requests fall through to whole-page virtual ranges.
//! `kfree` stores no allocation header: it first asks the slab layer to
//! take the pointer back and falls through to the range allocator when
//! the slab layer disowns it.

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

use super::{page_align_up, slab, slab::SlabCache, vmm, VirtAddr, PAGE_SIZE};
use crate::sync::cell::GlobalCell;

bitflags! {
    /// Flags accepted by [`kmalloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KmallocFlags: u32 {
        /// Never suspend while allocating.
        const ATOMIC = 1 << 0;
    }
}

struct SizeClass {
    name: &'static str,
    size: usize,
    pages_per_slab: usize,
}

/// The size-class ladder. Not strictly powers of two, and neither are the
/// slab sizes.
const SIZE_CLASSES: [SizeClass; 11] = [
    SizeClass { name: "kmalloc 8B", size: 8, pages_per_slab: 1 },
    SizeClass { name: "kmalloc 16B", size: 16, pages_per_slab: 1 },
    SizeClass { name: "kmalloc 32B", size: 32, pages_per_slab: 1 },
    SizeClass { name: "kmalloc 64B", size: 64, pages_per_slab: 1 },
    SizeClass { name: "kmalloc 128B", size: 128, pages_per_slab: 1 },
    SizeClass { name: "kmalloc 256B", size: 256, pages_per_slab: 2 },
    SizeClass { name: "kmalloc 1kB", size: 1024, pages_per_slab: 2 },
    SizeClass { name: "kmalloc 2kB", size: 2048, pages_per_slab: 3 },
    SizeClass { name: "kmalloc 4kB", size: 4096, pages_per_slab: 4 },
    SizeClass { name: "kmalloc 8kB", size: 8192, pages_per_slab: 8 },
    SizeClass { name: "kmalloc 16kB", size: 16384, pages_per_slab: 12 },
];

static CACHES: GlobalCell<[*mut SlabCache; SIZE_CLASSES.len()]> =
    GlobalCell::new([core::ptr::null_mut(); SIZE_CLASSES.len()]);

/// Create every size-class cache. Must run after the range-allocator
/// setup.
pub fn setup() -> KernelResult<()> {
    for (i, class) in SIZE_CLASSES.iter().enumerate() {
        let cache = slab::cache_create(
            class.name,
            class.size,
            class.pages_per_slab,
            slab::CacheFlags::MAP,
        )?;
        // SAFETY: boot-time single-threaded store into the static table.
        unsafe {
            (*CACHES.as_mut_ptr())[i] = cache;
        }
    }
    Ok(())
}

/// Allocate `size` bytes.
pub fn kmalloc(size: usize, flags: KmallocFlags) -> KernelResult<VirtAddr> {
    if size == 0 {
        return Err(KernelError::Invalid);
    }
    let atomic = flags.contains(KmallocFlags::ATOMIC);

    for (i, class) in SIZE_CLASSES.iter().enumerate() {
        if class.size >= size {
            // SAFETY: the table is written once at setup.
            let cache = unsafe { (*CACHES.as_mut_ptr())[i] };
            assert!(!cache.is_null(), "kmalloc used before setup");
            return slab::cache_alloc(cache, atomic);
        }
    }

    // Above the largest class: whole pages from the range allocator.
    let mut rflags = vmm::AllocFlags::MAP;
    if atomic {
        rflags |= vmm::AllocFlags::ATOMIC;
    }
    vmm::alloc(page_align_up(size) / PAGE_SIZE, rflags)
}

/// Free memory returned by [`kmalloc`]. The pointer's provenance (slab
/// object or whole-page range) is rediscovered by asking each layer.
pub fn kfree(vaddr: VirtAddr) -> KernelResult<()> {
    match slab::cache_free(vaddr) {
        Ok(()) => Ok(()),
        // Not a slab object: try the range allocator.
        Err(KernelError::Invalid) => vmm::free(vaddr),
        Err(e) => Err(e),
    }
}

/// Host/test support: stats of every size-class cache.
#[cfg(not(target_os = "none"))]
pub fn class_stats() -> std::vec::Vec<slab::CacheStats> {
    let mut out = std::vec::Vec::new();
    for i in 0..SIZE_CLASSES.len() {
        // SAFETY: the table is written once at setup.
        let cache = unsafe { (*CACHES.as_mut_ptr())[i] };
        if !cache.is_null() {
            out.push(slab::cache_stats(cache));
        }
    }
    out
}

/// `kmalloc` as the Rust global allocator, so `alloc` collections can be
/// used inside the kernel once the memory subsystems are up.
pub struct KernelHeap;

// SAFETY: kmalloc returns exclusively owned, suitably aligned blocks (the
// size classes are aligned to their own size, page fallback to the page);
// dealloc returns them to the layer they came from.
unsafe impl core::alloc::GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        // Serving max(size, align) from a size-aligned class satisfies
        // the layout's alignment.
        let size = layout.size().max(layout.align()).max(1);
        match kmalloc(size, KmallocFlags::empty()) {
            Ok(vaddr) => vaddr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        let _ = kfree(ptr as VirtAddr);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes_are_ascending() {
        let mut last = 0;
        for class in &SIZE_CLASSES {
            assert!(class.size > last);
            assert!(class.pages_per_slab > 0);
            last = class.size;
        }
        assert_eq!(SIZE_CLASSES.last().unwrap().size, 16384);
    }

    #[test]
    fn test_class_selection_picks_smallest_fit() {
        // The selection loop takes the first class >= the request.
        for (request, expect) in [(1, 8), (8, 8), (9, 16), (100, 128), (4097, 8192)] {
            let picked = SIZE_CLASSES.iter().find(|c| c.size >= request).unwrap();
            assert_eq!(picked.size, expect, "request {request}");
        }
        // Above the ladder nothing matches: the page fallback takes over.
        assert!(SIZE_CLASSES.iter().all(|c| c.size < 20000));
    }
}

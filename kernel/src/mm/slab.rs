//! Slab allocator.
//!
//! A cache owns slabs; a slab is a virtual range carved into fixed-size
//! objects whose free instances are threaded on an intrusive list through
//! the object memory itself. The slab header is embedded at the base of
//! the range. Caches keep their slabs sorted into full, partial and empty
//! lists, retain a single empty slab, and hand surplus empty slabs back to
//! the range allocator.
//!
//! Bootstrap is the delicate part: the cache of caches and the cache of
//! ranges must exist before the range allocator can allocate anything, so
//! [`prepare`] hand-builds the first slab of each in pages reserved just
//! above the kernel image, and [`commit`] later promotes them to ordinary
//! slabs once the range allocator is live.

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    sync::{cell::GlobalCell, irqlock::IrqGuard},
};

use super::{
    frame, page_align_up,
    paging::{self, VmFlags},
    vmm::{self, AllocFlags, KmemRange},
    VirtAddr, PAGE_SIZE,
};

bitflags! {
    /// Cache creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Back every slab with physical frames eagerly.
        const MAP = 1 << 0;
        /// Zero objects on allocation.
        const ZERO = 1 << 1;
        /// This cache feeds the range allocator itself: never grow from
        /// inside an allocation (the range allocator tops it up at safe
        /// points instead).
        const RESERVE = 1 << 2;
    }
}

/// Free descriptors the range cache keeps in reserve so that growing any
/// cache never catches the range allocator mid-surgery.
const RESERVE_THRESHOLD: usize = 2;

/// Intrusive free-list node living inside a free object's memory.
struct FreeObject {
    next: *mut FreeObject,
}

/// A cache of fixed-size objects.
pub struct SlabCache {
    name: &'static str,
    /// Object size as requested.
    obj_size: usize,
    /// Object stride: requested size rounded up to hold a free-list node.
    obj_stride: usize,
    pages_per_slab: usize,
    flags: CacheFlags,
    full: *mut Slab,
    partial: *mut Slab,
    empty: *mut Slab,
    nb_empty: usize,
    nb_slabs: usize,
    /// Free objects across all slabs.
    nb_free: usize,
    /// Reentrancy latch for the reserve top-up.
    growing: bool,
    /// Global cache list, for diagnostics.
    next: *mut SlabCache,
}

/// One slab: a virtual range carved into objects.
pub struct Slab {
    cache: *mut SlabCache,
    /// The range providing this slab's storage (null only between
    /// [`prepare`] and [`commit`]).
    range: *mut KmemRange,
    first_obj: VirtAddr,
    nb_objects: usize,
    free: *mut FreeObject,
    nb_free: usize,
    prev: *mut Slab,
    next: *mut Slab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Full,
    Partial,
    Empty,
}

static CACHE_OF_CACHES: GlobalCell<*mut SlabCache> = GlobalCell::new(core::ptr::null_mut());
static CACHE_OF_RANGES: GlobalCell<*mut SlabCache> = GlobalCell::new(core::ptr::null_mut());
static CACHE_LIST: GlobalCell<*mut SlabCache> = GlobalCell::new(core::ptr::null_mut());

/// The cache serving `KmemRange` descriptors.
pub(crate) fn range_cache() -> *mut SlabCache {
    // SAFETY: plain pointer-sized read of a static cell.
    unsafe { *CACHE_OF_RANGES.as_mut_ptr() }
}

/// Counters of one cache, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub obj_size: usize,
    pub nb_slabs: usize,
    pub nb_free: usize,
}

/// Stride holding both the caller's object and the free-list node.
fn stride_for(obj_size: usize) -> usize {
    obj_size.max(core::mem::size_of::<FreeObject>())
}

/// Alignment given to the first object in a slab: natural alignment for
/// power-of-two sizes, capped at a page.
fn align_for(obj_stride: usize) -> usize {
    obj_stride.next_power_of_two().min(PAGE_SIZE)
}

/// Offset of the first object, leaving room for the embedded header.
fn first_obj_offset(obj_stride: usize) -> usize {
    let header = core::mem::size_of::<Slab>();
    let align = align_for(obj_stride);
    (header + align - 1) & !(align - 1)
}

fn slab_state(nb_free: usize, nb_objects: usize) -> SlabState {
    if nb_free == 0 {
        SlabState::Full
    } else if nb_free == nb_objects {
        SlabState::Empty
    } else {
        SlabState::Partial
    }
}

/// Push `slab` at the head of a cache list.
///
/// # Safety
///
/// Critical section held; `slab` detached.
unsafe fn list_push(head: &mut *mut Slab, slab: *mut Slab) {
    // SAFETY: pointer surgery on live, detached node.
    unsafe {
        (*slab).prev = core::ptr::null_mut();
        (*slab).next = *head;
        if !(*head).is_null() {
            (**head).prev = slab;
        }
        *head = slab;
    }
}

/// Unlink `slab` from a cache list.
///
/// # Safety
///
/// Critical section held; `slab` on the list rooted at `*head`.
unsafe fn list_unlink(head: &mut *mut Slab, slab: *mut Slab) {
    // SAFETY: pointer surgery on live nodes.
    unsafe {
        if (*slab).prev.is_null() {
            *head = (*slab).next;
        } else {
            (*(*slab).prev).next = (*slab).next;
        }
        if !(*slab).next.is_null() {
            (*(*slab).next).prev = (*slab).prev;
        }
        (*slab).prev = core::ptr::null_mut();
        (*slab).next = core::ptr::null_mut();
    }
}

/// List head of `cache` for slabs in `state`.
///
/// # Safety
///
/// Critical section held; `cache` live.
unsafe fn cache_list(cache: *mut SlabCache, state: SlabState) -> &'static mut *mut Slab {
    // SAFETY: `cache` outlives any caller of this helper; the borrow is
    // short-lived under the critical section.
    unsafe {
        match state {
            SlabState::Full => &mut (*cache).full,
            SlabState::Partial => &mut (*cache).partial,
            SlabState::Empty => &mut (*cache).empty,
        }
    }
}

/// Move `slab` between cache lists after its free count changed from
/// `was` free objects to its current value.
///
/// # Safety
///
/// Critical section held.
unsafe fn relist(cache: *mut SlabCache, slab: *mut Slab, was: usize) {
    // SAFETY: live cache and slab per the contract.
    unsafe {
        let old = slab_state(was, (*slab).nb_objects);
        let new = slab_state((*slab).nb_free, (*slab).nb_objects);
        if old == new {
            return;
        }
        list_unlink(cache_list(cache, old), slab);
        list_push(cache_list(cache, new), slab);
        if old == SlabState::Empty {
            (*cache).nb_empty -= 1;
        }
        if new == SlabState::Empty {
            (*cache).nb_empty += 1;
        }
    }
}

/// Write a slab header at `base` and thread the free list through its
/// objects. The slab is not linked into any cache list.
///
/// # Safety
///
/// Critical section held; `base..base + pages * PAGE_SIZE` must be
/// writable slab storage owned by the caller.
unsafe fn init_slab(
    cache: *mut SlabCache,
    range: *mut KmemRange,
    base: VirtAddr,
    pages: usize,
    obj_stride: usize,
) -> *mut Slab {
    let offset = first_obj_offset(obj_stride);
    let nb_objects = (pages * PAGE_SIZE - offset) / obj_stride;
    assert!(nb_objects > 0, "slab too small for a single object");

    let slab = base as *mut Slab;
    // SAFETY: the storage is writable per the contract; objects start
    // after the header.
    unsafe {
        slab.write(Slab {
            cache,
            range,
            first_obj: base + offset,
            nb_objects,
            free: core::ptr::null_mut(),
            nb_free: 0,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        });
        // Thread the free list front to back.
        let mut prev: *mut FreeObject = core::ptr::null_mut();
        for i in (0..nb_objects).rev() {
            let obj = (base + offset + i * obj_stride) as *mut FreeObject;
            (*obj).next = prev;
            prev = obj;
        }
        (*slab).free = prev;
        (*slab).nb_free = nb_objects;
    }
    slab
}

/// Add one slab's worth of objects to `cache`.
///
/// # Safety
///
/// Critical section held; `cache` live.
unsafe fn grow(cache: *mut SlabCache, atomic: bool) -> KernelResult<()> {
    // SAFETY: raw field reads of a live cache.
    let (pages, stride, map) = unsafe {
        (
            (*cache).pages_per_slab,
            (*cache).obj_stride,
            (*cache).flags.contains(CacheFlags::MAP),
        )
    };

    let mut rflags = AllocFlags::empty();
    if atomic {
        rflags |= AllocFlags::ATOMIC;
    }
    if map {
        rflags |= AllocFlags::MAP;
    }
    let range = vmm::new_range(pages, rflags)?;

    // SAFETY: the fresh range's storage is ours; writes to an unmapped
    // (non-MAP) slab fault into the demand-paging path, which resolves
    // through the used range inserted by `new_range`.
    unsafe {
        let base = (*range).base();
        let slab = init_slab(cache, range, base, pages, stride);
        vmm::set_slab(range, slab);
        list_push(cache_list(cache, SlabState::Empty), slab);
        (*cache).nb_empty += 1;
        (*cache).nb_slabs += 1;
        (*cache).nb_free += (*slab).nb_objects;
    }
    Ok(())
}

/// Initialize a cache structure in place.
///
/// # Safety
///
/// `cache` must point to writable, exclusively owned memory.
unsafe fn init_cache(
    cache: *mut SlabCache,
    name: &'static str,
    obj_size: usize,
    pages_per_slab: usize,
    flags: CacheFlags,
) {
    let stride = stride_for(obj_size);
    // SAFETY: per the contract.
    unsafe {
        cache.write(SlabCache {
            name,
            obj_size,
            obj_stride: stride,
            pages_per_slab,
            flags,
            full: core::ptr::null_mut(),
            partial: core::ptr::null_mut(),
            empty: core::ptr::null_mut(),
            nb_empty: 0,
            nb_slabs: 0,
            nb_free: 0,
            growing: false,
            next: core::ptr::null_mut(),
        });
        let list = CACHE_LIST.as_mut_ptr();
        (*cache).next = *list;
        *list = cache;
    }
}

/// Create a cache. `pages_per_slab` pages must hold the header plus at
/// least one object.
pub fn cache_create(
    name: &'static str,
    obj_size: usize,
    pages_per_slab: usize,
    flags: CacheFlags,
) -> KernelResult<*mut SlabCache> {
    if obj_size == 0 || pages_per_slab == 0 {
        return Err(KernelError::Invalid);
    }
    let stride = stride_for(obj_size);
    if first_obj_offset(stride) + stride > pages_per_slab * PAGE_SIZE {
        return Err(KernelError::Invalid);
    }

    let _irq = IrqGuard::new();
    // SAFETY: critical section held; the cache-of-caches serves
    // `SlabCache`-sized objects.
    unsafe {
        let cache = cache_alloc(*CACHE_OF_CACHES.as_mut_ptr(), false)? as *mut SlabCache;
        init_cache(cache, name, obj_size, pages_per_slab, flags);
        Ok(cache)
    }
}

/// Allocate one object from `cache`. `atomic` forbids suspension while
/// acquiring backing frames.
pub fn cache_alloc(cache: *mut SlabCache, atomic: bool) -> KernelResult<VirtAddr> {
    assert!(!cache.is_null());
    let _irq = IrqGuard::new();

    // SAFETY: critical section held; the cache and its slabs are live.
    unsafe {
        if (*cache).partial.is_null() && (*cache).empty.is_null() {
            if (*cache).flags.contains(CacheFlags::RESERVE) {
                // The reserve cache is topped up at safe points only;
                // running dry here means the kernel really is out.
                return Err(KernelError::OutOfMemory);
            }
            grow(cache, atomic)?;
        }

        let slab = if !(*cache).partial.is_null() {
            (*cache).partial
        } else {
            (*cache).empty
        };

        let was = (*slab).nb_free;
        let obj = (*slab).free;
        assert!(!obj.is_null(), "slab on a non-full list with no free object");
        (*slab).free = (*obj).next;
        (*slab).nb_free -= 1;
        (*cache).nb_free -= 1;
        relist(cache, slab, was);

        if (*cache).flags.contains(CacheFlags::ZERO) {
            core::ptr::write_bytes(obj as *mut u8, 0, (*cache).obj_stride);
        }
        Ok(obj as VirtAddr)
    }
}

/// Free the object at `vaddr` back to the slab and cache it came from.
/// Returns `Invalid` when the address does not belong to any slab, so the
/// general allocator can fall through to the range allocator.
pub fn cache_free(vaddr: VirtAddr) -> KernelResult<()> {
    let _irq = IrqGuard::new();

    let slab = vmm::resolve_slab(vaddr);
    if slab.is_null() {
        return Err(KernelError::Invalid);
    }

    // SAFETY: critical section held; the slab and its cache are live.
    unsafe {
        let cache = (*slab).cache;
        if vaddr < (*slab).first_obj {
            return Err(KernelError::Invalid);
        }
        let offset = vaddr - (*slab).first_obj;
        if offset % (*cache).obj_stride != 0 || offset / (*cache).obj_stride >= (*slab).nb_objects
        {
            return Err(KernelError::Invalid);
        }

        let was = (*slab).nb_free;
        let obj = vaddr as *mut FreeObject;
        (*obj).next = (*slab).free;
        (*slab).free = obj;
        (*slab).nb_free += 1;
        (*cache).nb_free += 1;
        relist(cache, slab, was);

        // Keep a single empty slab around; return the rest to the range
        // allocator.
        if (*slab).nb_free == (*slab).nb_objects && (*cache).nb_empty > 1 {
            destroy_slab(cache, slab)?;
        }
    }
    Ok(())
}

/// Detach an empty slab and hand its range back to the range allocator.
///
/// # Safety
///
/// Critical section held; `slab` must be on the cache's empty list.
unsafe fn destroy_slab(cache: *mut SlabCache, slab: *mut Slab) -> KernelResult<()> {
    // SAFETY: live cache and slab per the contract.
    unsafe {
        list_unlink(cache_list(cache, SlabState::Empty), slab);
        (*cache).nb_empty -= 1;
        (*cache).nb_slabs -= 1;
        (*cache).nb_free -= (*slab).nb_objects;
        let range = (*slab).range;
        vmm::set_slab(range, core::ptr::null_mut());
        // The header lives inside the range: it dies with it.
        vmm::del_range(range)
    }
}

/// Free a `KmemRange` descriptor from inside the range allocator's own
/// deletion path, without calling back into it. When this empties a
/// surplus descriptor slab, the slab is detached and its range returned
/// so the caller can queue it on its worklist.
pub(crate) fn release_range_descriptor(obj: *mut KmemRange) -> Option<*mut KmemRange> {
    let vaddr = obj as VirtAddr;
    let slab = vmm::resolve_slab(vaddr);
    assert!(!slab.is_null(), "range descriptor outside the range cache");

    // SAFETY: caller (the range allocator) holds the critical section.
    unsafe {
        let cache = (*slab).cache;
        let was = (*slab).nb_free;
        let node = vaddr as *mut FreeObject;
        (*node).next = (*slab).free;
        (*slab).free = node;
        (*slab).nb_free += 1;
        (*cache).nb_free += 1;
        relist(cache, slab, was);

        if (*slab).nb_free == (*slab).nb_objects && (*cache).nb_empty > 1 {
            list_unlink(cache_list(cache, SlabState::Empty), slab);
            (*cache).nb_empty -= 1;
            (*cache).nb_slabs -= 1;
            (*cache).nb_free -= (*slab).nb_objects;
            return Some((*slab).range);
        }
    }
    None
}

/// Top up the range-descriptor reserve. Called by the range allocator at
/// points where growing cannot interleave with its list surgery.
pub(crate) fn replenish_range_cache(atomic: bool) {
    let _irq = IrqGuard::new();
    let cache = range_cache();
    if cache.is_null() {
        return;
    }
    // SAFETY: critical section held.
    unsafe {
        if (*cache).growing {
            return;
        }
        (*cache).growing = true;
        while (*cache).nb_free <= RESERVE_THRESHOLD {
            if grow(cache, atomic).is_err() {
                break;
            }
        }
        (*cache).growing = false;
    }
}

/// Hand-built first slabs, as returned by [`prepare`].
pub struct BootstrapSlabs {
    pub caches_slab: *mut Slab,
    pub caches_base: VirtAddr,
    pub caches_pages: usize,
    pub ranges_slab: *mut Slab,
    pub ranges_base: VirtAddr,
    pub ranges_pages: usize,
}

/// Bootstrap step one: reserve pages right above the kernel image, map
/// them, and lay out by hand the first slab of the cache of caches and of
/// the cache of ranges. After this call both caches can serve objects,
/// but their slabs have no ranges yet.
///
/// # Safety
///
/// Must run once, from the range-allocator setup, inside its critical
/// section, with frames and paging live.
pub(crate) unsafe fn prepare(kernel_top: VirtAddr) -> KernelResult<BootstrapSlabs> {
    let caches_base = page_align_up(kernel_top);
    let caches_pages = 1usize;
    let ranges_base = caches_base + caches_pages * PAGE_SIZE;
    let ranges_pages = 1usize;

    // Map the bootstrap pages by hand; from here on they behave like any
    // MAP-backed slab storage.
    for page in 0..caches_pages + ranges_pages {
        let vaddr = caches_base + page * PAGE_SIZE;
        let paddr = frame::ref_new(false)?;
        paging::map(paddr, vaddr, false, VmFlags::READ | VmFlags::WRITE)?;
        // The mapping holds the frame now.
        let _ = frame::unref(paddr);
    }

    // SAFETY: the freshly mapped pages are exclusively ours; the critical
    // section is held by the caller.
    unsafe {
        let cache_stride = stride_for(core::mem::size_of::<SlabCache>());

        // The first slab of the cache of caches, and, carved out of it by
        // hand, the two cache structures themselves.
        let caches_slab = init_slab(
            core::ptr::null_mut(),
            core::ptr::null_mut(),
            caches_base,
            caches_pages,
            cache_stride,
        );
        let cache_of_caches = take_object(caches_slab) as *mut SlabCache;
        let cache_of_ranges = take_object(caches_slab) as *mut SlabCache;

        init_cache(
            cache_of_caches,
            "slab caches",
            core::mem::size_of::<SlabCache>(),
            caches_pages,
            CacheFlags::MAP,
        );
        init_cache(
            cache_of_ranges,
            "kernel ranges",
            core::mem::size_of::<KmemRange>(),
            ranges_pages,
            CacheFlags::MAP | CacheFlags::RESERVE,
        );

        (*caches_slab).cache = cache_of_caches;
        list_push(
            cache_list(cache_of_caches, slab_state((*caches_slab).nb_free, (*caches_slab).nb_objects)),
            caches_slab,
        );
        (*cache_of_caches).nb_slabs = 1;
        (*cache_of_caches).nb_free = (*caches_slab).nb_free;

        // The first slab of the cache of ranges, fully free.
        let ranges_slab = init_slab(
            cache_of_ranges,
            core::ptr::null_mut(),
            ranges_base,
            ranges_pages,
            stride_for(core::mem::size_of::<KmemRange>()),
        );
        list_push(cache_list(cache_of_ranges, SlabState::Empty), ranges_slab);
        (*cache_of_ranges).nb_empty = 1;
        (*cache_of_ranges).nb_slabs = 1;
        (*cache_of_ranges).nb_free = (*ranges_slab).nb_free;

        *CACHE_OF_CACHES.as_mut_ptr() = cache_of_caches;
        *CACHE_OF_RANGES.as_mut_ptr() = cache_of_ranges;

        Ok(BootstrapSlabs {
            caches_slab,
            caches_base,
            caches_pages,
            ranges_slab,
            ranges_base,
            ranges_pages,
        })
    }
}

/// Pop one object from a slab's free list by hand (bootstrap only).
///
/// # Safety
///
/// Critical section held; the slab must have a free object.
unsafe fn take_object(slab: *mut Slab) -> VirtAddr {
    // SAFETY: per the contract.
    unsafe {
        let obj = (*slab).free;
        assert!(!obj.is_null());
        (*slab).free = (*obj).next;
        (*slab).nb_free -= 1;
        obj as VirtAddr
    }
}

/// Bootstrap step two: bind the hand-built slabs to the ranges the range
/// allocator created for them. From here on they are ordinary slabs.
///
/// # Safety
///
/// Must run once, from the range-allocator setup, after the ranges
/// covering both slabs exist.
pub(crate) unsafe fn commit(
    caches_slab: *mut Slab,
    caches_range: *mut KmemRange,
    ranges_slab: *mut Slab,
    ranges_range: *mut KmemRange,
) {
    assert!(!caches_range.is_null() && !ranges_range.is_null());
    // SAFETY: live hand-built slabs; ranges created by the caller.
    unsafe {
        (*caches_slab).range = caches_range;
        (*ranges_slab).range = ranges_range;
    }
}

/// Counters of `cache`.
pub fn cache_stats(cache: *mut SlabCache) -> CacheStats {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held; the cache is live.
    unsafe {
        CacheStats {
            obj_size: (*cache).obj_size,
            nb_slabs: (*cache).nb_slabs,
            nb_free: (*cache).nb_free,
        }
    }
}

/// Log one line per cache, for diagnostics.
pub fn log_caches() {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held; the cache list is well formed.
    unsafe {
        let mut cursor = *CACHE_LIST.as_mut_ptr();
        while !cursor.is_null() {
            let c = &*cursor;
            log::debug!(
                "cache {:<16} obj={:<6} slabs={} free={}",
                c.name,
                c.obj_size,
                c.nb_slabs,
                c.nb_free
            );
            cursor = c.next;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_object_layout_math() {
        // The first object leaves room for the header and lands on the
        // stride's natural alignment.
        let stride = stride_for(16);
        assert_eq!(stride, 16);
        let off = first_obj_offset(stride);
        assert!(off >= core::mem::size_of::<Slab>());
        assert_eq!(off % 16, 0);

        // Tiny objects are widened to hold the free-list node.
        assert_eq!(stride_for(1), core::mem::size_of::<FreeObject>());

        // Page-sized objects align to the page.
        assert_eq!(align_for(4096), 4096);
        assert_eq!(first_obj_offset(4096), 4096);
        // 4 pages at 4 KiB per object: header page + 3 objects.
        assert_eq!((4 * PAGE_SIZE - first_obj_offset(4096)) / 4096, 3);
    }

    #[test]
    fn test_slab_state_transitions() {
        assert_eq!(slab_state(0, 10), SlabState::Full);
        assert_eq!(slab_state(3, 10), SlabState::Partial);
        assert_eq!(slab_state(10, 10), SlabState::Empty);
    }

    #[test]
    fn test_init_slab_threads_all_objects() {
        let mut storage = vec![0u8; 2 * PAGE_SIZE];
        // Fake cache pointer: never dereferenced by init_slab.
        let base = storage.as_mut_ptr() as VirtAddr;
        let stride = stride_for(64);
        // SAFETY: the storage buffer is writable and exclusively ours.
        let slab = unsafe {
            init_slab(core::ptr::null_mut(), core::ptr::null_mut(), base, 2, stride)
        };
        // SAFETY: just built above.
        unsafe {
            let expected = (2 * PAGE_SIZE - first_obj_offset(stride)) / stride;
            assert_eq!((*slab).nb_objects, expected);
            assert_eq!((*slab).nb_free, expected);

            // Walk the free list: every node distinct, in-bounds, aligned.
            let mut seen = 0usize;
            let mut cursor = (*slab).free;
            while !cursor.is_null() {
                let addr = cursor as usize;
                assert!(addr >= (*slab).first_obj);
                assert_eq!((addr - (*slab).first_obj) % stride, 0);
                seen += 1;
                cursor = (*cursor).next;
            }
            assert_eq!(seen, expected);
        }
    }
}

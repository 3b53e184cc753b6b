//! Kernel virtual-address range allocator.
//!
//! The kernel virtual space is partitioned into ranges kept on two lists,
//! `free` and `used`, both sorted by strictly ascending base address.
//! Range descriptors are themselves slab objects served by a dedicated
//! cache, which is why setup is a careful bootstrap: the first slab of
//! that cache (and of the cache of caches) is laid out by hand before the
//! allocator exists, then committed once it does.
//!
//! Freeing a range can empty a slab of range descriptors, which frees
//! another range; to keep that from recursing, [`del_range`] queues such
//! ranges on a local worklist and processes them iteratively.

use bitflags::bitflags;

use crate::{
    config::{KERNEL_VMM_BASE, KERNEL_VMM_TOP},
    error::{KernelError, KernelResult},
    sync::{cell::GlobalCell, irqlock::IrqGuard},
};

use super::{
    frame,
    paging::{self, VmFlags},
    slab::{self, Slab},
    PhysAddr, VirtAddr, PAGE_SIZE,
};

bitflags! {
    /// Flags accepted by [`new_range`] and [`alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Never suspend (no blocking frame allocation).
        const ATOMIC = 1 << 0;
        /// Back the range with physical frames eagerly instead of relying
        /// on demand paging.
        const MAP = 1 << 1;
    }
}

/// A contiguous interval of kernel virtual addresses.
pub struct KmemRange {
    base: VirtAddr,
    pages: usize,
    /// Owning slab when this range is a slab's storage, else null.
    slab: *mut Slab,
    prev: *mut KmemRange,
    next: *mut KmemRange,
}

impl KmemRange {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    fn top(&self) -> VirtAddr {
        self.base + self.size()
    }

    pub(crate) fn slab(&self) -> *mut Slab {
        self.slab
    }

    fn contains(&self, vaddr: VirtAddr) -> bool {
        (self.base..self.top()).contains(&vaddr)
    }
}

struct RangeLists {
    free: *mut KmemRange,
    used: *mut KmemRange,
}

/// Local FIFO of detached ranges awaiting deletion, chained through their
/// (otherwise unused) `next` field.
struct Worklist {
    head: *mut KmemRange,
    tail: *mut KmemRange,
}

impl Worklist {
    /// # Safety note: `r` must be detached from both range lists.
    fn push(&mut self, r: *mut KmemRange) {
        // SAFETY: `r` is detached, exclusively ours.
        unsafe {
            (*r).slab = core::ptr::null_mut();
            (*r).next = core::ptr::null_mut();
            if self.tail.is_null() {
                self.head = r;
            } else {
                (*self.tail).next = r;
            }
            self.tail = r;
        }
    }

    fn pop(&mut self) -> Option<*mut KmemRange> {
        if self.head.is_null() {
            return None;
        }
        let r = self.head;
        // SAFETY: worklist nodes are detached live ranges.
        unsafe {
            self.head = (*r).next;
            if self.head.is_null() {
                self.tail = core::ptr::null_mut();
            }
            (*r).next = core::ptr::null_mut();
        }
        Some(r)
    }
}

// SAFETY: accessed only inside interrupt-off critical sections (single
// CPU) or under the host test lock.
unsafe impl Sync for RangeLists {}

static LISTS: GlobalCell<RangeLists> = GlobalCell::new(RangeLists {
    free: core::ptr::null_mut(),
    used: core::ptr::null_mut(),
});

/// Closest range with `base <= vaddr` in a sorted list, or null.
///
/// # Safety
///
/// Caller must be inside the allocator's critical section; the list must
/// be well formed.
unsafe fn closest_preceding(list: *mut KmemRange, vaddr: VirtAddr) -> *mut KmemRange {
    let mut best: *mut KmemRange = core::ptr::null_mut();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: list nodes are live range descriptors.
        let r = unsafe { &*cursor };
        if vaddr < r.base {
            break;
        }
        best = cursor;
        cursor = r.next;
    }
    best
}

/// Insert `range` into the sorted list rooted at `*head`.
///
/// # Safety
///
/// As for [`closest_preceding`]; `range` must not already be on a list.
unsafe fn insert_sorted(head: &mut *mut KmemRange, range: *mut KmemRange) {
    // SAFETY: forwarded to callee and pointer surgery below on live nodes.
    unsafe {
        let prec = closest_preceding(*head, (*range).base);
        if prec.is_null() {
            (*range).prev = core::ptr::null_mut();
            (*range).next = *head;
            if !(*head).is_null() {
                (**head).prev = range;
            }
            *head = range;
        } else {
            (*range).prev = prec;
            (*range).next = (*prec).next;
            if !(*prec).next.is_null() {
                (*(*prec).next).prev = range;
            }
            (*prec).next = range;
        }
    }
}

/// Unlink `range` from the sorted list rooted at `*head`.
///
/// # Safety
///
/// As for [`closest_preceding`]; `range` must be on that list.
unsafe fn unlink(head: &mut *mut KmemRange, range: *mut KmemRange) {
    // SAFETY: pointer surgery on live nodes per the contract.
    unsafe {
        if (*range).prev.is_null() {
            *head = (*range).next;
        } else {
            (*(*range).prev).next = (*range).next;
        }
        if !(*range).next.is_null() {
            (*(*range).next).prev = (*range).prev;
        }
        (*range).prev = core::ptr::null_mut();
        (*range).next = core::ptr::null_mut();
    }
}

/// Find the used range covering `vaddr`: through the frame back-pointer
/// when the address is mapped, by scanning the used list otherwise.
///
/// # Safety
///
/// Caller must be inside the allocator's critical section.
unsafe fn lookup_range(vaddr: VirtAddr) -> *mut KmemRange {
    if let Some(paddr) = paging::get_paddr(vaddr) {
        let range = frame::range_of(super::page_align_down(paddr));
        // A mapped kernel page is expected to belong to a range; the
        // back-pointer may only lag for pages outside the managed space.
        if !range.is_null() {
            return range;
        }
    }
    // SAFETY: inside the critical section, the used list is well formed.
    unsafe {
        let range = closest_preceding((*LISTS.as_mut_ptr()).used, vaddr);
        if range.is_null() || !(*range).contains(vaddr) {
            return core::ptr::null_mut();
        }
        range
    }
}

/// Memory layout handed to [`setup`]. All addresses are page-aligned; the
/// intervals must be disjoint, ascending, and inside
/// `[vmm_base, vmm_top)` except for the hardware window, which may precede
/// the kernel.
pub struct KmemLayout {
    /// Bottom of the managed kernel virtual space.
    pub vmm_base: VirtAddr,
    /// Exclusive top of the managed space.
    pub vmm_top: VirtAddr,
    /// Identity-mapped hardware window (BIOS/video), if inside the space.
    pub hw: Option<(VirtAddr, VirtAddr)>,
    /// Kernel image up to the bootstrap stack.
    pub kernel_base: VirtAddr,
    /// Bootstrap stack (its own range, so it can be released later).
    pub stack_base: VirtAddr,
    pub stack_top: VirtAddr,
    /// Top of the kernel area (image, descriptors): everything between
    /// `stack_top` and this is the tail of the kernel area.
    pub kernel_top: VirtAddr,
}

impl KmemLayout {
    /// The boot layout: constants from `config` plus the measured kernel
    /// extent.
    pub fn boot(
        kernel_base: VirtAddr,
        kernel_top: VirtAddr,
        stack_base: VirtAddr,
        stack_top: VirtAddr,
    ) -> Self {
        Self {
            vmm_base: KERNEL_VMM_BASE,
            vmm_top: KERNEL_VMM_TOP,
            hw: Some((
                crate::config::BIOS_VIDEO_START,
                crate::config::BIOS_VIDEO_END,
            )),
            kernel_base,
            stack_base,
            stack_top,
            kernel_top,
        }
    }
}

/// Create one initial range covering `[base, top)` and place it on the
/// free or used list. Used ranges get their pages' frame back-pointers
/// set. Intervals smaller than a page are skipped.
///
/// # Safety
///
/// Setup-time only, inside the critical section, with the range cache
/// operational.
unsafe fn create_initial_range(
    is_free: bool,
    base: VirtAddr,
    top: VirtAddr,
    slab_owner: *mut Slab,
) -> *mut KmemRange {
    assert!(super::is_page_aligned(base) && super::is_page_aligned(top));
    if top <= base || top - base < PAGE_SIZE {
        return core::ptr::null_mut();
    }

    let range = slab::cache_alloc(slab::range_cache(), true).expect("bootstrap range descriptor")
        as *mut KmemRange;
    // SAFETY: the slab object is fresh, exclusively ours.
    unsafe {
        range.write(KmemRange {
            base,
            pages: (top - base) / PAGE_SIZE,
            slab: slab_owner,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
        });
        let lists = &mut *LISTS.as_mut_ptr();
        if is_free {
            insert_sorted(&mut lists.free, range);
        } else {
            insert_sorted(&mut lists.used, range);
            let mut vaddr = base;
            while vaddr < top {
                if let Some(paddr) = paging::get_paddr(vaddr) {
                    let _ = frame::set_range(super::page_align_down(paddr), range);
                }
                vaddr += PAGE_SIZE;
            }
        }
    }
    range
}

/// Initialize the range allocator: run the slab bootstrap *prepare* step,
/// carve the initial free/used ranges out of the layout, then *commit*
/// the hand-built slabs so they behave like ordinary ones.
///
/// # Safety
///
/// Must run once, after the frame allocator and paging are operational,
/// before any other allocation.
pub unsafe fn setup(layout: &KmemLayout) -> KernelResult<()> {
    let _irq = IrqGuard::new();

    // SAFETY: setup-time, single caller, critical section held.
    unsafe {
        let boot = slab::prepare(layout.kernel_top)?;

        let kernel_area_base = super::page_align_down(layout.kernel_base);
        match layout.hw {
            Some((hw_start, hw_end)) => {
                let hw_start = super::page_align_down(hw_start);
                let hw_end = super::page_align_up(hw_end);
                create_initial_range(true, layout.vmm_base, hw_start, core::ptr::null_mut());
                create_initial_range(false, hw_start, hw_end, core::ptr::null_mut());
                create_initial_range(true, hw_end, kernel_area_base, core::ptr::null_mut());
            }
            None => {
                create_initial_range(true, layout.vmm_base, kernel_area_base, core::ptr::null_mut());
            }
        }

        // The kernel area, with the bootstrap stack as its own range so
        // that it can be handed back once the boot thread is gone.
        create_initial_range(false, kernel_area_base, layout.stack_base, core::ptr::null_mut());
        create_initial_range(false, layout.stack_base, layout.stack_top, core::ptr::null_mut());
        create_initial_range(
            false,
            layout.stack_top,
            super::page_align_up(layout.kernel_top),
            core::ptr::null_mut(),
        );

        // The two hand-built slabs sit directly above the kernel area.
        assert!(super::page_align_up(layout.kernel_top) == boot.caches_base);
        let caches_range = create_initial_range(
            false,
            boot.caches_base,
            boot.caches_base + boot.caches_pages * PAGE_SIZE,
            boot.caches_slab,
        );
        assert!(boot.caches_base + boot.caches_pages * PAGE_SIZE == boot.ranges_base);
        let ranges_range = create_initial_range(
            false,
            boot.ranges_base,
            boot.ranges_base + boot.ranges_pages * PAGE_SIZE,
            boot.ranges_slab,
        );

        // Everything above is free space.
        create_initial_range(
            true,
            boot.ranges_base + boot.ranges_pages * PAGE_SIZE,
            layout.vmm_top,
            core::ptr::null_mut(),
        );

        slab::commit(boot.caches_slab, caches_range, boot.ranges_slab, ranges_range);
    }
    Ok(())
}

/// Allocate a range of `pages` pages, first-fit. With [`AllocFlags::MAP`]
/// the range is immediately backed by fresh frames; a failure mid-way
/// rolls the whole allocation back.
pub fn new_range(pages: usize, flags: AllocFlags) -> KernelResult<*mut KmemRange> {
    if pages == 0 {
        return Err(KernelError::Invalid);
    }
    let _irq = IrqGuard::new();

    // SAFETY: critical section held for the whole operation.
    let new_range = unsafe {
        let lists = LISTS.as_mut_ptr();

        // First fit over the free list.
        let mut cursor = (*lists).free;
        let free_range = loop {
            if cursor.is_null() {
                return Err(KernelError::OutOfMemory);
            }
            if (*cursor).pages >= pages {
                break cursor;
            }
            cursor = (*cursor).next;
        };

        if (*free_range).pages == pages {
            // Exact fit: the free range itself moves to the used list.
            unlink(&mut (*lists).free, free_range);
            insert_sorted(&mut (*lists).used, free_range);
            free_range
        } else {
            // Split: the new used range takes the bottom of the free one.
            let descr =
                slab::cache_alloc(slab::range_cache(), flags.contains(AllocFlags::ATOMIC))?
                    as *mut KmemRange;
            descr.write(KmemRange {
                base: (*free_range).base,
                pages,
                slab: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            });
            (*free_range).base += pages * PAGE_SIZE;
            (*free_range).pages -= pages;
            // The shrunk free range keeps its place in the sorted list.
            insert_sorted(&mut (*lists).used, descr);
            descr
        }
    };

    // SAFETY: `new_range` is ours, off the free list, in the used list.
    unsafe {
        (*new_range).slab = core::ptr::null_mut();

        if flags.contains(AllocFlags::MAP) {
            let mut vm_flags = VmFlags::READ | VmFlags::WRITE;
            if flags.contains(AllocFlags::ATOMIC) {
                vm_flags |= VmFlags::ATOMIC;
            }
            for i in 0..pages {
                let vaddr = (*new_range).base + i * PAGE_SIZE;
                let mapped: KernelResult<PhysAddr> = (|| {
                    let paddr = frame::ref_new(!flags.contains(AllocFlags::ATOMIC))?;
                    if let Err(e) = paging::map(paddr, vaddr, false, vm_flags) {
                        let _ = frame::unref(paddr);
                        return Err(e);
                    }
                    // The mapping holds the reference now.
                    let _ = frame::unref(paddr);
                    Ok(paddr)
                })();
                match mapped {
                    Ok(paddr) => {
                        let _ = frame::set_range(paddr, new_range);
                    }
                    Err(e) => {
                        // Roll back everything allocated so far.
                        del_range(new_range)?;
                        return Err(e);
                    }
                }
            }
        }
    }

    // Keep the range cache able to serve the next descriptor without
    // growing in the middle of list surgery.
    slab::replenish_range_cache(flags.contains(AllocFlags::ATOMIC));

    Ok(new_range)
}

/// Return `range` to the free list: unmap every page, coalesce with
/// adjacent free neighbors, and iteratively free any descriptor slabs
/// emptied by the coalescing.
pub fn del_range(range: *mut KmemRange) -> KernelResult<()> {
    assert!(!range.is_null());
    let _irq = IrqGuard::new();

    // SAFETY: critical section held; `range` is a live used range.
    unsafe {
        assert!((*range).slab.is_null(), "freeing a slab-owned range");
        let lists = LISTS.as_mut_ptr();
        unlink(&mut (*lists).used, range);

        // Worklist of ranges whose descriptor slab was emptied while
        // coalescing; freed iteratively to avoid unbounded recursion.
        let mut pending: Worklist = Worklist {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        };

        let mut current = range;
        loop {
            insert_sorted(&mut (*lists).free, current);

            // Unmap every page; pages never touched (demand paging not
            // yet triggered) simply report Invalid.
            for i in 0..(*current).pages {
                let _ = paging::unmap((*current).base + i * PAGE_SIZE);
            }

            // Merge with the preceding free neighbor.
            let prev = (*current).prev;
            if !prev.is_null() && (*prev).top() == (*current).base {
                (*prev).pages += (*current).pages;
                unlink(&mut (*lists).free, current);
                if let Some(emptied) = slab::release_range_descriptor(current) {
                    unlink(&mut (*lists).used, emptied);
                    pending.push(emptied);
                }
                current = prev;
            }

            // Merge with the following free neighbor. No `else`: the
            // result of the previous merge may also touch its successor.
            let next = (*current).next;
            if !next.is_null() && (*current).top() == (*next).base {
                (*current).pages += (*next).pages;
                unlink(&mut (*lists).free, next);
                if let Some(emptied) = slab::release_range_descriptor(next) {
                    unlink(&mut (*lists).used, emptied);
                    pending.push(emptied);
                }
            }

            match pending.pop() {
                Some(r) => current = r,
                None => break,
            }
        }
    }
    Ok(())
}

/// Allocate `pages` pages of kernel virtual space; returns the base
/// address. See [`new_range`] for the flags.
pub fn alloc(pages: usize, flags: AllocFlags) -> KernelResult<VirtAddr> {
    let range = new_range(pages, flags)?;
    // SAFETY: a freshly returned range is live.
    Ok(unsafe { (*range).base })
}

/// Free a range by its base address. Refuses addresses that are not the
/// base of a used range, and ranges owned by a slab.
pub fn free(vaddr: VirtAddr) -> KernelResult<()> {
    // One critical section across lookup and deletion.
    let _irq = IrqGuard::new();

    // SAFETY: critical section held.
    let range = unsafe { lookup_range(vaddr) };
    if range.is_null() {
        return Err(KernelError::Invalid);
    }
    // SAFETY: `range` is a live used range.
    unsafe {
        if (*range).base != vaddr {
            return Err(KernelError::Invalid);
        }
        if !(*range).slab.is_null() {
            return Err(KernelError::Busy);
        }
    }
    del_range(range)
}

/// Bind `range` to the slab it stores (or null). Used by the slab layer.
pub(crate) fn set_slab(range: *mut KmemRange, slab: *mut Slab) {
    let _irq = IrqGuard::new();
    // SAFETY: the slab layer passes a live range it owns.
    unsafe {
        (*range).slab = slab;
    }
}

/// The slab storing `vaddr`, if the address belongs to a slab's range.
pub fn resolve_slab(vaddr: VirtAddr) -> *mut Slab {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held.
    let range = unsafe { lookup_range(vaddr) };
    if range.is_null() {
        return core::ptr::null_mut();
    }
    // SAFETY: live used range.
    unsafe { (*range).slab }
}

/// The used range covering `vaddr`, or null. Used by the demand-paging
/// path.
pub(crate) fn range_covering(vaddr: VirtAddr) -> *mut KmemRange {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held.
    unsafe { lookup_range(vaddr) }
}

/// Does `vaddr` fall inside any used range? This is what the page-fault
/// handler consults before committing a frame.
pub fn is_valid(vaddr: VirtAddr) -> bool {
    !range_covering(vaddr).is_null()
}

/// Host/test support: snapshot of `(base, pages)` for every range on the
/// free and used lists, in list order.
#[cfg(not(target_os = "none"))]
pub fn snapshot() -> (std::vec::Vec<(VirtAddr, usize)>, std::vec::Vec<(VirtAddr, usize)>) {
    let _irq = IrqGuard::new();
    let collect = |mut cursor: *mut KmemRange| {
        let mut out = std::vec::Vec::new();
        while !cursor.is_null() {
            // SAFETY: critical section held; list nodes are live.
            let r = unsafe { &*cursor };
            out.push((r.base, r.pages));
            cursor = r.next;
        }
        out
    };
    // SAFETY: critical section held.
    unsafe {
        let lists = &mut *LISTS.as_mut_ptr();
        (collect(lists.free), collect(lists.used))
    }
}

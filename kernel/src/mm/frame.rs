//! Physical page-frame allocator.
//!
//! One descriptor per frame of RAM, stored in an array placed immediately
//! after the kernel image at boot. A frame is either *free* (refcount 0,
//! on the free list) or *referenced* (refcount > 0, on the used list);
//! both lists are doubly linked through index fields in the descriptor.
//! Every structural operation runs with interrupts disabled and is O(1).

use crate::{
    config::{BIOS_VIDEO_END, BIOS_VIDEO_START},
    error::{KernelError, KernelResult},
    sync::irqlock::IrqMutex,
};

use super::{page_align_down, page_align_up, PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// Sentinel index terminating the intrusive lists.
const NIL: u32 = u32::MAX;

/// Descriptor of one physical frame.
#[repr(C)]
pub struct FrameDescr {
    /// Page-aligned base address of the frame.
    paddr: PhysAddr,
    /// Number of live references: page-table entries pointing at the
    /// frame, plus one if a virtual range claimed it. Zero means free.
    refcount: u32,
    /// The kernel virtual range owning this frame, if any. Never used for
    /// ownership, only for the reverse lookup (`range_of`).
    range: *mut super::vmm::KmemRange,
    prev: u32,
    next: u32,
}

/// Allocator state over the descriptor array.
pub struct FrameAllocator {
    descr: *mut FrameDescr,
    /// First valid allocatable address (page 0 is reserved so that a null
    /// physical address can mean "no frame").
    base: PhysAddr,
    /// Exclusive top of RAM.
    top: PhysAddr,
    free_head: u32,
    used_head: u32,
    used_tail: u32,
    total_frames: usize,
    used_frames: usize,
    free_frames: usize,
}

// SAFETY: the raw pointers reference the static descriptor array (or a
// test arena); all accesses run inside interrupt-off critical sections on
// a single CPU, or under the host test lock.
unsafe impl Send for FrameAllocator {}

/// Snapshot of the allocator counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

impl FrameAllocator {
    pub const fn empty() -> Self {
        Self {
            descr: core::ptr::null_mut(),
            base: 0,
            top: 0,
            free_head: NIL,
            used_head: NIL,
            used_tail: NIL,
            total_frames: 0,
            used_frames: 0,
            free_frames: 0,
        }
    }

    /// Build the allocator over `descr`, classifying every page of
    /// `[0, ram_size)`: page 0 reserved, the BIOS/video window and the
    /// kernel area (`kernel_base..kernel_top`, which includes the
    /// descriptor array itself) referenced, everything else free.
    ///
    /// # Safety
    ///
    /// `descr` must point to writable memory large enough for
    /// `ram_size / PAGE_SIZE` descriptors, exclusively owned by the
    /// allocator from now on.
    pub unsafe fn setup(
        descr: *mut FrameDescr,
        ram_size: usize,
        kernel_base: PhysAddr,
        kernel_top: PhysAddr,
    ) -> Self {
        let ram_size = page_align_down(ram_size);
        let mut alloc = Self {
            descr,
            base: PAGE_SIZE,
            top: ram_size,
            ..Self::empty()
        };

        let nframes = ram_size >> PAGE_SHIFT;
        for idx in 0..nframes as u32 {
            let paddr = (idx as usize) << PAGE_SHIFT;
            // SAFETY: `idx` is within the descriptor array per the
            // function contract.
            unsafe {
                alloc.descr.add(idx as usize).write(FrameDescr {
                    paddr,
                    refcount: 0,
                    range: core::ptr::null_mut(),
                    prev: NIL,
                    next: NIL,
                });
            }
            alloc.total_frames += 1;

            let reserved = paddr < alloc.base;
            let hardware = (BIOS_VIDEO_START..BIOS_VIDEO_END).contains(&paddr);
            let kernel = (kernel_base..kernel_top).contains(&paddr);
            if reserved {
                // Not on any list: never handed out, never released.
            } else if hardware || kernel {
                alloc.descr_mut(idx).refcount = 1;
                alloc.used_push_tail(idx);
                alloc.used_frames += 1;
            } else {
                alloc.free_push_head(idx);
                alloc.free_frames += 1;
            }
        }
        alloc
    }

    fn descr_mut(&mut self, idx: u32) -> &mut FrameDescr {
        // SAFETY: every index handed around internally is below the frame
        // count established at setup.
        unsafe { &mut *self.descr.add(idx as usize) }
    }

    /// Index of the descriptor for `paddr`, or `Invalid` when the address
    /// is unaligned or out of bounds.
    fn index_of(&self, paddr: PhysAddr) -> KernelResult<u32> {
        if !super::is_page_aligned(paddr) {
            return Err(KernelError::Invalid);
        }
        if paddr < self.base || paddr >= self.top {
            return Err(KernelError::Invalid);
        }
        Ok((paddr >> PAGE_SHIFT) as u32)
    }

    fn free_push_head(&mut self, idx: u32) {
        let old = self.free_head;
        {
            let d = self.descr_mut(idx);
            d.prev = NIL;
            d.next = old;
        }
        if old != NIL {
            self.descr_mut(old).prev = idx;
        }
        self.free_head = idx;
    }

    fn free_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let d = self.descr_mut(idx);
            (d.prev, d.next)
        };
        if prev != NIL {
            self.descr_mut(prev).next = next;
        } else {
            self.free_head = next;
        }
        if next != NIL {
            self.descr_mut(next).prev = prev;
        }
        let d = self.descr_mut(idx);
        d.prev = NIL;
        d.next = NIL;
    }

    fn used_push_tail(&mut self, idx: u32) {
        let old_tail = self.used_tail;
        {
            let d = self.descr_mut(idx);
            d.prev = old_tail;
            d.next = NIL;
        }
        if old_tail != NIL {
            self.descr_mut(old_tail).next = idx;
        } else {
            self.used_head = idx;
        }
        self.used_tail = idx;
    }

    fn used_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let d = self.descr_mut(idx);
            (d.prev, d.next)
        };
        if prev != NIL {
            self.descr_mut(prev).next = next;
        } else {
            self.used_head = next;
        }
        if next != NIL {
            self.descr_mut(next).prev = prev;
        } else {
            self.used_tail = prev;
        }
        let d = self.descr_mut(idx);
        d.prev = NIL;
        d.next = NIL;
    }

    /// Take a free frame, set its refcount to 1 and return its address.
    ///
    /// `_can_block` is accepted for interface symmetry: with no swapper
    /// there is nothing to wait for, so exhaustion is always
    /// `OutOfMemory`.
    pub fn ref_new(&mut self, _can_block: bool) -> KernelResult<PhysAddr> {
        let idx = self.free_head;
        if idx == NIL {
            return Err(KernelError::OutOfMemory);
        }
        self.free_unlink(idx);
        let paddr = {
            let d = self.descr_mut(idx);
            assert!(d.refcount == 0, "frame on the free list with references");
            d.refcount = 1;
            d.paddr
        };
        self.used_push_tail(idx);
        self.free_frames -= 1;
        self.used_frames += 1;
        Ok(paddr)
    }

    /// Add a reference to the frame at `paddr`. Returns `true` when the
    /// frame was already referenced, `false` when this is the first
    /// reference (the frame just left the free list).
    pub fn ref_at(&mut self, paddr: PhysAddr) -> KernelResult<bool> {
        let idx = self.index_of(paddr)?;
        let newly_referenced = {
            let d = self.descr_mut(idx);
            d.refcount += 1;
            d.refcount == 1
        };
        if newly_referenced {
            self.free_unlink(idx);
            self.used_push_tail(idx);
            self.free_frames -= 1;
            self.used_frames += 1;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Drop a reference. Returns `true` when the frame became free and
    /// moved to the free list, `false` while references remain.
    pub fn unref(&mut self, paddr: PhysAddr) -> KernelResult<bool> {
        let idx = self.index_of(paddr)?;
        {
            let d = self.descr_mut(idx);
            if d.refcount == 0 {
                return Err(KernelError::Invalid);
            }
            d.refcount -= 1;
            if d.refcount > 0 {
                return Ok(false);
            }
        }
        self.used_unlink(idx);
        self.free_push_head(idx);
        self.used_frames -= 1;
        self.free_frames += 1;
        Ok(true)
    }

    /// Record the virtual range owning the frame at `paddr`.
    pub fn set_range(
        &mut self,
        paddr: PhysAddr,
        range: *mut super::vmm::KmemRange,
    ) -> KernelResult<()> {
        let idx = self.index_of(paddr)?;
        self.descr_mut(idx).range = range;
        Ok(())
    }

    /// Reverse lookup: the virtual range owning the frame at `paddr`, or
    /// null.
    pub fn range_of(&mut self, paddr: PhysAddr) -> *mut super::vmm::KmemRange {
        match self.index_of(paddr) {
            Ok(idx) => self.descr_mut(idx).range,
            Err(_) => core::ptr::null_mut(),
        }
    }

    /// Current reference count of the frame at `paddr`.
    pub fn refcount(&mut self, paddr: PhysAddr) -> KernelResult<u32> {
        let idx = self.index_of(paddr)?;
        Ok(self.descr_mut(idx).refcount)
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames,
            used: self.used_frames,
            free: self.free_frames,
        }
    }
}

static FRAME_ALLOCATOR: IrqMutex<FrameAllocator> = IrqMutex::new(FrameAllocator::empty());

/// Install the global allocator with the descriptor array at an explicit
/// location. Returns `(kernel_base, kernel_top)` unchanged for symmetry
/// with [`setup_global`].
///
/// # Safety
///
/// As for [`FrameAllocator::setup`]; additionally no other frame operation
/// may be running.
pub unsafe fn setup_global_at(
    descr: *mut FrameDescr,
    ram_size: usize,
    kernel_base: PhysAddr,
    kernel_top: PhysAddr,
) -> (PhysAddr, PhysAddr) {
    // SAFETY: forwarded contract.
    let alloc = unsafe { FrameAllocator::setup(descr, ram_size, kernel_base, kernel_top) };
    *FRAME_ALLOCATOR.lock() = alloc;
    (kernel_base, kernel_top)
}

/// Boot-time setup: place the descriptor array immediately after the
/// kernel image and classify all of RAM. Returns the final
/// `(kernel_core_base, kernel_core_top)` covering the image plus the
/// descriptor array, or `OutOfMemory` when RAM cannot even hold the
/// descriptors.
///
/// # Safety
///
/// `image_base..image_end` must delimit the loaded kernel image, with the
/// memory after `image_end` (up to the end of the descriptor array) unused
/// and writable at its identity address.
pub unsafe fn setup_global(
    ram_size: usize,
    image_base: PhysAddr,
    image_end: PhysAddr,
) -> KernelResult<(PhysAddr, PhysAddr)> {
    let ram_size = page_align_down(ram_size);
    let descr_base = page_align_up(image_end);
    let nframes = ram_size >> PAGE_SHIFT;
    let core_base = page_align_down(image_base);
    let core_top = page_align_up(descr_base + nframes * core::mem::size_of::<FrameDescr>());
    if core_top > ram_size {
        return Err(KernelError::OutOfMemory);
    }
    // SAFETY: the descriptor area lies between the image end and
    // `core_top`, which the caller guarantees to be unused identity-mapped
    // memory.
    unsafe {
        setup_global_at(descr_base as *mut FrameDescr, ram_size, core_base, core_top);
    }
    Ok((core_base, core_top))
}

/// See [`FrameAllocator::ref_new`].
pub fn ref_new(can_block: bool) -> KernelResult<PhysAddr> {
    FRAME_ALLOCATOR.lock().ref_new(can_block)
}

/// See [`FrameAllocator::ref_at`].
pub fn ref_at(paddr: PhysAddr) -> KernelResult<bool> {
    FRAME_ALLOCATOR.lock().ref_at(paddr)
}

/// See [`FrameAllocator::unref`].
pub fn unref(paddr: PhysAddr) -> KernelResult<bool> {
    FRAME_ALLOCATOR.lock().unref(paddr)
}

/// See [`FrameAllocator::set_range`].
pub fn set_range(paddr: PhysAddr, range: *mut super::vmm::KmemRange) -> KernelResult<()> {
    FRAME_ALLOCATOR.lock().set_range(paddr, range)
}

/// See [`FrameAllocator::range_of`].
pub fn range_of(paddr: PhysAddr) -> *mut super::vmm::KmemRange {
    FRAME_ALLOCATOR.lock().range_of(paddr)
}

/// See [`FrameAllocator::refcount`].
pub fn refcount(paddr: PhysAddr) -> KernelResult<u32> {
    FRAME_ALLOCATOR.lock().refcount(paddr)
}

/// Global allocator counters.
pub fn stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().stats()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    const TEST_RAM: usize = 2 << 20; // 2 MiB: 512 frames
    const TEST_KERNEL_BASE: usize = 0x10000;
    const TEST_KERNEL_TOP: usize = 0x20000; // 16 kernel pages
    // The BIOS/video window 0xa0000..0x100000 covers 96 of the 512 frames.
    const TEST_BIOS_PAGES: usize = (BIOS_VIDEO_END - BIOS_VIDEO_START) >> PAGE_SHIFT;

    fn make_allocator(arena: &mut Vec<FrameDescr>) -> FrameAllocator {
        arena.clear();
        arena.reserve(TEST_RAM >> PAGE_SHIFT);
        // SAFETY: the arena provides enough writable descriptors; fake
        // physical addresses are never dereferenced.
        unsafe {
            FrameAllocator::setup(
                arena.as_mut_ptr(),
                TEST_RAM,
                TEST_KERNEL_BASE,
                TEST_KERNEL_TOP,
            )
        }
    }

    #[test]
    fn test_setup_classification() {
        let mut arena = Vec::new();
        let alloc = make_allocator(&mut arena);
        let stats = alloc.stats();
        assert_eq!(stats.total, 512);
        assert_eq!(stats.used, 16 + TEST_BIOS_PAGES); // kernel + BIOS window
        // Page 0 is reserved and sits on neither list.
        assert_eq!(stats.free, 512 - stats.used - 1);
    }

    #[test]
    fn test_ref_new_until_exhaustion_then_release() {
        let mut arena = Vec::new();
        let mut alloc = make_allocator(&mut arena);
        let initially_free = alloc.stats().free;

        let mut got = Vec::new();
        loop {
            match alloc.ref_new(true) {
                Ok(paddr) => got.push(paddr),
                Err(e) => {
                    assert_eq!(e, KernelError::OutOfMemory);
                    break;
                }
            }
        }
        assert_eq!(got.len(), initially_free);
        assert_eq!(alloc.stats().free, 0);

        // No duplicate frame was handed out.
        let mut sorted = got.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), got.len());

        // Release in FIFO order; allocate again: every address seen on the
        // second round already appeared in the first.
        for &paddr in &got {
            assert!(alloc.unref(paddr).expect("release must succeed"));
        }
        assert_eq!(alloc.stats().free, initially_free);
        for _ in 0..initially_free {
            let paddr = alloc.ref_new(true).expect("second round must succeed");
            assert!(sorted.binary_search(&paddr).is_ok());
        }
    }

    #[test]
    fn test_refcounting_tracks_free_list_membership() {
        let mut arena = Vec::new();
        let mut alloc = make_allocator(&mut arena);

        let paddr = alloc.ref_new(false).unwrap();
        assert_eq!(alloc.refcount(paddr).unwrap(), 1);

        // Second reference: already referenced.
        assert!(alloc.ref_at(paddr).unwrap());
        assert_eq!(alloc.refcount(paddr).unwrap(), 2);

        // First unref: still referenced.
        assert!(!alloc.unref(paddr).unwrap());
        // Second unref: frees the frame.
        assert!(alloc.unref(paddr).unwrap());
        assert_eq!(alloc.refcount(paddr).unwrap(), 0);

        // Over-release is rejected.
        assert_eq!(alloc.unref(paddr), Err(KernelError::Invalid));

        // Referencing a free frame at a known address revives it.
        assert!(!alloc.ref_at(paddr).unwrap());
        assert!(alloc.unref(paddr).unwrap());
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let mut arena = Vec::new();
        let mut alloc = make_allocator(&mut arena);
        assert_eq!(alloc.ref_at(0x1001), Err(KernelError::Invalid)); // unaligned
        assert_eq!(alloc.ref_at(0), Err(KernelError::Invalid)); // reserved page
        assert_eq!(alloc.ref_at(TEST_RAM), Err(KernelError::Invalid)); // beyond RAM
    }

    #[test]
    fn test_range_backpointer_roundtrip() {
        let mut arena = Vec::new();
        let mut alloc = make_allocator(&mut arena);
        let paddr = alloc.ref_new(false).unwrap();

        let marker = 0x1234 as *mut crate::mm::vmm::KmemRange;
        alloc.set_range(paddr, marker).unwrap();
        assert_eq!(alloc.range_of(paddr), marker);
        alloc.set_range(paddr, core::ptr::null_mut()).unwrap();
        assert!(alloc.range_of(paddr).is_null());
        alloc.unref(paddr).unwrap();
    }
}

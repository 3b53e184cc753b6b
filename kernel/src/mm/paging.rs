//! Two-level page tables with a self-mapping window.
//!
//! One fixed slot of the page directory points back at the directory
//! itself. Through that window the active directory appears at a fixed
//! virtual address and the page table for directory slot `i` at that base
//! plus `i` pages, so the tables are always read and written through plain
//! pointers, never through temporary mappings.
//!
//! On the host build the same API is backed by a mapping table so that the
//! upper memory layers (ranges, slabs, kmalloc, demand paging) can be
//! exercised by the test harness; reference-count side effects on the
//! frame allocator are identical.

use bitflags::bitflags;

use crate::{
    config::{MIRROR_SIZE, MIRROR_VADDR},
    error::{KernelError, KernelResult},
};

use super::{frame, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    /// Bits of a page-directory or page-table entry (they share the
    /// layout that matters here). See the Intel manuals, vol. 3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLED = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
    }
}

bitflags! {
    /// Flags accepted by [`map`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Never suspend while mapping (no blocking frame allocation).
        const ATOMIC = 1 << 2;
    }
}

/// Access rights of a mapped page, as reported by [`get_prot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Read,
    ReadWrite,
}

/// A raw page-directory / page-table entry: flags in the low bits, the
/// 20-bit frame number above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    pub fn new(paddr: PhysAddr, flags: EntryFlags) -> Self {
        debug_assert!(paddr & PAGE_MASK == 0);
        Self(paddr as u32 | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & EntryFlags::WRITE.bits() != 0
    }

    /// Base address of the referenced frame.
    pub fn frame(&self) -> PhysAddr {
        (self.0 as usize) & !PAGE_MASK
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Page-directory slot covering `vaddr` (top 10 bits).
pub const fn pd_index(vaddr: VirtAddr) -> usize {
    vaddr >> 22
}

/// Page-table slot covering `vaddr` (middle 10 bits).
pub const fn pt_index(vaddr: VirtAddr) -> usize {
    (vaddr >> PAGE_SHIFT) & 0x3ff
}

/// True when `vaddr` falls inside the self-map window, which no mapping
/// operation may touch.
pub fn in_mirror(vaddr: VirtAddr) -> bool {
    (MIRROR_VADDR..MIRROR_VADDR + MIRROR_SIZE).contains(&vaddr)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use super::*;

    /// Virtual address of the page table serving directory slot `index`,
    /// seen through the mirror.
    fn mirror_table(index: usize) -> *mut Entry {
        (MIRROR_VADDR + index * PAGE_SIZE) as *mut Entry
    }

    /// Virtual address of the page directory itself: the mirror applied
    /// to its own slot.
    fn mirror_directory() -> *mut Entry {
        mirror_table(pd_index(MIRROR_VADDR))
    }

    fn invlpg(vaddr: VirtAddr) {
        // SAFETY: invlpg only drops a TLB entry.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
    }

    /// Identity-map `paddr` at `vaddr` while paging is still off, reading
    /// tables through their physical addresses.
    ///
    /// # Safety
    ///
    /// Paging must be disabled; `pd` must point at the directory under
    /// construction.
    unsafe fn setup_map_identity(pd: *mut Entry, paddr: PhysAddr) -> KernelResult<()> {
        let pde_idx = pd_index(paddr);
        let pte_idx = pt_index(paddr);
        // SAFETY: paging is off, so the directory and tables are reachable
        // at their physical addresses.
        unsafe {
            let pde = pd.add(pde_idx);
            let pt = if (*pde).is_present() {
                let pt = (*pde).frame() as *mut Entry;
                // New entry in an existing table: the table gains one
                // reference. (The setup scan walks strictly increasing
                // addresses, so it never remaps an entry.)
                assert!(!(*pt.add(pte_idx)).is_present());
                frame::ref_at((*pde).frame())?;
                pt
            } else {
                // A fresh table; its initial reference stands for the
                // entry written below.
                let pt_frame = frame::ref_new(false)?;
                core::ptr::write_bytes(pt_frame as *mut u8, 0, PAGE_SIZE);
                pde.write(Entry::new(
                    pt_frame,
                    EntryFlags::PRESENT | EntryFlags::WRITE,
                ));
                pt_frame as *mut Entry
            };
            // The identity-mapped kernel and BIOS pages already carry
            // their reference from the frame-allocator setup.
            pt.add(pte_idx)
                .write(Entry::new(paddr, EntryFlags::PRESENT | EntryFlags::WRITE));
        }
        Ok(())
    }

    /// Build the initial address space and switch the MMU on: identity-map
    /// the kernel area and the BIOS/video window, install the self-map,
    /// load cr3 and set the paging + write-protect bits.
    ///
    /// # Safety
    ///
    /// Must run once at boot, before paging is enabled, with the frame
    /// allocator initialized over identity-mapped RAM.
    pub unsafe fn setup(identity_base: PhysAddr, identity_top: PhysAddr) -> KernelResult<()> {
        use crate::config::{BIOS_VIDEO_END, BIOS_VIDEO_START};

        let pd_frame = frame::ref_new(false)?;
        // SAFETY: paging is off; the fresh frame is identity-reachable.
        unsafe {
            core::ptr::write_bytes(pd_frame as *mut u8, 0, PAGE_SIZE);
            let pd = pd_frame as *mut Entry;

            let mut paddr = super::super::page_align_down(identity_base);
            while paddr < identity_top {
                setup_map_identity(pd, paddr)?;
                paddr += PAGE_SIZE;
            }
            let mut paddr = BIOS_VIDEO_START;
            while paddr < BIOS_VIDEO_END {
                setup_map_identity(pd, paddr)?;
                paddr += PAGE_SIZE;
            }

            // The self-map: one directory slot pointing at the directory.
            pd.add(pd_index(MIRROR_VADDR)).write(Entry::new(
                pd_frame,
                EntryFlags::PRESENT | EntryFlags::WRITE,
            ));

            // Load the directory and enable paging + write protection.
            core::arch::asm!(
                "mov cr3, {pd}",
                "mov {tmp}, cr0",
                "or {tmp}, 0x80010000",
                "mov cr0, {tmp}",
                pd = in(reg) pd_frame,
                tmp = out(reg) _,
                options(nostack),
            );
        }
        Ok(())
    }

    pub fn map(
        paddr: PhysAddr,
        vaddr: VirtAddr,
        user: bool,
        flags: VmFlags,
    ) -> KernelResult<()> {
        if in_mirror(vaddr) {
            return Err(KernelError::Invalid);
        }
        let pde_idx = pd_index(vaddr);
        let pte_idx = pt_index(vaddr);
        // SAFETY: the mirror window makes the directory and each present
        // table addressable at fixed virtual addresses; interrupts are off
        // in the callers' critical sections on this single CPU.
        unsafe {
            let pd = mirror_directory();
            let pt = mirror_table(pde_idx);

            if !(*pd.add(pde_idx)).is_present() {
                // Allocate a table for this 4 MiB region.
                let pt_frame = frame::ref_new(!flags.contains(VmFlags::ATOMIC))?;
                let mut pde_flags = EntryFlags::PRESENT | EntryFlags::WRITE;
                if user {
                    pde_flags |= EntryFlags::USER;
                }
                pd.add(pde_idx).write(Entry::new(pt_frame, pde_flags));
                // The table is now visible through the mirror.
                invlpg(pt as usize);
                core::ptr::write_bytes(pt as *mut u8, 0, PAGE_SIZE);
            } else if !(*pt.add(pte_idx)).is_present() {
                // New entry in an existing table: the table gains a
                // reference.
                frame::ref_at((*pd.add(pde_idx)).frame())?;
            } else {
                // Replacing a live mapping implicitly unmaps the old
                // frame.
                frame::unref((*pt.add(pte_idx)).frame())?;
            }

            let mut pte_flags = EntryFlags::PRESENT;
            if flags.contains(VmFlags::WRITE) {
                pte_flags |= EntryFlags::WRITE;
            }
            if user {
                pte_flags |= EntryFlags::USER;
            }
            pt.add(pte_idx).write(Entry::new(paddr, pte_flags));
            frame::ref_at(paddr)?;
            invlpg(vaddr);
        }
        Ok(())
    }

    pub fn unmap(vaddr: VirtAddr) -> KernelResult<()> {
        if in_mirror(vaddr) {
            return Err(KernelError::Invalid);
        }
        let pde_idx = pd_index(vaddr);
        let pte_idx = pt_index(vaddr);
        // SAFETY: as in `map`.
        unsafe {
            let pd = mirror_directory();
            let pt = mirror_table(pde_idx);

            if !(*pd.add(pde_idx)).is_present() {
                return Err(KernelError::Invalid);
            }
            if !(*pt.add(pte_idx)).is_present() {
                return Err(KernelError::Invalid);
            }

            frame::unref((*pt.add(pte_idx)).frame())?;
            pt.add(pte_idx).write(Entry::EMPTY);
            invlpg(vaddr);

            // Drop the PTE's reference on its table; free the table and
            // its directory slot once the last entry is gone.
            let table_free = frame::unref((*pd.add(pde_idx)).frame())?;
            if table_free {
                pd.add(pde_idx).write(Entry::EMPTY);
                invlpg(pt as usize);
            }
        }
        Ok(())
    }

    pub fn get_prot(vaddr: VirtAddr) -> Protection {
        let pde_idx = pd_index(vaddr);
        let pte_idx = pt_index(vaddr);
        // SAFETY: as in `map`; reads only.
        unsafe {
            let pd = mirror_directory();
            if !(*pd.add(pde_idx)).is_present() {
                return Protection::None;
            }
            let pt = mirror_table(pde_idx);
            let pte = *pt.add(pte_idx);
            if !pte.is_present() {
                return Protection::None;
            }
            if (*pd.add(pde_idx)).is_writable() && pte.is_writable() {
                Protection::ReadWrite
            } else {
                Protection::Read
            }
        }
    }

    pub fn get_paddr(vaddr: VirtAddr) -> Option<PhysAddr> {
        let pde_idx = pd_index(vaddr);
        let pte_idx = pt_index(vaddr);
        // SAFETY: as in `map`; reads only.
        unsafe {
            let pd = mirror_directory();
            if !(*pd.add(pde_idx)).is_present() {
                return None;
            }
            let pt = mirror_table(pde_idx);
            let pte = *pt.add(pte_idx);
            if !pte.is_present() {
                return None;
            }
            Some(pte.frame() + (vaddr & PAGE_MASK))
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    use alloc::collections::BTreeMap;

    use super::*;

    struct HostMapping {
        paddr: PhysAddr,
        writable: bool,
    }

    /// Flat stand-in for the page tables: virtual page -> mapping.
    static MAPPINGS: spin::Mutex<BTreeMap<VirtAddr, HostMapping>> =
        spin::Mutex::new(BTreeMap::new());

    /// Host shim: forget every mapping (fresh address space for a test
    /// run).
    pub fn reset() {
        MAPPINGS.lock().clear();
    }

    pub fn map(
        paddr: PhysAddr,
        vaddr: VirtAddr,
        _user: bool,
        flags: VmFlags,
    ) -> KernelResult<()> {
        if in_mirror(vaddr) {
            return Err(KernelError::Invalid);
        }
        let page = super::super::page_align_down(vaddr);
        let mut mappings = MAPPINGS.lock();
        if let Some(old) = mappings.get(&page) {
            frame::unref(old.paddr)?;
        }
        frame::ref_at(paddr)?;
        mappings.insert(
            page,
            HostMapping {
                paddr,
                writable: flags.contains(VmFlags::WRITE),
            },
        );
        Ok(())
    }

    pub fn unmap(vaddr: VirtAddr) -> KernelResult<()> {
        if in_mirror(vaddr) {
            return Err(KernelError::Invalid);
        }
        let page = super::super::page_align_down(vaddr);
        let mut mappings = MAPPINGS.lock();
        match mappings.remove(&page) {
            Some(old) => {
                frame::unref(old.paddr)?;
                Ok(())
            }
            None => Err(KernelError::Invalid),
        }
    }

    pub fn get_prot(vaddr: VirtAddr) -> Protection {
        let page = super::super::page_align_down(vaddr);
        match MAPPINGS.lock().get(&page) {
            Some(m) if m.writable => Protection::ReadWrite,
            Some(_) => Protection::Read,
            None => Protection::None,
        }
    }

    pub fn get_paddr(vaddr: VirtAddr) -> Option<PhysAddr> {
        let page = super::super::page_align_down(vaddr);
        MAPPINGS
            .lock()
            .get(&page)
            .map(|m| m.paddr + (vaddr & PAGE_MASK))
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use imp::setup;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use imp::reset;

pub use imp::{get_paddr, get_prot, map, unmap};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_entry_bit_layout() {
        let e = Entry::new(0x12345000, EntryFlags::PRESENT | EntryFlags::WRITE);
        assert_eq!(e.raw() & 1, 1); // present is bit 0
        assert_eq!(e.raw() & 2, 2); // write is bit 1
        assert_eq!(e.raw() & 4, 0); // user is bit 2
        assert_eq!(e.frame(), 0x12345000);
        assert!(e.is_present());
        assert!(e.is_writable());

        let user = Entry::new(0x1000, EntryFlags::PRESENT | EntryFlags::USER);
        assert_eq!(user.raw(), 0x1000 | 1 | 4);
        assert!(!Entry::EMPTY.is_present());
    }

    #[test]
    fn test_virtual_address_split() {
        // 10 bits directory, 10 bits table, 12 bits offset.
        let vaddr = 0b1111111111_0000000001_000000000011usize;
        assert_eq!(pd_index(vaddr), 0x3ff);
        assert_eq!(pt_index(vaddr), 1);
        assert_eq!(vaddr & PAGE_MASK, 3);

        assert_eq!(pd_index(MIRROR_VADDR), MIRROR_VADDR >> 22);
        assert_eq!(pt_index(0x0040_3000), 3);
    }

    #[test]
    fn test_mirror_window_detection() {
        assert!(in_mirror(MIRROR_VADDR));
        assert!(in_mirror(MIRROR_VADDR + MIRROR_SIZE - 1));
        assert!(!in_mirror(MIRROR_VADDR - 1));
        assert!(!in_mirror(MIRROR_VADDR + MIRROR_SIZE));
    }
}

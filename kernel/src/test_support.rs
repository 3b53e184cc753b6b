//! Host-side test support.
//!
//! Compiled only when the crate is built for the host. Brings the global
//! kernel up exactly once over a leaked arena, following the same
//! initialization order the bare-metal boot uses (with the hardware
//! layers replaced by their host shims), and serializes tests that touch
//! global state.
//!
//! The "physical" address space is a fictional 4 MiB of RAM whose frame
//! addresses are never dereferenced; the kernel *virtual* space is a real
//! chunk of process memory, so slab objects and kmalloc blocks are
//! genuinely readable and writable.

use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::{
    config::TICK_NSEC,
    mm::{frame, kmalloc, vmm, PAGE_SIZE},
    sched::{scheduler, thread},
    time::{self, Time},
};

/// Size of the fictional physical RAM (1024 frames, as in the exhaustion
/// scenario).
pub const TEST_RAM: usize = 4 << 20;

/// Fictional physical extent of the kernel image + descriptors.
pub const TEST_KERNEL_PHYS_BASE: usize = 0x10000;
pub const TEST_KERNEL_PHYS_TOP: usize = 0x30000;

/// Size of the virtual arena backing the kernel virtual space.
const ARENA_SIZE: usize = 32 << 20;

/// Where things ended up inside the arena.
#[derive(Debug, Clone, Copy)]
pub struct ArenaInfo {
    pub vmm_base: usize,
    pub vmm_top: usize,
    pub kernel_base: usize,
    pub kernel_top: usize,
    pub stack_base: usize,
    pub stack_top: usize,
}

static LOCK: Mutex<()> = Mutex::new(());
static ARENA: OnceLock<ArenaInfo> = OnceLock::new();

/// Serialize a test that touches kernel globals.
pub fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bring the global kernel up (idempotent). Callers that mutate global
/// state must also hold [`lock`].
pub fn init_kernel() -> ArenaInfo {
    *ARENA.get_or_init(|| {
        // A page-aligned, never-freed arena standing in for the kernel
        // virtual space.
        let layout = std::alloc::Layout::from_size_align(ARENA_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size; the arena is intentionally
        // leaked.
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
        assert!(base != 0);

        let info = ArenaInfo {
            vmm_base: base,
            vmm_top: base + ARENA_SIZE,
            kernel_base: base,
            // 64 KiB of pretend kernel image, with the pretend bootstrap
            // stack inside it.
            kernel_top: base + 0x10000,
            stack_base: base + 0x8000,
            stack_top: base + 0xc000,
        };

        // Frame descriptors live in their own leaked block.
        let nframes = TEST_RAM / PAGE_SIZE;
        let descr_layout = std::alloc::Layout::array::<frame::FrameDescr>(nframes).unwrap();
        // SAFETY: non-zero size; intentionally leaked.
        let descr = unsafe { std::alloc::alloc_zeroed(descr_layout) } as *mut frame::FrameDescr;
        assert!(!descr.is_null());

        // The bare-metal initialization order, minus the hardware.
        time::setup(Time::new(0, TICK_NSEC as u32));
        // SAFETY: the descriptor block is exclusively the allocator's.
        unsafe {
            frame::setup_global_at(descr, TEST_RAM, TEST_KERNEL_PHYS_BASE, TEST_KERNEL_PHYS_TOP);
        }
        crate::mm::paging::reset();
        let layout = vmm::KmemLayout {
            vmm_base: info.vmm_base,
            vmm_top: info.vmm_top,
            hw: None,
            kernel_base: info.kernel_base,
            stack_base: info.stack_base,
            stack_top: info.stack_top,
            kernel_top: info.kernel_top,
        };
        // SAFETY: single initialization, guarded by the OnceLock.
        unsafe {
            vmm::setup(&layout).expect("range-allocator setup");
        }
        kmalloc::setup().expect("kmalloc setup");
        scheduler::setup();
        thread::setup(info.stack_base, info.stack_top - info.stack_base)
            .expect("thread subsystem setup");

        info
    })
}

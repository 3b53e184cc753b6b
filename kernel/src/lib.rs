//! OpalOS kernel.
//!
//! The core of a small teaching operating system for 32-bit protected
//! mode x86: physical frame allocation, mirror-based paging, a kernel
//! virtual-range allocator, slab caches with `kmalloc` on top, kernel
//! threads with a FIFO scheduler, wait queues, timeouts, and the blocking
//! primitives built on them.
//!
//! The crate builds for two targets. On bare metal (`target_os = "none"`,
//! i686) it is the kernel proper. On the host it links `std`, replaces
//! the hardware layers with shims, and exposes the same API so that the
//! allocator stack and the scheduling bookkeeping run under the standard
//! test harness.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

// Host target: link std and use the system allocator so tests can
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod time;

#[cfg(feature = "testing")]
pub mod test_tasks;

#[cfg(not(target_os = "none"))]
#[doc(hidden)]
pub mod test_support;

// On bare metal the kernel heap *is* kmalloc.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::kmalloc::KernelHeap = mm::kmalloc::KernelHeap;

pub use error::{KernelError, KernelResult};

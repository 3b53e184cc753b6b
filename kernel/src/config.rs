//! Compile-time kernel configuration.
//!
//! Address-space constants follow the classic PC layout: the kernel lives in
//! low memory, the BIOS/video window is identity-mapped, and the top 4 MiB
//! of the kernel virtual space are reserved for the page-table mirror.

use crate::mm::PAGE_SIZE;

/// Timer tick frequency programmed into the 8254 at boot, in Hz.
pub const TICK_HZ: u32 = 100;

/// Nanoseconds per timer tick (must match [`TICK_HZ`]).
pub const TICK_NSEC: u32 = 1_000_000_000 / TICK_HZ;

/// Size of a kernel thread stack, in bytes.
///
/// The original design used a single page; Rust formatting machinery needs
/// a little more headroom.
pub const THREAD_STACK_SIZE: usize = 2 * PAGE_SIZE;

/// Byte pattern written over a fresh thread stack when the `stack-poison`
/// feature is enabled.
pub const STACK_POISON_BYTE: u8 = 0xa5;

/// Number of bytes at the bottom of each stack checked for poison on every
/// context switch. Any deviation halts the kernel.
pub const STACK_POISON_CHECK_LEN: usize = 64;

/// Physical window of the BIOS and legacy video memory. Marked as
/// referenced in the frame allocator and identity-mapped at boot.
pub const BIOS_VIDEO_START: usize = 0xa0000;
/// Exclusive end of the BIOS/video window.
pub const BIOS_VIDEO_END: usize = 0x100000;

/// Bottom of the kernel virtual space managed by the range allocator.
/// The first pages are left out so that address 0 stays unmapped forever.
pub const KERNEL_VMM_BASE: usize = 0x4000;

/// Virtual base of the page-table mirror window. The whole window
/// ([`MIRROR_SIZE`] bytes) is off-limits to the range allocator and to
/// `map`/`unmap`.
pub const MIRROR_VADDR: usize = 0x3fc0_0000;

/// Size of the mirror window: one page per top-level slot.
pub const MIRROR_SIZE: usize = 4 << 20;

/// Exclusive top of the kernel virtual space managed by the range
/// allocator.
pub const KERNEL_VMM_TOP: usize = MIRROR_VADDR;

/// Backtrace depth printed by fatal reports.
pub const BACKTRACE_MAX_DEPTH: usize = 15;

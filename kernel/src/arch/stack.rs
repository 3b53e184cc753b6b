//! Kernel-stack poisoning.
//!
//! A fresh thread stack is filled with a known byte pattern; on every
//! context switch the bottom of the stack of the thread being resumed is
//! re-checked. A clobbered pattern means the stack overflowed at some
//! point, and the kernel halts instead of running on corrupted memory.

use crate::config::{STACK_POISON_BYTE, STACK_POISON_CHECK_LEN};

/// Fill the bottom `STACK_POISON_CHECK_LEN` bytes of the stack with the
/// poison pattern. No-op unless the `stack-poison` feature is enabled.
///
/// # Safety
///
/// `stack_base..stack_base + stack_size` must be writable memory owned by
/// the caller and not currently in use as a live stack region.
pub unsafe fn poison(stack_base: usize, stack_size: usize) {
    if !cfg!(feature = "stack-poison") {
        return;
    }
    let len = STACK_POISON_CHECK_LEN.min(stack_size);
    // SAFETY: per the function contract the region is writable and unused.
    unsafe {
        core::ptr::write_bytes(stack_base as *mut u8, STACK_POISON_BYTE, len);
    }
}

/// Check that a saved context lies within its stack and that the poison
/// pattern at the stack bottom is intact. Halts the kernel otherwise.
///
/// `ctxt_addr` is the address of the saved CPU context, which by
/// construction is the suspended thread's stack pointer.
///
/// # Safety
///
/// `stack_base..stack_base + stack_size` must be readable memory.
pub unsafe fn check(ctxt_addr: usize, ctxt_size: usize, stack_base: usize, stack_size: usize) {
    assert!(
        ctxt_addr >= stack_base && ctxt_addr + ctxt_size <= stack_base + stack_size,
        "saved context 0x{ctxt_addr:x} outside its stack 0x{stack_base:x}+0x{stack_size:x}"
    );

    if !cfg!(feature = "stack-poison") {
        return;
    }
    let len = STACK_POISON_CHECK_LEN.min(stack_size);
    for off in 0..len {
        // SAFETY: the region is readable per the function contract and
        // `off` stays below `stack_size`.
        let byte = unsafe { core::ptr::read((stack_base + off) as *const u8) };
        assert!(
            byte == STACK_POISON_BYTE,
            "stack overflow detected on stack 0x{stack_base:x} (offset {off})"
        );
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_poison_roundtrip() {
        let mut buf = [0u8; 256];
        let base = buf.as_mut_ptr() as usize;
        // SAFETY: `buf` is owned local memory.
        unsafe {
            poison(base, buf.len());
            check(base + 128, 16, base, buf.len());
        }
    }

    #[test]
    #[should_panic(expected = "outside its stack")]
    fn test_context_outside_stack_is_fatal() {
        let buf = [0u8; 256];
        let base = buf.as_ptr() as usize;
        // SAFETY: `buf` is owned local memory.
        unsafe {
            check(base + 250, 64, base, buf.len());
        }
    }

    #[cfg(feature = "stack-poison")]
    #[test]
    #[should_panic(expected = "stack overflow detected")]
    fn test_clobbered_poison_is_fatal() {
        let mut buf = [0u8; 256];
        let base = buf.as_mut_ptr() as usize;
        // SAFETY: `buf` is owned local memory.
        unsafe {
            poison(base, buf.len());
            buf[3] = 0;
            check(base + 128, 16, base, buf.len());
        }
    }
}

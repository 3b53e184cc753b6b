//! Local interrupt-flag control and interrupt-nesting bookkeeping.

use core::sync::atomic::{AtomicUsize, Ordering};

/// EFLAGS interrupt-enable bit.
const EFLAGS_IF: usize = 1 << 9;

/// Depth of interrupt handlers currently on the stack. Blocking operations
/// assert this is zero; the timer-driven preemptive switch runs only after
/// the dispatcher has unwound it.
static NESTING: AtomicUsize = AtomicUsize::new(0);

/// Save the current EFLAGS and disable interrupts. Returns the saved
/// flags, to be handed back to [`restore`].
pub fn save_and_disable() -> usize {
    let flags: usize;
    // SAFETY: pushfd/pop reads EFLAGS into a register; cli only clears IF.
    unsafe {
        core::arch::asm!("pushfd", "pop {}", "cli", out(reg) flags, options(nomem));
    }
    flags
}

/// Restore a previously saved EFLAGS value.
pub fn restore(flags: usize) {
    if flags & EFLAGS_IF != 0 {
        // SAFETY: re-enabling interrupts restores the state the caller
        // saved; the kernel structures are consistent at this point by the
        // critical-section discipline.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
}

/// Unconditionally enable interrupts (end of boot).
pub fn enable() {
    // SAFETY: only called once the IDT, PIC and handlers are installed.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// True while an interrupt handler proper is executing. Handlers may not
/// block, exit the current thread, or wait on a queue.
pub fn servicing_interrupt() -> bool {
    NESTING.load(Ordering::Relaxed) != 0
}

pub(super) fn enter() {
    NESTING.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn leave() {
    let prev = NESTING.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev != 0, "unbalanced interrupt nesting");
}

//! i686 (32-bit protected mode) hardware layer.
//!
//! Flat segmentation, 8259 PIC, 8254 timer, two-level paging (see
//! `mm::paging` for the tables themselves) and stack-resident CPU
//! contexts. Everything here assumes a single CPU.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod irq;
pub mod pic;
pub mod pit;
pub mod port;

/// Fatal stop: interrupts off, halt forever.
pub fn halt() -> ! {
    loop {
        // SAFETY: cli/hlt have no memory effects; halting is the point.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Idle-loop pause: sleep until the next interrupt.
pub fn idle_wait() {
    // SAFETY: hlt with interrupts enabled resumes on the next interrupt.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

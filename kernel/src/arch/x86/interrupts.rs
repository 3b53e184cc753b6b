//! Interrupt and exception dispatch.
//!
//! Every vector gets a naked trampoline that materializes a full
//! [`CpuContext`] on the interrupted stack (the same layout the context
//! switcher uses), calls the Rust dispatcher with `(vector, context)`, and
//! unwinds with `iretd`. Hardware interrupts are acknowledged on the PIC
//! and tracked with a nesting counter; a preemptive reschedule requested
//! by the timer handler runs only after the nesting count has unwound, so
//! a preempted thread is indistinguishable from one that yielded.

use crate::sync::cell::GlobalCell;

use super::{context::CpuContext, idt, irq, pic};

/// Number of CPU exception vectors.
pub const EXCEPTION_VECTORS: usize = 32;

/// Double fault: gets its own fatal report instead of the generic one.
pub const EXCEPTION_DOUBLE_FAULT: usize = 8;
/// Page fault: rebound to the demand-paging handler once the VMM is live.
pub const EXCEPTION_PAGE_FAULT: usize = 14;

/// Handler for a CPU exception. Runs with interrupts disabled; may fix the
/// fault and return, or halt.
pub type ExceptionHandler = fn(usize, &mut CpuContext);

/// Handler for a hardware interrupt. Runs with interrupts disabled and
/// must not block.
pub type IrqHandler = fn(usize);

static EXCEPTION_HANDLERS: GlobalCell<[Option<ExceptionHandler>; EXCEPTION_VECTORS]> =
    GlobalCell::new([None; EXCEPTION_VECTORS]);

static IRQ_HANDLERS: GlobalCell<[Option<IrqHandler>; pic::IRQ_LINES]> =
    GlobalCell::new([None; pic::IRQ_LINES]);

/// Install the trampolines for every exception and IRQ vector.
///
/// All exceptions start out on the generic fatal path; specific handlers
/// (the page-fault one) are bound later. IRQ lines stay masked until a
/// handler is registered.
///
/// # Safety
///
/// Must run once at boot, after [`idt::setup`] and [`pic::setup`], with
/// interrupts disabled.
pub unsafe fn setup() {
    for (vector, stub) in EXCEPTION_STUBS.iter().enumerate() {
        // SAFETY: each stub is a trampoline generated below that preserves
        // the full CPU state.
        unsafe {
            idt::set_gate(vector, *stub as usize);
        }
    }
    for (line, stub) in IRQ_STUBS.iter().enumerate() {
        // SAFETY: as above.
        unsafe {
            idt::set_gate(pic::IRQ_BASE_VECTOR + line, *stub as usize);
        }
    }
}

/// Bind `handler` to an exception vector.
pub fn set_exception_handler(vector: usize, handler: ExceptionHandler) {
    assert!(vector < EXCEPTION_VECTORS);
    crate::sync::irqlock::without_interrupts(|| {
        // SAFETY: interrupts are disabled and the cell is static storage.
        unsafe {
            (*EXCEPTION_HANDLERS.as_mut_ptr())[vector] = Some(handler);
        }
    });
}

/// Bind `handler` to an IRQ line and unmask it; `None` masks the line.
pub fn set_irq_handler(line: usize, handler: Option<IrqHandler>) {
    assert!(line < pic::IRQ_LINES);
    crate::sync::irqlock::without_interrupts(|| {
        // SAFETY: interrupts are disabled and the cell is static storage.
        unsafe {
            (*IRQ_HANDLERS.as_mut_ptr())[line] = handler;
        }
        if handler.is_some() {
            pic::enable_line(line);
        } else {
            pic::disable_line(line);
        }
    });
}

/// Faulting linear address of the most recent page fault (cr2).
pub fn faulting_address() -> usize {
    let addr: usize;
    // SAFETY: reading cr2 has no side effects; exceptions are dispatched
    // through interrupt gates, so no later fault can have overwritten it.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) addr, options(nomem, nostack, preserves_flags));
    }
    addr
}

extern "C" fn exception_dispatch(vector: u32, ctxt: *mut CpuContext) {
    let vector = vector as usize;
    // SAFETY: the trampoline passes the address of the context it built on
    // the interrupted stack; it stays valid until the trampoline unwinds.
    let ctxt = unsafe { &mut *ctxt };

    let handler = {
        // SAFETY: interrupt gates run with interrupts disabled.
        unsafe { (*EXCEPTION_HANDLERS.as_mut_ptr())[vector] }
    };
    match handler {
        Some(h) => h(vector, ctxt),
        None if vector == EXCEPTION_DOUBLE_FAULT => {
            log::error!("double fault: {ctxt}");
            panic!("double fault");
        }
        None => {
            log::error!("unhandled exception {vector}: {ctxt}");
            if let Some((base, size)) = crate::sched::thread::current_stack_extent() {
                // SAFETY: the extent describes the running thread's stack.
                unsafe { super::context::dump_backtrace(ctxt, base, size) };
            }
            panic!("unhandled CPU exception {vector}");
        }
    }
}

extern "C" fn irq_dispatch(line: u32, _ctxt: *mut CpuContext) {
    let line = line as usize;
    irq::enter();

    let handler = {
        // SAFETY: interrupt gates run with interrupts disabled.
        unsafe { (*IRQ_HANDLERS.as_mut_ptr())[line] }
    };
    if let Some(h) = handler {
        h(line);
    }

    pic::end_of_interrupt(line);
    irq::leave();

    // Handler-proper is done (nesting unwound): a reschedule requested by
    // the timer tick may switch threads now. The suspended thread resumes
    // right here and leaves through the trampoline's iretd.
    crate::sched::thread::preempt_if_requested();
}

// ---------------------------------------------------------------------------
// Naked trampolines
// ---------------------------------------------------------------------------

macro_rules! trampoline {
    // CPU did not push an error code: push a zero slot ourselves.
    ($name:ident, $vector:literal, $dispatch:path, no_error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push ebp",
                "push edi",
                "push esi",
                "push edx",
                "push ecx",
                "push ebx",
                "push eax",
                "push ss",
                "push ds",
                "push es",
                "push fs",
                "push gs",
                // The context starts at the current stack pointer.
                "push esp",
                "push {vector}",
                "call {dispatch}",
                "add esp, 8",
                "pop gs",
                "pop fs",
                "pop es",
                "pop ds",
                "pop ss",
                "pop eax",
                "pop ebx",
                "pop ecx",
                "pop edx",
                "pop esi",
                "pop edi",
                "pop ebp",
                "add esp, 4",
                "iretd",
                vector = const $vector,
                dispatch = sym $dispatch,
            )
        }
    };
    // CPU pushed an error code: the slot is already on the stack.
    ($name:ident, $vector:literal, $dispatch:path, error_code) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push ebp",
                "push edi",
                "push esi",
                "push edx",
                "push ecx",
                "push ebx",
                "push eax",
                "push ss",
                "push ds",
                "push es",
                "push fs",
                "push gs",
                "push esp",
                "push {vector}",
                "call {dispatch}",
                "add esp, 8",
                "pop gs",
                "pop fs",
                "pop es",
                "pop ds",
                "pop ss",
                "pop eax",
                "pop ebx",
                "pop ecx",
                "pop edx",
                "pop esi",
                "pop edi",
                "pop ebp",
                "add esp, 4",
                "iretd",
                vector = const $vector,
                dispatch = sym $dispatch,
            )
        }
    };
}

trampoline!(exc_0, 0, exception_dispatch, no_error_code);
trampoline!(exc_1, 1, exception_dispatch, no_error_code);
trampoline!(exc_2, 2, exception_dispatch, no_error_code);
trampoline!(exc_3, 3, exception_dispatch, no_error_code);
trampoline!(exc_4, 4, exception_dispatch, no_error_code);
trampoline!(exc_5, 5, exception_dispatch, no_error_code);
trampoline!(exc_6, 6, exception_dispatch, no_error_code);
trampoline!(exc_7, 7, exception_dispatch, no_error_code);
trampoline!(exc_8, 8, exception_dispatch, error_code);
trampoline!(exc_9, 9, exception_dispatch, no_error_code);
trampoline!(exc_10, 10, exception_dispatch, error_code);
trampoline!(exc_11, 11, exception_dispatch, error_code);
trampoline!(exc_12, 12, exception_dispatch, error_code);
trampoline!(exc_13, 13, exception_dispatch, error_code);
trampoline!(exc_14, 14, exception_dispatch, error_code);
trampoline!(exc_15, 15, exception_dispatch, no_error_code);
trampoline!(exc_16, 16, exception_dispatch, no_error_code);
trampoline!(exc_17, 17, exception_dispatch, error_code);
trampoline!(exc_18, 18, exception_dispatch, no_error_code);
trampoline!(exc_19, 19, exception_dispatch, no_error_code);
trampoline!(exc_20, 20, exception_dispatch, no_error_code);
trampoline!(exc_21, 21, exception_dispatch, no_error_code);
trampoline!(exc_22, 22, exception_dispatch, no_error_code);
trampoline!(exc_23, 23, exception_dispatch, no_error_code);
trampoline!(exc_24, 24, exception_dispatch, no_error_code);
trampoline!(exc_25, 25, exception_dispatch, no_error_code);
trampoline!(exc_26, 26, exception_dispatch, no_error_code);
trampoline!(exc_27, 27, exception_dispatch, no_error_code);
trampoline!(exc_28, 28, exception_dispatch, no_error_code);
trampoline!(exc_29, 29, exception_dispatch, no_error_code);
trampoline!(exc_30, 30, exception_dispatch, error_code);
trampoline!(exc_31, 31, exception_dispatch, no_error_code);

trampoline!(hw_0, 0, irq_dispatch, no_error_code);
trampoline!(hw_1, 1, irq_dispatch, no_error_code);
trampoline!(hw_2, 2, irq_dispatch, no_error_code);
trampoline!(hw_3, 3, irq_dispatch, no_error_code);
trampoline!(hw_4, 4, irq_dispatch, no_error_code);
trampoline!(hw_5, 5, irq_dispatch, no_error_code);
trampoline!(hw_6, 6, irq_dispatch, no_error_code);
trampoline!(hw_7, 7, irq_dispatch, no_error_code);
trampoline!(hw_8, 8, irq_dispatch, no_error_code);
trampoline!(hw_9, 9, irq_dispatch, no_error_code);
trampoline!(hw_10, 10, irq_dispatch, no_error_code);
trampoline!(hw_11, 11, irq_dispatch, no_error_code);
trampoline!(hw_12, 12, irq_dispatch, no_error_code);
trampoline!(hw_13, 13, irq_dispatch, no_error_code);
trampoline!(hw_14, 14, irq_dispatch, no_error_code);
trampoline!(hw_15, 15, irq_dispatch, no_error_code);

type Stub = unsafe extern "C" fn();

static EXCEPTION_STUBS: [Stub; EXCEPTION_VECTORS] = [
    exc_0, exc_1, exc_2, exc_3, exc_4, exc_5, exc_6, exc_7, exc_8, exc_9, exc_10, exc_11, exc_12,
    exc_13, exc_14, exc_15, exc_16, exc_17, exc_18, exc_19, exc_20, exc_21, exc_22, exc_23, exc_24,
    exc_25, exc_26, exc_27, exc_28, exc_29, exc_30, exc_31,
];

static IRQ_STUBS: [Stub; pic::IRQ_LINES] = [
    hw_0, hw_1, hw_2, hw_3, hw_4, hw_5, hw_6, hw_7, hw_8, hw_9, hw_10, hw_11, hw_12, hw_13, hw_14,
    hw_15,
];

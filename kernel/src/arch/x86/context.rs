//! Stack-resident CPU contexts and context switching.
//!
//! A suspended thread is represented by a [`CpuContext`] written at the top
//! of its own kernel stack; the thread record only keeps a pointer to it.
//! The trailer of the structure (error code, eip, cs, eflags) is exactly
//! what the `iretd` instruction consumes, so the same layout serves both
//! voluntary switches and the interrupt trampolines, and resuming a thread
//! is always an `iretd`.

use crate::{
    arch::stack,
    config::{BACKTRACE_MAX_DEPTH, STACK_POISON_CHECK_LEN},
};

use super::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};

/// EFLAGS for a fresh thread: IF set (interruptible), reserved bit 1.
const INITIAL_EFLAGS: u32 = 0x202;

/// Saved CPU state of a suspended kernel thread.
///
/// Lives on the owning thread's stack; its address doubles as the thread's
/// saved stack pointer. Segment registers are kept in 32-bit slots because
/// that is what `push`/`pop` of a segment register moves in 32-bit mode.
/// The last four fields must never change: `iretd` pops them.
#[repr(C, packed)]
pub struct CpuContext {
    gs: u32,
    fs: u32,
    es: u32,
    ds: u32,
    ss: u32,
    eax: u32,
    ebx: u32,
    ecx: u32,
    edx: u32,
    esi: u32,
    edi: u32,
    ebp: u32,
    error_code: u32,
    eip: u32,
    cs: u32,
    eflags: u32,
}

const CTX_SIZE: usize = core::mem::size_of::<CpuContext>();

// The assembly below hard-codes these; keep them honest.
const _: () = assert!(CTX_SIZE == 64);
const _: () = assert!(core::mem::offset_of!(CpuContext, eip) == 52);
const _: () = assert!(core::mem::offset_of!(CpuContext, error_code) == 48);

impl CpuContext {
    /// Instruction pointer of the suspended context.
    pub fn pc(&self) -> usize {
        self.eip as usize
    }

    /// Frame pointer of the suspended context, for backtraces.
    pub fn frame_pointer(&self) -> usize {
        self.ebp as usize
    }

    /// Exception error code pushed by the CPU (0 for contexts saved by a
    /// voluntary switch or an interrupt without error code).
    pub fn error_code(&self) -> u32 {
        self.error_code
    }
}

impl core::fmt::Display for CpuContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (eip, eflags, cs, ds, ss, err) = (
            self.eip,
            self.eflags,
            self.cs,
            self.ds,
            self.ss,
            self.error_code,
        );
        write!(
            f,
            "eip={:#010x} esp={:#010x} eflags={:#06x} cs={:#x} ds={:#x} ss={:#x} err={:#x}",
            eip, self as *const _ as usize, eflags, cs & 0xffff, ds, ss, err
        )
    }
}

/// Entry-point signature for kernel threads and reclaim callbacks.
pub type ThreadRoutine = extern "C" fn(usize);

/// The routine a fresh thread "returns into": run the thread body, then
/// the exit function. Neither may return here.
extern "C" fn core_routine(
    start: ThreadRoutine,
    start_arg: usize,
    exit: ThreadRoutine,
    exit_arg: usize,
) -> ! {
    start(start_arg);
    exit(exit_arg);
    panic!("thread exit routine returned");
}

/// Lay out a synthetic first context for a new thread on its stack.
///
/// The stack receives, top down: the four arguments for [`core_routine`],
/// a null return address (so that a bug in `core_routine`'s epilogue
/// faults instead of wandering), and the initial [`CpuContext`] whose
/// instruction pointer is `core_routine` and whose flags enable
/// interrupts. `*ctxt` is set to the context's address.
///
/// # Safety
///
/// `stack_base..stack_base + stack_size` must be writable, unused memory
/// that will serve as this thread's kernel stack, and `stack_size` must
/// leave room for the synthetic frame.
pub unsafe fn init_context(
    ctxt: &mut *mut CpuContext,
    start: ThreadRoutine,
    start_arg: usize,
    stack_base: usize,
    stack_size: usize,
    exit: ThreadRoutine,
    exit_arg: usize,
) {
    assert!(stack_size >= CTX_SIZE + 5 * 4 + STACK_POISON_CHECK_LEN);

    // SAFETY: the stack region is owned and unused per the contract.
    unsafe {
        stack::poison(stack_base, stack_size);

        let top = (stack_base + stack_size) as *mut u32;
        // Arguments of core_routine, in cdecl order.
        top.sub(1).write(exit_arg as u32);
        top.sub(2).write(exit as usize as u32);
        top.sub(3).write(start_arg as u32);
        top.sub(4).write(start as usize as u32);
        // Return address of core_routine: forced fault on misuse.
        top.sub(5).write(0);

        let ctx = top.sub(5).cast::<CpuContext>().sub(1);
        ctx.write(CpuContext {
            gs: 0,
            fs: 0,
            es: KERNEL_DATA_SELECTOR as u32,
            ds: KERNEL_DATA_SELECTOR as u32,
            ss: KERNEL_DATA_SELECTOR as u32,
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            error_code: 0,
            eip: core_routine as usize as u32,
            cs: KERNEL_CODE_SELECTOR as u32,
            eflags: INITIAL_EFLAGS,
        });
        *ctxt = ctx;
    }
}

/// Save the current CPU state into `*from` and resume `to`.
///
/// The saved context is written on the current stack and its address
/// stored through `from`; execution continues after the call once some
/// other thread switches back. Interrupt-safe against the timer tick: an
/// interrupt taken mid-save fully unwinds before the switch proceeds.
///
/// # Safety
///
/// `from` must point to the current thread's context slot and `to` must be
/// a context previously produced by this module, resident on a valid
/// stack. Callers run with interrupts disabled; the resumed context brings
/// back its own interrupt-enable state.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(from: *mut *mut CpuContext, to: *mut CpuContext) {
    core::arch::naked_asm!(
        // Build a CpuContext on the current stack, matching the struct
        // layout bottom-up (the trailer first).
        "pushfd",
        "push cs",
        "push 0", // eip, patched below
        "push 0", // error code
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
        // Resume point for when somebody switches back to us.
        "mov dword ptr [esp + 52], offset .Lopal_ctx_resume",
        // *from = context address (= current esp).
        "mov eax, [esp + 68]",
        "mov [eax], esp",
        // Hop onto the target context.
        "mov eax, [esp + 72]",
        "mov esp, eax",
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
        "add esp, 4", // error code
        "iretd",
        ".Lopal_ctx_resume:",
        "ret",
    )
}

/// Abandon the current stack, switch to `to`'s stack, call
/// `reclaim(reclaim_arg)` there, then resume `to`.
///
/// This is how a terminated thread's stack and record get freed: the
/// reclaim function runs on the next thread's stack, where it is safe to
/// release the dead thread's memory.
///
/// # Safety
///
/// As for [`switch_context`]; additionally the current stack must never be
/// used again, and `reclaim` must not itself block or switch.
#[unsafe(naked)]
pub unsafe extern "C" fn exit_to(
    to: *mut CpuContext,
    reclaim: ThreadRoutine,
    reclaim_arg: usize,
) -> ! {
    core::arch::naked_asm!(
        "mov esi, [esp + 4]",  // to
        "mov ebx, [esp + 8]",  // reclaim
        "mov ecx, [esp + 12]", // reclaim_arg
        // From here on the old stack is dead; run the reclaimer on the
        // free space below the target context.
        "mov esp, esi",
        "push ecx",
        "call ebx",
        "mov esp, esi",
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
    )
}

/// Verify the stack sanity of a context about to be resumed. Halts the
/// kernel on poison violation or a context outside its stack.
///
/// # Safety
///
/// `ctxt` must point into the stack described by `stack_base`/`stack_size`
/// and the whole stack must be readable.
pub unsafe fn check_stack(ctxt: *const CpuContext, stack_base: usize, stack_size: usize) {
    // SAFETY: forwarded contract.
    unsafe {
        stack::check(ctxt as usize, CTX_SIZE, stack_base, stack_size);
    }
}

/// Log a backtrace of a saved context through `log::error!`.
///
/// # Safety
///
/// The stack extent must be readable memory.
pub unsafe fn dump_backtrace(ctxt: &CpuContext, stack_base: usize, stack_size: usize) {
    log::error!("context: {ctxt}");
    // SAFETY: forwarded contract.
    unsafe {
        crate::arch::backtrace::walk(
            ctxt.pc(),
            ctxt.frame_pointer(),
            stack_base,
            stack_size,
            BACKTRACE_MAX_DEPTH,
            |pc, args, depth| {
                log::error!("  [{depth}] pc={pc:#010x} args@{args:#010x}");
            },
        );
    }
}

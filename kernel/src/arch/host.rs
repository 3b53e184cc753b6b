//! Host stand-ins for the hardware layer.
//!
//! Compiled when the crate is built for anything other than bare-metal
//! i686, i.e. for `cargo test` on the development machine. Interrupt state
//! is a no-op (the host tests serialize through their own lock), and the
//! context-switch primitives are unreachable: host tests exercise thread
//! bookkeeping, never an actual switch.

/// Interrupt-flag stand-ins.
pub mod irq {
    /// No interrupt state on the host; returns a dummy flags word.
    pub fn save_and_disable() -> usize {
        0
    }

    pub fn restore(_flags: usize) {}

    /// The host never runs kernel interrupt handlers.
    pub fn servicing_interrupt() -> bool {
        false
    }
}

/// CPU-context stand-ins.
pub mod context {
    /// Opaque placeholder for the saved CPU state. Host-built thread
    /// records keep a null context pointer.
    pub enum CpuContext {}

    /// Entry point signature shared with the bare-metal layer.
    pub type ThreadRoutine = extern "C" fn(usize);

    /// No context is materialized on the host; the thread record keeps its
    /// null context pointer and must never be switched to.
    ///
    /// # Safety
    ///
    /// Trivially safe on the host; the signature mirrors the bare-metal
    /// primitive, which writes through raw stack memory.
    pub unsafe fn init_context(
        ctxt: &mut *mut CpuContext,
        _start: ThreadRoutine,
        _start_arg: usize,
        _stack_base: usize,
        _stack_size: usize,
        _exit: ThreadRoutine,
        _exit_arg: usize,
    ) {
        *ctxt = core::ptr::null_mut();
    }

    /// # Safety
    ///
    /// Never sound to call on the host.
    pub unsafe fn switch_context(_from: *mut *mut CpuContext, _to: *mut CpuContext) {
        unreachable!("context switching is not available on the host");
    }

    /// # Safety
    ///
    /// Never sound to call on the host.
    pub unsafe fn exit_to(
        _to: *mut CpuContext,
        _reclaim: ThreadRoutine,
        _reclaim_arg: usize,
    ) -> ! {
        unreachable!("context switching is not available on the host");
    }
}

/// Fatal stop. On the host this aborts the test process.
pub fn halt() -> ! {
    std::process::abort();
}

/// Idle-loop pause.
pub fn idle_wait() {
    core::hint::spin_loop();
}

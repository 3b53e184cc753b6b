//! Kernel threads.
//!
//! A thread record holds the saved context pointer (the context itself
//! lives on the thread's stack), the stack extent, and the intrusive links
//! for the ready queue, the global thread list and the thread's wait
//! entries. Records come from a dedicated slab cache; stacks from
//! `kmalloc`. A terminated thread is reclaimed from the next thread's
//! context, where freeing its stack is safe.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::{
    arch::{
        context::{self, CpuContext, ThreadRoutine},
        irq, stack,
    },
    config::THREAD_STACK_SIZE,
    error::{KernelError, KernelResult},
    mm::{
        kmalloc::{kfree, kmalloc, KmallocFlags},
        slab::{self, CacheFlags, SlabCache},
        VirtAddr,
    },
    sync::{cell::GlobalCell, irqlock::IrqGuard},
    time::{self, Time, TimeoutAction},
};

use super::{scheduler, waitq::WaitEntry};

/// Maximum thread name length; longer names are truncated.
pub const THREAD_NAME_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Allocated, not yet runnable.
    Created,
    /// In the ready queue.
    Ready,
    /// Owning the CPU. Exactly one thread is Running at any time.
    Running,
    /// Parked: sleeping or on a wait queue.
    Blocked,
    /// Terminated, awaiting reclamation from another thread's context.
    Zombie,
}

/// A kernel thread record.
pub struct Thread {
    name: [u8; THREAD_NAME_LEN],
    name_len: usize,
    state: ThreadState,
    /// Saved CPU state, resident at the top of this thread's stack. Null
    /// until first initialized (and always on the host build).
    ctxt: *mut CpuContext,
    stack_base: VirtAddr,
    stack_size: usize,
    // Ready-queue links.
    pub(crate) ready_prev: *mut Thread,
    pub(crate) ready_next: *mut Thread,
    // Global thread list links.
    gbl_prev: *mut Thread,
    gbl_next: *mut Thread,
    // Wait entries this thread currently has in wait queues.
    pub(crate) wait_head: *mut WaitEntry,
    pub(crate) wait_tail: *mut WaitEntry,
}

impl Thread {
    /// A blank record in the `Created` state.
    pub(crate) fn new_record(name: &str, stack_base: VirtAddr, stack_size: usize) -> Thread {
        let mut record = Thread {
            name: [0; THREAD_NAME_LEN],
            name_len: 0,
            state: ThreadState::Created,
            ctxt: core::ptr::null_mut(),
            stack_base,
            stack_size,
            ready_prev: core::ptr::null_mut(),
            ready_next: core::ptr::null_mut(),
            gbl_prev: core::ptr::null_mut(),
            gbl_next: core::ptr::null_mut(),
            wait_head: core::ptr::null_mut(),
            wait_tail: core::ptr::null_mut(),
        };
        record.set_name(name);
        record
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("<bad name>")
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(THREAD_NAME_LEN);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name_len = len;
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn stack_extent(&self) -> (VirtAddr, usize) {
        (self.stack_base, self.stack_size)
    }

    pub(crate) fn has_wait_entries(&self) -> bool {
        !self.wait_head.is_null()
    }
}

/// The single Running thread. Null until [`setup`] promotes the boot
/// context.
static CURRENT: AtomicPtr<Thread> = AtomicPtr::new(core::ptr::null_mut());

/// Head of the global list of all live threads.
static THREAD_LIST: GlobalCell<*mut Thread> = GlobalCell::new(core::ptr::null_mut());

/// The cache serving thread records.
static THREAD_CACHE: GlobalCell<*mut SlabCache> = GlobalCell::new(core::ptr::null_mut());

/// Set by the timer tick; consumed at the tail of interrupt dispatch.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// The running thread's record.
pub fn current() -> *mut Thread {
    let thread = CURRENT.load(Ordering::Relaxed);
    assert!(!thread.is_null(), "thread subsystem not initialized");
    // SAFETY: the current thread record is live by definition.
    debug_assert!(unsafe { (*thread).state() } == ThreadState::Running);
    thread
}

/// Stack extent of the running thread, if the subsystem is up. Used by
/// the fatal-report paths.
pub fn current_stack_extent() -> Option<(VirtAddr, usize)> {
    let thread = CURRENT.load(Ordering::Relaxed);
    if thread.is_null() {
        return None;
    }
    // SAFETY: live record.
    Some(unsafe { (*thread).stack_extent() })
}

fn set_current(thread: *mut Thread) {
    // SAFETY: the scheduler hands out live Ready threads.
    unsafe {
        assert!((*thread).state() == ThreadState::Ready);
        (*thread).set_state(ThreadState::Running);
    }
    CURRENT.store(thread, Ordering::Relaxed);
}

/// Link `thread` into the global list.
fn global_list_add(thread: *mut Thread) {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held; the list is well formed.
    unsafe {
        let head = THREAD_LIST.as_mut_ptr();
        (*thread).gbl_prev = core::ptr::null_mut();
        (*thread).gbl_next = *head;
        if !(*head).is_null() {
            (**head).gbl_prev = thread;
        }
        *head = thread;
    }
}

fn global_list_remove(thread: *mut Thread) {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held; `thread` is on the list.
    unsafe {
        let head = THREAD_LIST.as_mut_ptr();
        if (*thread).gbl_prev.is_null() {
            *head = (*thread).gbl_next;
        } else {
            (*(*thread).gbl_prev).gbl_next = (*thread).gbl_next;
        }
        if !(*thread).gbl_next.is_null() {
            (*(*thread).gbl_next).gbl_prev = (*thread).gbl_prev;
        }
    }
}

/// Initialize the thread subsystem and promote the boot context (the
/// code currently executing on the bootstrap stack) into thread zero.
pub fn setup(boot_stack_base: VirtAddr, boot_stack_size: usize) -> KernelResult<()> {
    let cache = slab::cache_create(
        "thread",
        core::mem::size_of::<Thread>(),
        2,
        CacheFlags::MAP | CacheFlags::ZERO,
    )?;
    // SAFETY: boot-time single-threaded store.
    unsafe {
        *THREAD_CACHE.as_mut_ptr() = cache;
    }

    let myself = slab::cache_alloc(cache, true)? as *mut Thread;
    // SAFETY: fresh slab object, exclusively ours.
    unsafe {
        myself.write(Thread::new_record("[kinit]", boot_stack_base, boot_stack_size));
        // Arm the overflow detector on the bootstrap stack; execution is
        // far above the poisoned bottom bytes.
        stack::poison(boot_stack_base, boot_stack_size);
    }

    global_list_add(myself);
    // SAFETY: live record; nobody else can see it yet.
    unsafe {
        (*myself).set_state(ThreadState::Ready);
    }
    set_current(myself);
    Ok(())
}

/// The exit hook a fresh thread falls into when its body returns.
extern "C" fn thread_exit_routine(_arg: usize) {
    exit();
}

/// Create a kernel thread and make it ready.
pub fn create(name: &str, entry: ThreadRoutine, arg: usize) -> KernelResult<*mut Thread> {
    let cache = {
        // SAFETY: written once at setup.
        let cache = unsafe { *THREAD_CACHE.as_mut_ptr() };
        assert!(!cache.is_null(), "thread subsystem not initialized");
        cache
    };

    let thread = slab::cache_alloc(cache, true)? as *mut Thread;
    let stack_base = match kmalloc(THREAD_STACK_SIZE, KmallocFlags::empty()) {
        Ok(base) => base,
        Err(e) => {
            let _ = slab::cache_free(thread as VirtAddr);
            return Err(e);
        }
    };

    // SAFETY: fresh record and stack, exclusively ours until set_ready.
    unsafe {
        thread.write(Thread::new_record(name, stack_base, THREAD_STACK_SIZE));
        context::init_context(
            &mut (*thread).ctxt,
            entry,
            arg,
            stack_base,
            THREAD_STACK_SIZE,
            thread_exit_routine,
            0,
        );
    }

    global_list_add(thread);
    scheduler::set_ready(thread);
    Ok(thread)
}

/// Reclaim a zombie: runs on the *next* thread's stack, interrupts
/// disabled, from `exit_to`.
extern "C" fn reclaim_thread(arg: usize) {
    let thread = arg as *mut Thread;
    global_list_remove(thread);
    // SAFETY: the dead thread no longer runs; its stack and record are
    // ours to release.
    unsafe {
        let _ = kfree((*thread).stack_base);
        let _ = slab::cache_free(thread as VirtAddr);
    }
}

/// Terminate the calling thread. Its stack and record are freed from the
/// next thread's context.
pub fn exit() -> ! {
    assert!(
        !irq::servicing_interrupt(),
        "interrupt handlers cannot exit the current thread"
    );

    let myself = current();
    // SAFETY: `myself` is the live running thread.
    unsafe {
        assert!(
            !(*myself).has_wait_entries(),
            "thread exiting while holding wait entries"
        );
    }

    // No matching restore: the next thread brings its own flags.
    let _flags = irq::save_and_disable();
    // SAFETY: live record.
    unsafe {
        (*myself).set_state(ThreadState::Zombie);
    }
    let next = scheduler::reschedule(myself, false);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: the scheduler only returns threads with a context on a
    // valid stack.
    unsafe {
        let (base, size) = (*next).stack_extent();
        context::check_stack((*next).ctxt, base, size);
    }

    set_current(next);
    // SAFETY: `next` has a valid saved context; `myself` never runs
    // again, so discarding its stack is sound.
    unsafe {
        context::exit_to((*next).ctxt, reclaim_thread, myself as usize);
    }
    unreachable!("exit_to returned");
}

enum SwitchOp {
    Yield,
    Block,
}

/// Hand the CPU to the next thread. Must run with interrupts disabled;
/// returns when this thread is scheduled again.
fn switch_to_next(op: SwitchOp) {
    assert!(
        !irq::servicing_interrupt(),
        "interrupt handlers cannot block or yield"
    );
    let myself = current();

    // SAFETY: live record of the running thread.
    unsafe {
        if matches!(op, SwitchOp::Block) {
            (*myself).set_state(ThreadState::Blocked);
        }
    }

    let next = scheduler::reschedule(myself, matches!(op, SwitchOp::Yield));
    if next != myself {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        // SAFETY: scheduler invariant as in `exit`.
        unsafe {
            let (base, size) = (*next).stack_extent();
            context::check_stack((*next).ctxt, base, size);
        }

        set_current(next);
        // SAFETY: `myself` is the running thread whose context slot we
        // own; `next` was suspended with a valid saved context.
        unsafe {
            context::switch_context(&mut (*myself).ctxt, (*next).ctxt);
        }
        // Back on this thread's stack.
        debug_assert!(current() == myself);
    } else {
        // Nothing else to run: just restore our Running state.
        set_current(next);
    }
}

/// Voluntarily hand the CPU to the next ready thread.
pub fn yield_cpu() -> KernelResult<()> {
    let _irq = IrqGuard::new();
    switch_to_next(SwitchOp::Yield);
    Ok(())
}

/// Bookkeeping shared with the sleep-timeout callback.
struct SleepWakeup {
    thread: *mut Thread,
    triggered: bool,
}

fn sleep_timeout(act: &mut TimeoutAction) {
    // SAFETY: the action's data points at the sleeper's stack-resident
    // SleepWakeup, alive for the whole sleep.
    unsafe {
        let params = &mut *(act.data() as *mut SleepWakeup);
        params.triggered = true;
        force_unblock(params.thread).expect("waking a sleeping thread cannot fail");
    }
}

/// Block the calling thread. With `None`, sleep until somebody calls
/// [`force_unblock`]. With a timeout, sleep at most that long: returns
/// `Ok` when the timeout fired, `Interrupted` when woken early, and
/// writes the residual timeout back through the argument (zero on
/// expiry).
pub fn sleep(timeout: Option<&mut Time>) -> KernelResult<()> {
    let Some(timeout) = timeout else {
        let _irq = IrqGuard::new();
        switch_to_next(SwitchOp::Block);
        return Ok(());
    };

    let mut action = TimeoutAction::new();
    let mut params = SleepWakeup {
        thread: current(),
        triggered: false,
    };

    let _irq = IrqGuard::new();
    time::register_action_relative(
        &mut action,
        timeout,
        sleep_timeout,
        &mut params as *mut SleepWakeup as *mut (),
    )
    .expect("sleep timeout registration cannot fail");

    switch_to_next(SwitchOp::Block);
    // Woken up: by our timeout, or by someone else.
    let result = if params.triggered {
        assert!(action.remaining().is_zero());
        Ok(())
    } else {
        time::unregister_action(&mut action).expect("pending sleep timeout must unregister");
        Err(KernelError::Interrupted)
    };

    *timeout = action.remaining();
    result
}

/// Make a blocked (or not-yet-started) thread runnable, regardless of
/// what it is waiting for. Waking a zombie is a fatal error reported to
/// the caller.
pub fn force_unblock(thread: *mut Thread) -> KernelResult<()> {
    if thread.is_null() {
        return Err(KernelError::Invalid);
    }
    let _irq = IrqGuard::new();
    // SAFETY: callers pass live thread records.
    match unsafe { (*thread).state() } {
        ThreadState::Running | ThreadState::Ready => Ok(()),
        ThreadState::Zombie => Err(KernelError::Fatal),
        ThreadState::Created | ThreadState::Blocked => {
            scheduler::set_ready(thread);
            Ok(())
        }
    }
}

/// Called by the timer handler: ask for a preemptive reschedule at the
/// end of interrupt dispatch.
pub fn request_preemption() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

/// Run the preemptive reschedule if one was requested. Called at the tail
/// of interrupt dispatch, after the nesting count has unwound, with
/// interrupts still disabled by the interrupt gate.
pub fn preempt_if_requested() {
    if !NEED_RESCHED.swap(false, Ordering::Relaxed) {
        return;
    }
    if CURRENT.load(Ordering::Relaxed).is_null() {
        return;
    }
    let _irq = IrqGuard::new();
    switch_to_next(SwitchOp::Yield);
}

/// Walk the global thread list, passing each record to `visit`.
pub fn for_each_thread(mut visit: impl FnMut(&Thread)) {
    let _irq = IrqGuard::new();
    // SAFETY: critical section held; the list is well formed.
    unsafe {
        let mut cursor = *THREAD_LIST.as_mut_ptr();
        while !cursor.is_null() {
            visit(&*cursor);
            cursor = (*cursor).gbl_next;
        }
    }
}

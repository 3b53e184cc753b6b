//! End-to-end scenarios over the booted kernel (host build).
//!
//! `test_support::init_kernel` brings the global subsystems up once, in
//! boot order, over a leaked arena: fictional physical frames, real
//! virtual memory. Each test takes the support lock, works against the
//! same globals a running kernel would, and restores what it consumed.

use opal_kernel::{
    error::KernelError,
    mm::{frame, kmalloc, page_fault, paging, slab, vmm, PAGE_SIZE},
    sched::{scheduler, thread, ThreadState},
    test_support,
    time::{self, Time, TimeoutAction},
};

extern "C" fn noop_thread(_arg: usize) {}

#[test]
fn test_frame_exhaustion_and_recycling() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let before = frame::stats();
    assert_eq!(before.total, test_support::TEST_RAM / PAGE_SIZE);

    // Drain physical memory completely.
    let mut got = Vec::new();
    loop {
        match frame::ref_new(true) {
            Ok(paddr) => got.push(paddr),
            Err(e) => {
                assert_eq!(e, KernelError::OutOfMemory);
                break;
            }
        }
    }
    assert_eq!(got.len(), before.free);
    assert_eq!(frame::stats().free, 0);

    // No frame was handed out twice.
    let mut sorted = got.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), got.len());

    // Release in FIFO order, then allocate a second round: every address
    // must be one already seen in the first round.
    for &paddr in &got {
        assert!(frame::unref(paddr).expect("frame release"));
    }
    assert_eq!(frame::stats(), before);

    let mut second = Vec::new();
    for _ in 0..before.free {
        let paddr = frame::ref_new(true).expect("second-round allocation");
        assert!(sorted.binary_search(&paddr).is_ok());
        second.push(paddr);
    }
    for &paddr in &second {
        frame::unref(paddr).expect("second-round release");
    }
    assert_eq!(frame::stats(), before);
}

#[test]
fn test_range_lists_sorted_disjoint_and_coalesced() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let check = || {
        let (free, used) = vmm::snapshot();
        // Sorted, non-overlapping within each list.
        for list in [&free, &used] {
            for pair in list.windows(2) {
                let (base_a, pages_a) = pair[0];
                let (base_b, _) = pair[1];
                assert!(base_a + pages_a * PAGE_SIZE <= base_b, "overlap or disorder");
            }
        }
        // Adjacent free ranges would mean a missed coalescing.
        for pair in free.windows(2) {
            let (base_a, pages_a) = pair[0];
            let (base_b, _) = pair[1];
            assert!(base_a + pages_a * PAGE_SIZE < base_b, "uncoalesced free ranges");
        }
        // No address is both free and used.
        for &(fb, fp) in &free {
            for &(ub, up) in &used {
                let disjoint = fb + fp * PAGE_SIZE <= ub || ub + up * PAGE_SIZE <= fb;
                assert!(disjoint, "free and used ranges intersect");
            }
        }
        (free, used)
    };

    let (free_before, _) = check();

    // Carve three ranges, free them out of order: the free list must
    // return to its exact original shape (split then coalesce).
    let a = vmm::alloc(2, vmm::AllocFlags::empty()).expect("alloc a");
    let b = vmm::alloc(3, vmm::AllocFlags::empty()).expect("alloc b");
    let c = vmm::alloc(1, vmm::AllocFlags::empty()).expect("alloc c");
    check();

    vmm::free(b).expect("free b");
    vmm::free(a).expect("free a");
    vmm::free(c).expect("free c");
    let (free_after, _) = check();
    assert_eq!(free_before, free_after);

    // Freeing anything that is not a range base is refused.
    assert_eq!(vmm::free(a + 123), Err(KernelError::Invalid));
}

#[test]
fn test_mapped_range_roundtrip_restores_frames() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let frames_before = frame::stats();
    let (free_before, _) = vmm::snapshot();

    let base = vmm::alloc(3, vmm::AllocFlags::MAP).expect("mapped alloc");
    // Every page got a frame, owned by the mapping alone.
    for page in 0..3 {
        let vaddr = base + page * PAGE_SIZE;
        let paddr = paging::get_paddr(vaddr).expect("page must be mapped");
        assert_eq!(frame::refcount(paddr & !(PAGE_SIZE - 1)).unwrap(), 1);
    }
    assert_eq!(frame::stats().used, frames_before.used + 3);

    // The backing memory is real on the host: write through it.
    // SAFETY: the range was just mapped for exclusive use.
    unsafe {
        core::ptr::write_bytes(base as *mut u8, 0xab, 3 * PAGE_SIZE);
        assert_eq!(core::ptr::read((base + PAGE_SIZE + 7) as *const u8), 0xab);
    }

    vmm::free(base).expect("mapped free");
    assert_eq!(frame::stats(), frames_before);
    assert_eq!(vmm::snapshot().0, free_before);
}

#[test]
fn test_demand_paging_installs_one_frame_per_touched_page() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let frames_before = frame::stats();
    let base = vmm::alloc(4, vmm::AllocFlags::empty()).expect("lazy alloc");

    // Nothing is mapped up front.
    for page in 0..4 {
        assert!(paging::get_paddr(base + page * PAGE_SIZE).is_none());
    }

    // First touch: the fault handler resolves the range and installs a
    // frame.
    assert!(page_fault::handle_kernel_fault(base + 5));
    let first = paging::get_paddr(base).expect("first page mapped");
    assert_eq!(frame::stats().used, frames_before.used + 1);

    // A second page faults independently and does not disturb the first.
    assert!(page_fault::handle_kernel_fault(base + PAGE_SIZE + 100));
    assert!(paging::get_paddr(base + PAGE_SIZE).is_some());
    assert_eq!(paging::get_paddr(base + 5), Some(first + 5));
    assert_eq!(frame::stats().used, frames_before.used + 2);

    // A fault outside every range is not resolvable.
    let (_, used) = vmm::snapshot();
    let outside = used.iter().map(|&(b, p)| b + p * PAGE_SIZE).max().unwrap() + (64 << 20);
    assert!(!page_fault::handle_kernel_fault(outside));

    vmm::free(base).expect("lazy free");
    assert_eq!(frame::stats(), frames_before);
}

#[test]
fn test_kmalloc_big_number_restores_cache_occupancy() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    // Warm the 16-byte class so the retained-empty-slab policy does not
    // show up as a difference.
    let warm = kmalloc::kmalloc(16, kmalloc::KmallocFlags::empty()).expect("warmup");
    kmalloc::kfree(warm).expect("warmup free");

    let classes_before = kmalloc::class_stats();
    let frames_before = frame::stats();

    // A 1000-digit number as a linked list of 16-byte limbs: each node
    // stores a digit and the address of the next node.
    let mut head: usize = 0;
    for digit in 0..1000u64 {
        let node = kmalloc::kmalloc(16, kmalloc::KmallocFlags::empty()).expect("limb");
        // SAFETY: the node is 16 writable bytes owned by us.
        unsafe {
            core::ptr::write(node as *mut u64, digit % 10);
            core::ptr::write((node + 8) as *mut u64, head as u64);
        }
        head = node;
    }

    // Walk it back: 1000 nodes, digits intact.
    let mut count = 0;
    let mut cursor = head;
    while cursor != 0 {
        // SAFETY: nodes were written above and are still owned.
        unsafe {
            let digit = core::ptr::read(cursor as *const u64);
            assert!(digit < 10);
            cursor = core::ptr::read((cursor + 8) as *const u64) as usize;
        }
        count += 1;
    }
    assert_eq!(count, 1000);

    // Free the whole list; the caches return to their pre-test occupancy.
    let mut cursor = head;
    while cursor != 0 {
        // SAFETY: as above; read the link before the node is freed.
        let next = unsafe { core::ptr::read((cursor + 8) as *const u64) as usize };
        kmalloc::kfree(cursor).expect("limb free");
        cursor = next;
    }
    assert_eq!(kmalloc::class_stats(), classes_before);
    assert_eq!(frame::stats(), frames_before);
}

#[test]
fn test_kmalloc_large_requests_fall_through_to_ranges() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let frames_before = frame::stats();

    // 100 KiB exceeds every size class: whole pages, mapped eagerly.
    let big = kmalloc::kmalloc(100 * 1024, kmalloc::KmallocFlags::empty()).expect("big alloc");
    assert_eq!(big % PAGE_SIZE, 0);
    assert!(paging::get_paddr(big).is_some());

    // The polymorphic free path figures out it was not a slab object.
    kmalloc::kfree(big).expect("big free");
    assert_eq!(frame::stats(), frames_before);
}

#[test]
fn test_slab_cache_recycles_objects_without_growing() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    let cache = slab::cache_create(
        "test-objects",
        48,
        1,
        slab::CacheFlags::MAP | slab::CacheFlags::ZERO,
    )
    .expect("cache creation");

    let first = slab::cache_alloc(cache, false).expect("first object");
    // SAFETY: the object is 48 writable bytes owned by us.
    unsafe { core::ptr::write_bytes(first as *mut u8, 0x5a, 48) };
    slab::cache_free(first).expect("first free");

    let frames_after_first = frame::stats();
    let stats_after_first = slab::cache_stats(cache);

    // Alloc/free cycles inside one slab: same object back every time,
    // zeroed every time, no physical growth.
    for _ in 0..64 {
        let obj = slab::cache_alloc(cache, false).expect("recycled object");
        assert_eq!(obj, first);
        for off in 0..48 {
            // SAFETY: owned object memory.
            let byte = unsafe { core::ptr::read((obj + off) as *const u8) };
            assert_eq!(byte, 0, "ZERO cache returned dirty memory");
        }
        // SAFETY: owned object memory.
        unsafe { core::ptr::write_bytes(obj as *mut u8, 0x5a, 48) };
        slab::cache_free(obj).expect("recycled free");
    }
    assert_eq!(frame::stats(), frames_after_first);
    assert_eq!(slab::cache_stats(cache), stats_after_first);

    // Freeing something that never came from a slab is disowned, not
    // absorbed.
    assert_eq!(slab::cache_free(0x1234), Err(KernelError::Invalid));
}

#[test]
fn test_timeout_actions_fire_in_deadline_order() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    static FIRED: std::sync::Mutex<Vec<u32>> = std::sync::Mutex::new(Vec::new());
    FIRED.lock().unwrap().clear();

    fn record(act: &mut TimeoutAction) {
        FIRED.lock().unwrap().push(act.data() as u32);
    }

    // Register out of order: 30 ms, 10 ms, 20 ms (ticks are 10 ms).
    let mut a = TimeoutAction::new();
    let mut b = TimeoutAction::new();
    let mut c = TimeoutAction::new();
    time::register_action_relative(&mut a, &Time::from_millis(30), record, 30 as *mut ())
        .expect("register a");
    time::register_action_relative(&mut b, &Time::from_millis(10), record, 10 as *mut ())
        .expect("register b");
    time::register_action_relative(&mut c, &Time::from_millis(20), record, 20 as *mut ())
        .expect("register c");

    // Double registration is refused while queued.
    assert_eq!(
        time::register_action_relative(&mut b, &Time::from_millis(5), record, 0 as *mut ()),
        Err(KernelError::Busy)
    );

    for _ in 0..3 {
        time::do_tick();
    }
    assert_eq!(*FIRED.lock().unwrap(), vec![10, 20, 30]);
    assert!(a.remaining().is_zero());

    // An unregistered action keeps its residual timeout.
    let mut d = TimeoutAction::new();
    time::register_action_relative(&mut d, &Time::from_millis(50), record, 50 as *mut ())
        .expect("register d");
    time::do_tick();
    time::unregister_action(&mut d).expect("unregister d");
    assert_eq!(d.remaining(), Time::from_millis(40));
    time::do_tick();
    assert_eq!(*FIRED.lock().unwrap(), vec![10, 20, 30]);
}

#[test]
fn test_thread_creation_bookkeeping() {
    let _guard = test_support::lock();
    test_support::init_kernel();

    // Thread zero is the promoted boot context.
    let myself = thread::current();
    // SAFETY: the current record is live.
    unsafe {
        assert_eq!((*myself).state(), ThreadState::Running);
        assert_eq!((*myself).name(), "[kinit]");
    }

    let ready_before = scheduler::ready_count();
    let worker = thread::create("worker", noop_thread, 0).expect("thread creation");
    assert_eq!(scheduler::ready_count(), ready_before + 1);
    // SAFETY: the record is live until reclaimed.
    unsafe {
        assert_eq!((*worker).state(), ThreadState::Ready);
        assert_eq!((*worker).name(), "worker");
        let (stack_base, stack_size) = (*worker).stack_extent();
        assert!(stack_size >= 2 * PAGE_SIZE);
        assert!(stack_base != 0);
    }

    // It shows up on the global thread list.
    let mut seen = false;
    thread::for_each_thread(|t| seen |= t.name() == "worker");
    assert!(seen);

    // force_unblock is a no-op on Ready and Running threads.
    assert_eq!(thread::force_unblock(worker), Ok(()));
    assert_eq!(thread::force_unblock(myself), Ok(()));
    assert_eq!(scheduler::ready_count(), ready_before + 1);
}

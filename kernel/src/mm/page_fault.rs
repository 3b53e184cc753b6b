//! Demand paging for kernel virtual ranges.
//!
//! Ranges allocated without the `MAP` flag receive their frames here, one
//! page at a time, on first touch. A fault outside any known range is not
//! resolvable and ends in a fatal report.

use crate::mm::{frame, page_align_down, paging, paging::VmFlags, vmm, VirtAddr};

/// Try to resolve a kernel page fault at `fault_addr`. Returns `true`
/// when a frame was installed and the faulting access may be retried,
/// `false` when the address belongs to no kernel range.
pub fn handle_kernel_fault(fault_addr: VirtAddr) -> bool {
    let range = vmm::range_covering(fault_addr);
    if range.is_null() {
        return false;
    }

    let page = page_align_down(fault_addr);
    let paddr = match frame::ref_new(false) {
        Ok(paddr) => paddr,
        // There is no swapper to steal pages back from: running out of
        // frames while demand paging is unrecoverable.
        Err(_) => panic!("out of physical memory in demand paging (no swap)"),
    };

    if paging::map(paddr, page, false, VmFlags::READ | VmFlags::WRITE | VmFlags::ATOMIC).is_err() {
        let _ = frame::unref(paddr);
        return false;
    }
    // The mapping owns the frame now; drop the allocation reference.
    let _ = frame::unref(paddr);
    // Keep the frame -> range back-pointer accurate for later reverse
    // lookups (slab resolution, range release).
    let _ = frame::set_range(paddr, range);

    // A fresh demand-paged page reads as zero.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: the page was just mapped read/write and carries no data.
    unsafe {
        core::ptr::write_bytes(page as *mut u8, 0, crate::mm::PAGE_SIZE);
    }

    true
}

/// Bind the page-fault vector to the demand-paging handler.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn install() {
    use crate::arch::x86::{context::CpuContext, interrupts};

    fn page_fault_exception(_vector: usize, ctxt: &mut CpuContext) {
        let fault_addr = interrupts::faulting_address();
        if handle_kernel_fault(fault_addr) {
            return;
        }

        log::error!(
            "unresolved page fault at {:#010x} (pc={:#010x}, err={:#x})",
            fault_addr,
            ctxt.pc(),
            ctxt.error_code()
        );
        if let Some((base, size)) = crate::sched::thread::current_stack_extent() {
            // SAFETY: the extent describes the faulting thread's stack.
            unsafe { crate::arch::x86::context::dump_backtrace(ctxt, base, size) };
        }
        panic!("unresolved kernel page fault at {fault_addr:#010x}");
    }

    interrupts::set_exception_handler(interrupts::EXCEPTION_PAGE_FAULT, page_fault_exception);
}

//! Bare-metal kernel entry.
//!
//! A multiboot-compliant loader drops us in 32-bit protected mode with a
//! magic value in `eax` and the info structure in `ebx`. The assembly
//! stub installs the bootstrap stack and calls [`kernel_main`], which
//! brings the subsystems up in dependency order, promotes itself to
//! thread zero, starts the idle thread, unmasks the timer and exits.
//! From then on the machine belongs to the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot {
    use opal_kernel::{
        arch::{
            self,
            x86::{gdt, idt, interrupts, irq, pic, pit},
        },
        config::{TICK_HZ, TICK_NSEC},
        logger,
        mm::{frame, kmalloc, page_fault, paging, vmm},
        sched::{scheduler, thread},
        serial_println,
        time::{self, Time},
    };

    /// Size of the bootstrap stack installed by `_start`.
    const BOOT_STACK_SIZE: usize = 16 * 1024;

    /// Magic value a multiboot loader leaves in `eax`.
    const MULTIBOOT_LOADER_MAGIC: u32 = 0x2bad_b002;

    extern "C" {
        /// First byte of the kernel image (from the linker script).
        static __kernel_start: u8;
        /// One past the last byte of the kernel image.
        static __kernel_end: u8;
        /// Bootstrap stack bounds (from the assembly stub below).
        static bootstrap_stack_bottom: u8;
        static bootstrap_stack_top: u8;
    }

    // Multiboot header, bootstrap stack, and the `_start` shim.
    core::arch::global_asm!(
        r#"
        .section .multiboot, "a"
        .align 4
        .long 0x1badb002
        .long 0x00000003
        .long -(0x1badb002 + 0x00000003)

        .section .bss
        .align 16
        .global bootstrap_stack_bottom
        bootstrap_stack_bottom:
        .skip {stack_size}
        .global bootstrap_stack_top
        bootstrap_stack_top:

        .section .text
        .global _start
        _start:
            mov esp, offset bootstrap_stack_top
            xor ebp, ebp
            push ebx
            push eax
            call kernel_main
        1:
            cli
            hlt
            jmp 1b
        "#,
        stack_size = const BOOT_STACK_SIZE,
    );

    /// The slice of the multiboot info structure the kernel consumes.
    #[repr(C)]
    struct MultibootInfo {
        flags: u32,
        /// KiB of conventional memory below 1 MiB.
        mem_lower: u32,
        /// KiB of memory above 1 MiB (up to the first hole).
        mem_upper: u32,
    }

    /// Timer IRQ: advance the clock, fire due timeouts, and ask for a
    /// preemptive reschedule once the dispatcher unwinds.
    fn timer_tick(_line: usize) {
        time::do_tick();
        thread::request_preemption();
    }

    /// The thread that keeps the ready queue non-empty forever.
    extern "C" fn idle_thread(_arg: usize) {
        loop {
            arch::idle_wait();
            let _ = thread::yield_cpu();
        }
    }

    #[no_mangle]
    pub extern "C" fn kernel_main(magic: u32, info: *const MultibootInfo) -> ! {
        logger::init();
        serial_println!("OpalOS {}", env!("CARGO_PKG_VERSION"));

        assert!(magic == MULTIBOOT_LOADER_MAGIC, "not loaded by a multiboot loader");
        // SAFETY: a multiboot loader passes a readable info structure.
        let ram_size = unsafe {
            assert!((*info).flags & 1 != 0, "loader provided no memory sizing");
            (((*info).mem_upper as usize) << 10) + (1 << 20)
        };
        log::info!("{} MiB of RAM", ram_size >> 20);

        // SAFETY: boot-time, single-threaded, interrupts still disabled.
        unsafe {
            gdt::setup();
            idt::setup();
            pic::setup();
            interrupts::setup();
            pit::set_frequency(TICK_HZ);
        }
        time::setup(Time::new(0, TICK_NSEC));

        // SAFETY: linker-script symbols delimit the loaded image; the
        // stack bounds come from the stub above.
        let (image_base, image_end, stack_bottom, stack_top) = unsafe {
            (
                &__kernel_start as *const u8 as usize,
                &__kernel_end as *const u8 as usize,
                &bootstrap_stack_bottom as *const u8 as usize,
                &bootstrap_stack_top as *const u8 as usize,
            )
        };

        // SAFETY: the area after the image is unused identity-mapped RAM.
        let (core_base, core_top) = unsafe {
            frame::setup_global(ram_size, image_base, image_end)
                .expect("RAM cannot hold the frame descriptors")
        };
        log::info!(
            "kernel core {core_base:#x}..{core_top:#x}, {} frames",
            frame::stats().total
        );

        // SAFETY: paging is off until this call; the frame allocator is
        // live.
        unsafe {
            paging::setup(core_base, core_top).expect("paging setup");
        }
        page_fault::install();

        // SAFETY: frames and paging are live; runs exactly once.
        unsafe {
            let layout = vmm::KmemLayout::boot(core_base, core_top, stack_bottom, stack_top);
            vmm::setup(&layout).expect("kernel range allocator setup");
        }
        kmalloc::setup().expect("kmalloc setup");

        scheduler::setup();
        thread::setup(stack_bottom, BOOT_STACK_SIZE).expect("thread subsystem setup");
        thread::create("idle", idle_thread, 0).expect("idle thread");

        interrupts::set_irq_handler(pic::IRQ_TIMER, Some(timer_tick));
        irq::enable();
        log::info!("scheduler running, timer at {TICK_HZ} Hz");

        #[cfg(feature = "testing")]
        opal_kernel::test_tasks::launch();

        // The bootstrap context is done; its stack and record are
        // reclaimed from the next thread. Only here must this be called
        // explicitly: every other thread reaches it by returning.
        thread::exit();
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        serial_println!("\n*** kernel panic: {info}");

        if let Some((base, size)) = thread::current_stack_extent() {
            let fp = arch::backtrace::current_frame_pointer();
            // SAFETY: the extent describes the running thread's stack.
            unsafe {
                arch::backtrace::walk(
                    0,
                    fp,
                    base,
                    size,
                    opal_kernel::config::BACKTRACE_MAX_DEPTH,
                    |pc, _args, depth| {
                        if depth > 0 {
                            serial_println!("  [{depth}] pc={pc:#010x}");
                        }
                    },
                );
            }
        }
        arch::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("opal-kernel is a bare-metal binary: build it for the i686-opal target");
}

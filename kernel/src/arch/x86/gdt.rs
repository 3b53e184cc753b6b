//! Flat-model global descriptor table.
//!
//! Three descriptors: null, kernel code, kernel data. Both segments cover
//! the full 4 GiB so that "virtual" addresses equal linear addresses; the
//! MMU does all the real work.

use crate::sync::cell::GlobalCell;

/// Kernel code segment selector (GDT slot 1, RPL 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data/stack segment selector (GDT slot 2, RPL 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// 4 GiB flat code segment: base 0, limit 0xfffff pages, ring 0,
/// execute/read, 32-bit, granularity 4 KiB.
const FLAT_CODE: u64 = 0x00cf_9a00_0000_ffff;
/// 4 GiB flat data segment: same shape, read/write.
const FLAT_DATA: u64 = 0x00cf_9200_0000_ffff;

static GDT: GlobalCell<[u64; 3]> = GlobalCell::new([0, FLAT_CODE, FLAT_DATA]);

/// Value loaded by `lgdt`: 16-bit limit + 32-bit base.
#[repr(C, packed)]
struct DescriptorTableRegister {
    limit: u16,
    base: u32,
}

/// Install the flat GDT and reload every segment register.
///
/// # Safety
///
/// Must run exactly once, early at boot, with interrupts disabled.
pub unsafe fn setup() {
    let gdtr = DescriptorTableRegister {
        limit: (core::mem::size_of::<[u64; 3]>() - 1) as u16,
        base: GDT.as_mut_ptr() as u32,
    };

    // SAFETY: the GDT is static storage; the far return reloads CS with
    // the new code selector and the moves reload the data selectors. The
    // descriptors describe the same flat space we are already running in,
    // so execution continues linearly.
    unsafe {
        core::arch::asm!(
            "lgdt [{gdtr}]",
            // Reload CS via far return.
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov ss, {data:x}",
            "xor {tmp}, {tmp}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            gdtr = in(reg) &gdtr,
            code = const KERNEL_CODE_SELECTOR as u32,
            data = in(reg) KERNEL_DATA_SELECTOR as u32,
            tmp = out(reg) _,
        );
    }
}

//! AArch64 MMU bring-up and the kernel context-switch primitive.

use core::arch::{asm, global_asm};

use crate::arch::addr::PAddr;

use super::trap::Armv8Context;

// Callee-saved context switch: save x19-x28, fp, lr, sp into `*from`, then
// load the same set from `*to` and return into the new context's saved lr.
// This is the "context save and restore" asm primitive.
global_asm!(
    r#"
.global sos_context_switch
sos_context_switch:
    stp x19, x20, [x0, #0]
    stp x21, x22, [x0, #16]
    stp x23, x24, [x0, #32]
    stp x25, x26, [x0, #48]
    stp x27, x28, [x0, #64]
    stp x29, x30, [x0, #80]
    mov x2, sp
    str x2, [x0, #96]

    ldp x19, x20, [x1, #0]
    ldp x21, x22, [x1, #16]
    ldp x23, x24, [x1, #32]
    ldp x25, x26, [x1, #48]
    ldp x27, x28, [x1, #64]
    ldp x29, x30, [x1, #80]
    ldr x2, [x1, #96]
    mov sp, x2
    ret
"#
);

extern "C" {
    fn sos_context_switch(from: *mut Armv8Context, to: *const Armv8Context);
}

/// # Safety
/// See `Arch::context_switch`.
pub unsafe fn context_switch(from: *mut Armv8Context, to: *const Armv8Context) {
    unsafe { sos_context_switch(from, to) };
}

// See the armv7 counterpart for why these exist: a freshly built context's
// `lr` points here instead of at a real return address, and `x19` carries
// the one-word argument `proc::create_kthread`/`proc::create_process` baked
// into the context during process/kthread creation.
global_asm!(
    r#"
.global sos_kthread_trampoline
sos_kthread_trampoline:
    mov x0, x19
    b proc_kthread_entry

.global sos_user_trampoline
sos_user_trampoline:
    mov x0, x19
    b proc_user_entry
"#
);

extern "C" {
    pub fn sos_kthread_trampoline();
    pub fn sos_user_trampoline();
}

/// Installs the kernel direct map in `TTBR1_EL1` and the temporary identity
/// map in `TTBR0_EL1`, configures `MAIR_EL1`/`TCR_EL1`, and turns the MMU on
/// via `SCTLR_EL1`.
///
/// # Safety
/// Must run exactly once, before any data access other than through the
/// identity map, and with `direct_map_root`/`identity_root` both describing
/// live, page-aligned translation tables.
pub unsafe fn enable_mmu(direct_map_root: PAddr, identity_root: PAddr) {
    const MAIR_DEVICE_IDX: u64 = 0;
    const MAIR_NORMAL_IDX: u64 = 1;
    // Attr0 = device-nGnRnE, Attr1 = normal write-back cacheable.
    let mair: u64 = (0x00u64 << (8 * MAIR_DEVICE_IDX)) | (0xFFu64 << (8 * MAIR_NORMAL_IDX));

    // 4 KiB granule both halves, 48-bit VA (T0SZ = T1SZ = 16), inner
    // shareable write-back for both table walks, TTBR1 active.
    let tcr: u64 = (16u64) // T0SZ
        | (16u64 << 16) // T1SZ
        | (0b01u64 << 12) // IRGN0 = WBWA
        | (0b01u64 << 14) // ORGN0 = WBWA
        | (0b11u64 << 8) // SH0 = inner shareable
        | (0b01u64 << 24) // IRGN1 = WBWA
        | (0b01u64 << 26) // ORGN1 = WBWA
        | (0b11u64 << 28) // SH1 = inner shareable
        | (0b10u64 << 30) // TG1 = 4KiB (value 10 for TTBR1)
        | (0b000u64 << 32) // IPS = 32-bit (enough for QEMU virt/RPi4 RAM sizes)
        ;

    unsafe {
        asm!("msr mair_el1, {x}", x = in(reg) mair);
        asm!("msr tcr_el1, {x}", x = in(reg) tcr);
        asm!("msr ttbr0_el1, {x}", x = in(reg) identity_root.addr() as u64);
        asm!("msr ttbr1_el1, {x}", x = in(reg) direct_map_root.addr() as u64);
        asm!("isb");

        // SCTLR_EL1: enable MMU (M), alignment checks off, data+instruction
        // caches on, so the MMU-enable boundary is crossed cleanly.
        let mut sctlr: u64;
        asm!("mrs {x}, sctlr_el1", x = out(reg) sctlr);
        sctlr |= 1 << 0; // M
        sctlr |= 1 << 2; // C
        sctlr |= 1 << 12; // I
        asm!("msr sctlr_el1, {x}", "isb", x = in(reg) sctlr);
    }
}

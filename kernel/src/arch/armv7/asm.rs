//! ARMv7-A MMU bring-up and the kernel context-switch primitive.

use core::arch::{asm, global_asm};

use crate::arch::addr::PAddr;

use super::trap::Armv7Context;

// Callee-saved context switch: save r4-r11, sp, lr into `*from`, then load
// the same set from `*to` and return into the new context's saved lr. This
// is the "context save and restore" asm primitive.
global_asm!(
    r#"
.global sos_context_switch
.type sos_context_switch, %function
sos_context_switch:
    str r4, [r0, #0]
    str r5, [r0, #4]
    str r6, [r0, #8]
    str r7, [r0, #12]
    str r8, [r0, #16]
    str r9, [r0, #20]
    str r10, [r0, #24]
    str r11, [r0, #28]
    str sp, [r0, #32]
    str lr, [r0, #36]

    ldr r4, [r1, #0]
    ldr r5, [r1, #4]
    ldr r6, [r1, #8]
    ldr r7, [r1, #12]
    ldr r8, [r1, #16]
    ldr r9, [r1, #20]
    ldr r10, [r1, #24]
    ldr r11, [r1, #28]
    ldr sp, [r1, #32]
    ldr lr, [r1, #36]
    bx lr
"#
);

extern "C" {
    fn sos_context_switch(from: *mut Armv7Context, to: *const Armv7Context);
}

/// # Safety
/// See `Arch::context_switch`.
pub unsafe fn context_switch(from: *mut Armv7Context, to: *const Armv7Context) {
    unsafe { sos_context_switch(from, to) };
}

// A freshly created process/kthread's saved context never comes from an
// earlier `sos_context_switch` -- it is built by hand during process/kthread
// creation. `sos_context_switch` restores r4 before branching to
// `lr`, so these two trampolines recover the one word of setup argument a
// new context carries (the kthread's `(fn, arg)` pair or the user process's
// trap-frame pointer) out of r4 and hand it to Rust as a normal first
// argument.
global_asm!(
    r#"
.global sos_kthread_trampoline
.type sos_kthread_trampoline, %function
sos_kthread_trampoline:
    mov r0, r4
    b proc_kthread_entry

.global sos_user_trampoline
.type sos_user_trampoline, %function
sos_user_trampoline:
    mov r0, r4
    b proc_user_entry
"#
);

extern "C" {
    pub fn sos_kthread_trampoline();
    pub fn sos_user_trampoline();
}

/// Installs the kernel direct map as TTBR1 and the temporary identity map as
/// TTBR0, configures the short-descriptor translation table base registers
/// and domain access control, and turns the MMU on via SCTLR.
///
/// # Safety
/// Must run exactly once, before any data access other than through the
/// identity map, and with `direct_map_root`/`identity_root` both describing
/// live, 16 KiB-aligned L1 translation tables.
pub unsafe fn enable_mmu(direct_map_root: PAddr, identity_root: PAddr) {
    unsafe {
        // TTBRC: split table walks so low addresses (user + identity
        // window) use TTBR0, high addresses (kernel direct map) use TTBR1.
        // N=0 keeps TTBR0 covering the full 4 GiB by default except where
        // TTBR1 is selected; this kernel instead relies on the direct map
        // living entirely above the identity window, so N=0 with TTBR1
        // carrying the upper half is sufficient.
        asm!(
            "mcr p15, 0, {ttbcr}, c2, c0, 2",
            ttbcr = in(reg) 0u32,
        );
        asm!(
            "mcr p15, 0, {ttbr0}, c2, c0, 0",
            ttbr0 = in(reg) identity_root.addr() as u32,
        );
        asm!(
            "mcr p15, 0, {ttbr1}, c2, c0, 1",
            ttbr1 = in(reg) direct_map_root.addr() as u32,
        );
        // Domain 0 = client: table-entry AP bits are checked, no blanket
        // manager override.
        asm!(
            "mcr p15, 0, {dacr}, c3, c0, 0",
            dacr = in(reg) 0x1u32,
        );
        asm!("dsb", "isb");

        let mut sctlr: u32;
        asm!("mrc p15, 0, {x}, c1, c0, 0", x = out(reg) sctlr);
        sctlr |= 1 << 0; // M: MMU enable
        sctlr |= 1 << 2; // C: data cache
        sctlr |= 1 << 12; // I: instruction cache
        sctlr &= !(1 << 29); // AFE=0: full AP model, no access-flag faulting
        asm!("mcr p15, 0, {x}, c1, c0, 0", "isb", x = in(reg) sctlr);
    }
}

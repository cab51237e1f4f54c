//! AArch64 exception vector table, trap frame, and `return_from_exception`.
//!
//! Exception-vector table with entry points for supervisor call, IRQ,
//! prefetch abort, and data abort; dispatch into kernel-generic
//! code happens in `crate::trap`.

use core::arch::{asm, global_asm};

use crate::arch::addr::PAddr;
use crate::arch::interface::{ContextManager, TrapFrame as TrapFrameTrait};
use crate::trap::{handle_trap, TrapSource};

/// Callee-saved context for a blocked kthread/process. Layout must match
/// the offsets `asm.rs`'s
/// `sos_context_switch` uses.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Armv8Context {
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    sp: u64,
}

impl ContextManager for Armv8Context {
    fn zeroed() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
            sp: 0,
        }
    }

    fn set_entry(&mut self, pc: usize) {
        self.lr = pc as u64;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp as u64;
    }

    fn set_arg0(&mut self, arg: usize) {
        // Kthreads start through a small trampoline (see `proc::kthread_trampoline`)
        // that expects its argument in x19, the first callee-saved register
        // `sos_context_switch` restores before jumping to `lr`.
        self.x19 = arg as u64;
    }
}

/// Full user-mode register file, saved/restored by the exception vectors.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Armv8Trap {
    pub regs: [u64; 31],
    pub sp_el0: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
}

impl TrapFrameTrait for Armv8Trap {
    fn zeroed() -> Self {
        Self::default()
    }

    fn set_pc(&mut self, pc: usize) {
        self.elr_el1 = pc as u64;
    }

    fn set_sp(&mut self, sp: usize) {
        self.sp_el0 = sp as u64;
    }

    fn set_syscall_ret(&mut self, val: usize) {
        self.regs[0] = val as u64;
    }

    fn syscall_num(&self) -> i32 {
        self.regs[8] as i32
    }

    fn syscall_arg(&self, index: usize) -> usize {
        self.regs[index] as usize
    }

    fn from_user(&self) -> bool {
        // SPSR_EL1.M[3:0] == 0b0000 is EL0t; any other value is an EL1 mode.
        self.spsr_el1 & 0xf == 0
    }

    fn pc(&self) -> usize {
        self.elr_el1 as usize
    }
}

/// Must match `Armv8Trap`'s layout exactly; checked below.
const FRAME_SIZE: usize = 272;

static_assertions::const_assert_eq!(FRAME_SIZE, core::mem::size_of::<Armv8Trap>());

global_asm!(
    r#"
.macro SAVE_FRAME
    sub sp, sp, #272
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    mrs x0, sp_el0
    mrs x1, elr_el1
    mrs x2, spsr_el1
    stp x0, x1, [sp, #248]
    str x2, [sp, #264]
.endm

.macro RESTORE_FRAME
    ldp x0, x1, [sp, #248]
    ldr x2, [sp, #264]
    msr sp_el0, x0
    msr elr_el1, x1
    msr spsr_el1, x2
    ldp x0, x1, [sp, #0]
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    add sp, sp, #272
.endm

.align 11
.global sos_vectors
sos_vectors:
// Current EL with SP0 (never taken: we always run EL1 on SP_EL1).
.align 7
b .
.align 7
b .
.align 7
b .
.align 7
b .
// Current EL with SPx: kernel-mode traps.
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #0
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #1
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #2
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #3
bl sos_trap_dispatch
RESTORE_FRAME
eret
// Lower EL using AArch64: user-mode traps (syscall, IRQ, aborts).
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #4
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #5
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #6
bl sos_trap_dispatch
RESTORE_FRAME
eret
.align 7
SAVE_FRAME
mov x0, sp
mov x1, #7
bl sos_trap_dispatch
RESTORE_FRAME
eret
// Lower EL using AArch32: not supported, this kernel's user mode is
// AArch64-only.
.align 7
b .
.align 7
b .
.align 7
b .
.align 7
b .

.global sos_return_from_exception
sos_return_from_exception:
// x0 = &Armv8Trap, x1 = ttbr0 physical root.
msr ttbr0_el1, x1
isb
tlbi vmalle1
dsb ish
isb
mov sp, x0
RESTORE_FRAME
eret
"#
);

extern "C" {
    fn sos_vectors();
    fn sos_return_from_exception(frame: *const Armv8Trap, ttbr0: u64) -> !;
}

/// Reads `ESR_EL1` and classifies a synchronous exception's exception
/// class (bits 31:26) into the architecture-independent `TrapSource`.
fn classify_sync() -> TrapSource {
    let esr: u64;
    unsafe { asm!("mrs {x}, esr_el1", x = out(reg) esr) };
    let ec = (esr >> 26) & 0x3f;
    match ec {
        0x15 => TrapSource::Syscall,           // SVC from AArch64
        0x20 | 0x21 => TrapSource::PrefetchAbort, // instruction abort, lower/same EL
        0x24 | 0x25 => TrapSource::DataAbort,      // data abort, lower/same EL
        _ => TrapSource::Undefined,
    }
}

#[no_mangle]
extern "C" fn sos_trap_dispatch(frame: *mut Armv8Trap, vector: u64) {
    let kind = vector % 4;
    let source = match kind {
        0 => classify_sync(),
        1 => TrapSource::Irq,
        3 => TrapSource::SError,
        _ => TrapSource::Undefined, // FIQ: unused by this kernel
    };
    // SAFETY: `frame` points at a just-saved, full register file on the
    // current exception stack; it outlives this call.
    let frame = unsafe { &mut *frame };
    handle_trap(frame, source);
}

/// # Safety
/// See `Arch::install_vectors`.
pub unsafe fn install_vectors() {
    unsafe {
        asm!("msr vbar_el1, {x}", "isb", x = in(reg) sos_vectors as u64);
    }
}

/// # Safety
/// See `Arch::return_from_exception`.
pub unsafe fn return_from_exception(ctx: &Armv8Trap, ttbr0: PAddr) -> ! {
    unsafe { sos_return_from_exception(ctx as *const Armv8Trap, ttbr0.addr() as u64) }
}

//! ARMv7-A exception vector table, trap frame, and `return_from_exception`.
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
pub struct Armv7Context {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    sp: u32,
    lr: u32,
}

impl ContextManager for Armv7Context {
    fn zeroed() -> Self {
        Self {
            r4: 0,
            r5: 0,
            r6: 0,
            r7: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            sp: 0,
            lr: 0,
        }
    }

    fn set_entry(&mut self, pc: usize) {
        self.lr = pc as u32;
    }

    fn set_stack(&mut self, sp: usize) {
        self.sp = sp as u32;
    }

    fn set_arg0(&mut self, arg: usize) {
        // Kthreads start through a small trampoline (see `proc::kthread_trampoline`)
        // that expects its argument in r4, the first register
        // `sos_context_switch` restores before branching to `lr`.
        self.r4 = arg as u32;
    }
}

/// Full user-mode register file, saved/restored by the exception vectors.
/// Field order matches the push sequence in the `EXC_STUB` macro below:
/// `sp_usr`/`lr_usr` first, then `spsr`, then `r0..r12`, then the adjusted
/// return address last.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Armv7Trap {
    pub sp_usr: u32,
    pub lr_usr: u32,
    pub spsr: u32,
    pub regs: [u32; 13],
    pub lr_exc: u32,
}

impl TrapFrameTrait for Armv7Trap {
    fn zeroed() -> Self {
        Self::default()
    }

    fn set_pc(&mut self, pc: usize) {
        self.lr_exc = pc as u32;
    }

    fn set_sp(&mut self, sp: usize) {
        self.sp_usr = sp as u32;
    }

    fn set_syscall_ret(&mut self, val: usize) {
        self.regs[0] = val as u32;
    }

    fn syscall_num(&self) -> i32 {
        self.regs[7] as i32
    }

    fn syscall_arg(&self, index: usize) -> usize {
        self.regs[index] as usize
    }

    fn from_user(&self) -> bool {
        // CPSR mode field, bits [4:0]: 0b10000 is User mode; every
        // privileged mode has bit 4 set to something else or the full
        // field reads as a supervisor/abort/irq/undef/system encoding.
        self.spsr & 0x1f == 0x10
    }

    fn pc(&self) -> usize {
        self.lr_exc as usize
    }
}

/// Must match `Armv7Trap`'s layout exactly; checked below.
const FRAME_SIZE: usize = 68;

static_assertions::const_assert_eq!(FRAME_SIZE, core::mem::size_of::<Armv7Trap>());

// CPSR mode numbers.
const MODE_SYS: u32 = 0x1f;

global_asm!(
    r#"
.macro EXC_STUB name, mode_num, correction, source
.align 5
.global \name
\name:
    sub lr, lr, #\correction
    push {{r0-r12, lr}}
    mrs r0, spsr
    push {{r0}}
    cps #0x1f
    mov r1, sp
    mov r2, lr
    cps #\mode_num
    push {{r1, r2}}

    mov r0, sp
    mov r1, #\source
    bl sos_trap_dispatch

    pop {{r1, r2}}
    cps #0x1f
    mov sp, r1
    mov lr, r2
    cps #\mode_num
    pop {{r0}}
    msr spsr_cxsf, r0
    pop {{r0-r12, lr}}
    movs pc, lr
.endm

.align 5
.global sos_vectors
sos_vectors:
    b sos_reset
    b sos_undef
    b sos_swi
    b sos_prefetch_abort
    b sos_data_abort
    b sos_reserved
    b sos_irq
    b sos_fiq

sos_reset:
    b sos_reset
sos_reserved:
    b sos_reserved
sos_fiq:
    b sos_fiq

EXC_STUB sos_undef, 0x1b, 4, 0
EXC_STUB sos_swi, 0x13, 0, 1
EXC_STUB sos_prefetch_abort, 0x17, 4, 2
EXC_STUB sos_data_abort, 0x17, 8, 3
EXC_STUB sos_irq, 0x12, 4, 4
"#
);

extern "C" {
    fn sos_vectors();
    fn sos_undef();
    fn sos_swi();
}

#[no_mangle]
extern "C" fn sos_trap_dispatch(frame: *mut Armv7Trap, vector: u32) {
    let source = match vector {
        0 => TrapSource::Undefined,
        1 => TrapSource::Syscall,
        2 => TrapSource::PrefetchAbort,
        3 => TrapSource::DataAbort,
        _ => TrapSource::Irq,
    };
    // SAFETY: `frame` points at a just-saved, full register file on the
    // current exception stack; it outlives this call.
    let frame = unsafe { &mut *frame };
    handle_trap(frame, source);
}

/// # Safety
/// See `Arch::install_vectors`.
pub unsafe fn install_vectors() {
    let _ = (sos_undef as usize, sos_swi as usize, MODE_SYS);
    unsafe {
        asm!(
            "mcr p15, 0, {x}, c12, c0, 0",
            "isb",
            x = in(reg) sos_vectors as u32,
        );
    }
}

/// # Safety
/// See `Arch::return_from_exception`.
pub unsafe fn return_from_exception(ctx: &Armv7Trap, ttbr0: PAddr) -> ! {
    unsafe {
        asm!(
            "mcr p15, 0, {ttbr0}, c2, c0, 0",
            "isb",
            "mcr p15, 0, {z}, c8, c7, 0",
            "dsb",
            "isb",
            ttbr0 = in(reg) ttbr0.addr() as u32,
            z = in(reg) 0u32,
        );
        sos_resume_from_trap(ctx as *const Armv7Trap)
    }
}

extern "C" {
    fn sos_resume_from_trap(frame: *const Armv7Trap) -> !;
}

global_asm!(
    r#"
.global sos_resume_from_trap
.type sos_resume_from_trap, %function
sos_resume_from_trap:
    mov sp, r0
    pop {{r1, r2}}
    cps #0x1f
    mov sp, r1
    mov lr, r2
    cps #0x13
    pop {{r0}}
    msr spsr_cxsf, r0
    pop {{r0-r12, lr}}
    movs pc, lr
"#
);

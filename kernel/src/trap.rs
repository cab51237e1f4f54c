//! Architecture-independent exception dispatch. Exceptions are not control
//! flow; they are diagnostic events.
//!
//! Each `arch::{armv7,armv8}::trap` module saves the full register state
//! into a `TrapFrame` on its own exception stack and calls [`handle_trap`]
//! with a [`TrapSource`] decoded from the vector that fired. This module
//! never runs with interrupts re-enabled and must not block: handlers are
//! not re-entrant.

use crate::arch::interface::TrapFrame;
use crate::kinfo;
use crate::kerror;
use crate::proc;
use crate::syscall;

/// The architecture-independent classification of a vectored exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapSource {
    Syscall,
    Irq,
    PrefetchAbort,
    DataAbort,
    Undefined,
    SError,
}

/// Entry point called from every architecture's exception vector stub,
/// already holding a fully-saved register frame.
pub fn handle_trap<T: TrapFrame>(frame: &mut T, source: TrapSource) {
    match source {
        TrapSource::Syscall => {
            let num = frame.syscall_num();
            let a0 = frame.syscall_arg(0);
            let a1 = frame.syscall_arg(1);
            let a2 = frame.syscall_arg(2);
            let a3 = frame.syscall_arg(3);
            let ret = syscall::dispatch(num, [a0, a1, a2, a3]);
            frame.set_syscall_ret(ret);
        }
        TrapSource::Irq => {
            crate::gic::handle_irq();
            maybe_preempt(frame);
        }
        TrapSource::PrefetchAbort | TrapSource::DataAbort | TrapSource::Undefined | TrapSource::SError => {
            handle_fault(frame, source);
        }
    }
}

/// Preempts the current user/kthread at a timer tick if it is safe to do so
/// if it is safe: user processes are preempted at the timer tick when
/// possible, otherwise the interrupt returns to the same task. Kernel-mode
/// exceptions (e.g. a nested IRQ while already in a handler) never preempt.
fn maybe_preempt<T: TrapFrame>(frame: &T) {
    if frame.from_user() {
        proc::yield_current();
    }
}

fn handle_fault<T: TrapFrame>(frame: &T, source: TrapSource) {
    let pc = frame.pc();
    kerror!("trap: {:?} at pc={:#x} (from_user={})", source, pc, frame.from_user());
    if frame.from_user() {
        // Translation faults and prefetch aborts are fatal to the offending
        // process, not the kernel.
        proc::kill_current(pc);
    } else {
        kinfo!("trap: fatal kernel-mode exception, halting");
        crate::utils::spin_loop();
    }
}

//! GICv2 distributor + CPU interface. Both QEMU `virt`'s default GIC and the
//! Raspberry Pi 4B's GIC-400 implement GICv2 (the `gicv3` feature is
//! reserved for a future redistributor-based port and is not wired up by
//! this kernel's boot path).
//!
//! The distributor/CPU-interface `register_structs!` layout and field names
//! (`ISENABLER`/`IPRIORITYR`/`ITARGETSR`/`ICFGR`) follow the GICv2
//! architecture spec directly. The free-function `register_isr`/`enable`/
//! `acknowledge`/`end`/`get_name` API wrapping it mirrors a PLIC-style
//! claim/complete driver shape, generalized from a single claim register to
//! the GIC's distributor + CPU interface pair.

use core::sync::atomic::{AtomicUsize, Ordering};

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

use crate::arch::memlayout::BOARD;
use crate::param::NIRQ;

const GIC_MAX_INTID: usize = 1024;
const GIC_WORDS_1BIT: usize = GIC_MAX_INTID / 32;
const GIC_WORDS_8BIT: usize = GIC_MAX_INTID * 8 / 32;
const GIC_WORDS_2BIT: usize = GIC_MAX_INTID * 2 / 32;

register_structs! {
    #[allow(non_snake_case)]
    GicDistributorBlock {
        (0x000 => CTLR: ReadWrite<u32>),
        (0x004 => TYPER: ReadOnly<u32>),
        (0x008 => _reserved_0),
        (0x100 => ISENABLER: [ReadWrite<u32>; GIC_WORDS_1BIT]),
        (0x180 => _reserved_1),
        (0x400 => IPRIORITYR: [ReadWrite<u32>; GIC_WORDS_8BIT]),
        (0x800 => ITARGETSR: [ReadWrite<u32>; GIC_WORDS_8BIT]),
        (0xc00 => ICFGR: [ReadWrite<u32>; GIC_WORDS_2BIT]),
        (0xd00 => _reserved_2),
        (0x1000 => @END),
    }
}

register_structs! {
    #[allow(non_snake_case)]
    GicCpuInterfaceBlock {
        (0x000 => CTLR: ReadWrite<u32>),
        (0x004 => PMR: ReadWrite<u32>),
        (0x008 => _reserved_0),
        (0x00c => IAR: ReadOnly<u32>),
        (0x010 => EOIR: WriteOnly<u32>),
        (0x014 => _reserved_1),
        (0x1000 => @END),
    }
}

struct Base {
    gicd: AtomicUsize,
    gicc: AtomicUsize,
}

static BASE: Base = Base {
    gicd: AtomicUsize::new(0),
    gicc: AtomicUsize::new(0),
};

fn gicd() -> &'static GicDistributorBlock {
    // SAFETY: `BASE.gicd` is a mapped, dereferenceable GICv2 distributor
    // MMIO base once `init` has run, which every caller of this function
    // postdates.
    unsafe { &*(BASE.gicd.load(Ordering::Relaxed) as *const GicDistributorBlock) }
}

fn gicc() -> &'static GicCpuInterfaceBlock {
    // SAFETY: see `gicd`.
    unsafe { &*(BASE.gicc.load(Ordering::Relaxed) as *const GicCpuInterfaceBlock) }
}

struct IsrSlot {
    handler: Option<fn(u32)>,
    name: &'static str,
}

const EMPTY_SLOT: IsrSlot = IsrSlot {
    handler: None,
    name: "unregistered",
};

static mut HANDLERS: [IsrSlot; NIRQ] = [EMPTY_SLOT; NIRQ];

/// Programs the distributor and CPU interface bases and turns both on.
/// Board-specific bring-up beyond this (device-tree derived GIC variants) is
/// out of scope; `BOARD` already names the two MMIO bases directly.
///
/// # Safety
/// Must run once, after the direct map (or the pre-MMU identity map) makes
/// `gicd_virt`/`gicc_virt` dereferenceable, and before `intr_on`.
pub unsafe fn init(gicd_virt: usize, gicc_virt: usize) {
    BASE.gicd.store(gicd_virt, Ordering::Relaxed);
    BASE.gicc.store(gicc_virt, Ordering::Relaxed);
    gicd().CTLR.set(1); // enable distributor, group 0
    gicc().PMR.set(0xff); // accept all priorities
    gicc().CTLR.set(1); // enable CPU interface
}

/// Registers `handler` for `intid`, `count` consecutive interrupt lines
/// starting there; `count` lets one call cover a block of per-queue or
/// per-port lines from the same device family. Routes the line(s) to this
/// CPU and gives them a mid priority.
pub fn register_isr(intid: u32, count: u32, handler: fn(u32), name: &'static str) {
    for id in intid..intid + count {
        let idx = id as usize;
        if idx >= NIRQ {
            crate::kwarn!("gic: intid {} out of range, dropping registration for {}", id, name);
            continue;
        }
        // SAFETY: boot-time registration, before interrupts are enabled for
        // any of these lines.
        unsafe {
            HANDLERS[idx] = IsrSlot {
                handler: Some(handler),
                name,
            };
        }
        let word = idx / 4;
        let shift = (idx % 4) * 8;

        let targets = gicd().ITARGETSR[word].get();
        gicd().ITARGETSR[word].set((targets & !(0xff << shift)) | (1 << shift)); // target CPU 0

        let prio = gicd().IPRIORITYR[word].get();
        gicd().IPRIORITYR[word].set(prio & !(0xff << shift)); // priority 0 == highest
    }
}

/// Enables `intid` at the distributor (must already have been registered).
pub fn enable(intid: u32) {
    let idx = intid as usize;
    gicd().ISENABLER[idx / 32].set(1u32 << (intid % 32));
}

/// Reads the CPU interface's interrupt-acknowledge register, latching the
/// currently highest-priority pending interrupt as "active" until `end` is
/// called for it.
pub fn acknowledge() -> u32 {
    gicc().IAR.get() & 0x3ff
}

/// Writes the end-of-interrupt register for `intid`, the counterpart to
/// `acknowledge`.
pub fn end(intid: u32) {
    gicc().EOIR.set(intid);
}

/// Diagnostic name of the handler registered for `intid`, or `"unregistered"`.
pub fn get_name(intid: u32) -> &'static str {
    let idx = intid as usize;
    if idx >= NIRQ {
        return "out-of-range";
    }
    // SAFETY: read-only diagnostic access; `HANDLERS` is only mutated at
    // boot-time registration before interrupts are enabled.
    unsafe { HANDLERS[idx].name }
}

/// Called from `trap::handle_trap`'s `TrapSource::Irq` arm: acknowledges,
/// dispatches to the registered handler (if any), and signals end-of-
/// interrupt. A spurious/unregistered intid (1023, or one with no handler)
/// is logged and still EOI'd so the controller doesn't wedge.
pub fn handle_irq() {
    let intid = acknowledge();
    if intid >= 1020 {
        return; // spurious
    }
    let idx = intid as usize;
    // SAFETY: read-only after boot-time registration.
    let handler = if idx < NIRQ {
        unsafe { HANDLERS[idx].handler }
    } else {
        None
    };
    match handler {
        Some(f) => f(intid),
        None => crate::kwarn!("gic: unhandled irq {}", intid),
    }
    end(intid);
}

/// Convenience: brings up the GIC using `BOARD`'s own distributor/CPU
/// interface bases, mapped as device memory by the caller (MMU/KMEM) first.
pub fn init_from_board(gicd_virt: usize, gicc_virt: usize) {
    // SAFETY: caller (boot sequencing) guarantees ordering.
    unsafe { init(gicd_virt, gicc_virt) };
    let _ = BOARD.gicd_base; // BOARD constants feed the mapping step, not here.
}

//! ARMv7-A (AArch32), 4 KiB granule, 2-level short-descriptor tables.

mod asm;
mod mmu;
mod trap;

pub use asm::{sos_kthread_trampoline as kthread_trampoline, sos_user_trampoline as user_trampoline};
pub use mmu::Armv7Table;
pub use trap::{Armv7Context, Armv7Trap};

use core::arch::asm as core_asm;

use crate::arch::addr::{PAddr, VAddr};
use crate::arch::interface::Arch;

pub struct Armv7;

impl Arch for Armv7 {
    type Context = Armv7Context;
    type Trap = Armv7Trap;
    type Table = Armv7Table;

    const TABLE_LEVELS: usize = 2;
    const BLOCK_SIZE: usize = 1024 * 1024;

    unsafe fn enable_mmu(direct_map: &Self::Table, identity: &Self::Table) {
        unsafe { asm::enable_mmu(direct_map.root_paddr(), identity.root_paddr()) };
    }

    unsafe fn set_user_table(table_root: PAddr, _asid: u16) {
        // ARMv7-A short-descriptor translation has no ASID tagging in this
        // kernel's configuration (no CONTEXTIDR use): every user switch
        // does a full local TLB invalidate instead.
        unsafe {
            core_asm!(
                "mcr p15, 0, {x}, c2, c0, 0",
                "isb",
                x = in(reg) table_root.addr() as u32,
            );
        }
        Self::tlb_invalidate_asid(0);
    }

    fn tlb_invalidate_asid(_asid: u16) {
        unsafe {
            core_asm!(
                "mcr p15, 0, {z}, c8, c7, 0",
                "dsb",
                "isb",
                z = in(reg) 0u32,
            );
        }
    }

    fn tlb_invalidate_page(virt: VAddr) {
        unsafe {
            core_asm!(
                "mcr p15, 0, {x}, c8, c7, 1",
                "dsb",
                "isb",
                x = in(reg) (virt.addr() as u32) & !0xfff,
            );
        }
    }

    fn data_barrier() {
        unsafe { core_asm!("dsb") };
    }

    fn instruction_barrier() {
        unsafe { core_asm!("isb") };
    }

    fn intr_on() {
        unsafe { core_asm!("cpsie i") };
    }

    fn intr_off() {
        unsafe { core_asm!("cpsid i") };
    }

    fn intr_get() -> bool {
        let cpsr: u32;
        unsafe { core_asm!("mrs {x}, cpsr", x = out(reg) cpsr) };
        cpsr & (1 << 7) == 0
    }

    unsafe fn install_vectors() {
        unsafe { trap::install_vectors() };
    }

    unsafe fn return_from_exception(ctx: &Self::Trap, ttbr0: PAddr) -> ! {
        unsafe { trap::return_from_exception(ctx, ttbr0) }
    }

    unsafe fn context_switch(from: *mut Self::Context, to: *const Self::Context) {
        unsafe { asm::context_switch(from, to) };
    }
}

pub fn cpu_id() -> usize {
    let mpidr: u32;
    unsafe { core_asm!("mrc p15, 0, {x}, c0, c0, 5", x = out(reg) mpidr) };
    (mpidr & 0xff) as usize
}

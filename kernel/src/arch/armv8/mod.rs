//! ARMv8-A (AArch64), 4 KiB granule, 4-level translation tables.

mod asm;
mod mmu;
mod trap;

pub use asm::{sos_kthread_trampoline as kthread_trampoline, sos_user_trampoline as user_trampoline};
pub use mmu::Armv8Table;
pub use trap::{Armv8Context, Armv8Trap};

use core::arch::asm as core_asm;

use cortex_a::asm::barrier;
use cortex_a::registers::{DAIF, MPIDR_EL1, TTBR0_EL1};
use tock_registers::interfaces::{Readable, ReadWriteable, Writeable};

use crate::arch::addr::{PAddr, VAddr};
use crate::arch::interface::Arch;

pub struct Armv8;

impl Arch for Armv8 {
    type Context = Armv8Context;
    type Trap = Armv8Trap;
    type Table = Armv8Table;

    const TABLE_LEVELS: usize = 4;
    const BLOCK_SIZE: usize = 2 * 1024 * 1024;

    unsafe fn enable_mmu(direct_map: &Self::Table, identity: &Self::Table) {
        unsafe { asm::enable_mmu(direct_map.root_paddr(), identity.root_paddr()) };
    }

    unsafe fn set_user_table(table_root: PAddr, asid: u16) {
        let val = ((asid as u64) << 48) | (table_root.addr() as u64);
        TTBR0_EL1.set(val);
        barrier::isb(barrier::SY);
    }

    fn tlb_invalidate_asid(asid: u16) {
        unsafe {
            core_asm!(
                "dsb ishst",
                "tlbi aside1is, {x}",
                "dsb ish",
                "isb",
                x = in(reg) (asid as u64) << 48,
            );
        }
    }

    fn tlb_invalidate_page(virt: VAddr) {
        unsafe {
            core_asm!(
                "dsb ishst",
                "tlbi vaae1is, {x}",
                "dsb ish",
                "isb",
                x = in(reg) (virt.addr() as u64) >> 12,
            );
        }
    }

    fn data_barrier() {
        barrier::dsb(barrier::SY);
    }

    fn instruction_barrier() {
        barrier::isb(barrier::SY);
    }

    fn intr_on() {
        DAIF.modify(DAIF::I::Unmasked);
    }

    fn intr_off() {
        DAIF.modify(DAIF::I::Masked);
    }

    fn intr_get() -> bool {
        DAIF.matches_all(DAIF::I::Unmasked)
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
    (MPIDR_EL1.get() & 0xff) as usize
}

//! The boundary between architecture-independent kernel code and the two
//! concrete ARM widths (`arch::armv7`, `arch::armv8`). Grounded on the
//! teacher's `arch::interface::Arch` split (there: `Riscv`/`Armv8`); this
//! kernel narrows the split to `Armv7`/`Armv8`.

use crate::arch::addr::{PAddr, VAddr};
use crate::error::KResult;

/// A single contiguous leaf mapping request passed to `map_blocks`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapAttrs {
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    /// Device (non-cacheable, strongly-ordered) memory rather than normal RAM.
    pub device: bool,
}

impl MapAttrs {
    pub const KERNEL_RWX_NORMAL: Self = Self {
        writable: true,
        executable: true,
        user: false,
        device: false,
    };
    pub const KERNEL_DEVICE: Self = Self {
        writable: true,
        executable: false,
        user: false,
        device: true,
    };
    pub const USER_RW: Self = Self {
        writable: true,
        executable: false,
        user: true,
        device: false,
    };
    pub const USER_RWX: Self = Self {
        writable: true,
        executable: true,
        user: true,
        device: false,
    };
}

/// A saved register context for a blocked/not-yet-run kthread or process.
/// Implementors hold exactly the callee-saved registers plus stack pointer
/// and link register needed by the architecture's `context_switch` asm
/// primitive ("Context save and restore").
pub trait ContextManager: Copy + Clone {
    fn zeroed() -> Self;
    fn set_entry(&mut self, pc: usize);
    fn set_stack(&mut self, sp: usize);
    fn set_arg0(&mut self, arg: usize);
}

/// Saved user-mode register state, restored by `return_from_exception`.
pub trait TrapFrame: Copy + Clone {
    fn zeroed() -> Self;
    fn set_pc(&mut self, pc: usize);
    fn set_sp(&mut self, sp: usize);
    fn set_syscall_ret(&mut self, val: usize);
    fn syscall_num(&self) -> i32;
    fn syscall_arg(&self, index: usize) -> usize;
    /// True if the saved state describes an EL0/user-mode exception entry
    /// rather than a kernel-mode one (decoded from the saved processor
    /// state, not from which vector fired -- on ARMv7-A a data abort can
    /// enter from either mode through the same vector).
    fn from_user(&self) -> bool;
    fn pc(&self) -> usize;
}

/// One per-process (or kernel) page table. `Armv7Table`/`Armv8Table`
/// implement the arch-specific tree shape.
/// Translates a physical address that backs a page table into a pointer the
/// CPU can currently dereference: identity (`p as *mut _`) before the MMU is
/// enabled, direct-map (`p + offset`) after. Passed down into `PageTable` so
/// table-building code never has to know which phase it runs in.
pub type PhysAccess<'a> = &'a dyn Fn(PAddr) -> *mut u64;

/// Allocates a table node: `nbytes` (rounded up to a page), aligned to
/// `1 << align_bits`, from the backing PAGE allocator. Matches
/// `PAGE::alloc`'s own signature, since a table node is just
/// another allocation out of the same physical-RAM zone allocator -- a
/// 16 KiB, 16 KiB-aligned ARMv7-A L1 table and a 4 KiB ARMv8-A table both
/// come from this one callback.
pub type AllocTable<'a> = &'a mut dyn FnMut(usize, u32) -> Option<PAddr>;

pub trait PageTable: Sized {
    /// Allocates an empty table via `alloc_table`.
    fn new_empty(alloc_table: AllocTable<'_>, access: PhysAccess<'_>) -> KResult<Self>;

    fn root_paddr(&self) -> PAddr;

    /// Inserts leaf entries covering `[virt, virt+len)` -> `[phys, phys+len)`
    /// using the largest block size alignment permits. `virt`/`phys`/`len`
    /// must already be page-aligned; the
    /// new range must be disjoint from any existing mapping, which this
    /// function asserts by construction (first mapping wins, a second
    /// attempt over the same leaf is refused).
    fn map_blocks(
        &mut self,
        virt: VAddr,
        phys: PAddr,
        len: usize,
        attrs: MapAttrs,
        alloc_table: AllocTable<'_>,
        access: PhysAccess<'_>,
    ) -> KResult<()>;

    /// Page-table walk: virtual to physical, or `None` if unmapped.
    fn lookup(&self, virt: VAddr, access: PhysAccess<'_>) -> Option<PAddr>;

    /// Frees every intermediate (non-leaf) table page this table owns,
    /// invoking `free_page` for each one. Leaf-mapped RAM is left to the
    /// caller.
    fn free_tables(&mut self, free_page: &mut dyn FnMut(PAddr), access: PhysAccess<'_>);
}

/// Architecture primitives consumed by MMU/PROC: barriers, cache/TLB
/// maintenance, interrupt masking, and the
/// two asm entry points that cross the MMU-enable and user-mode boundaries.
pub trait Arch {
    type Context: ContextManager;
    type Trap: TrapFrame;
    type Table: PageTable;

    /// Number of page-table levels (2 on ARMv7-A, 4 on ARMv8-A).
    const TABLE_LEVELS: usize;

    /// Largest block size one level above a leaf page, in bytes (1 MiB
    /// section on ARMv7-A; 2 MiB block on ARMv8-A -- 1 GiB blocks are used
    /// opportunistically by `map_blocks` but are not this constant).
    const BLOCK_SIZE: usize;

    /// Builds the kernel direct map + temporary identity map and enables
    /// the MMU. Returns the direct-map table so
    /// the caller (MMU module) can retain it, and the identity table so it
    /// can later be walked and freed.
    ///
    /// # Safety
    /// Must be called exactly once, before any virtual memory access other
    /// than through the identity map, with the CPU still executing at its
    /// physical load address.
    unsafe fn enable_mmu(direct_map: &Self::Table, identity: &Self::Table);

    /// Installs `table` as the current user translation base and tags it
    /// with `asid`.
    ///
    /// # Safety
    /// `table` must remain valid and unmoved while installed.
    unsafe fn set_user_table(table_root: PAddr, asid: u16);

    /// Invalidates every TLB entry tagged with `asid` (ARMv8) or the whole
    /// local TLB (ARMv7, which has no ASID tagging in this kernel's
    /// configuration).
    fn tlb_invalidate_asid(asid: u16);

    /// Invalidates a single page's TLB entry.
    fn tlb_invalidate_page(virt: VAddr);

    fn data_barrier();
    fn instruction_barrier();

    fn intr_on();
    fn intr_off();
    fn intr_get() -> bool;

    /// Installs the kernel's exception vector table. Called once at boot.
    ///
    /// # Safety
    /// Must be called before any exception can occur on this core.
    unsafe fn install_vectors();

    /// Restores `ctx` and returns to user mode. Never returns.
    ///
    /// # Safety
    /// `ctx` must describe a valid, runnable user-mode register state, and
    /// `ttbr0` must be the physical root of a live user page table.
    unsafe fn return_from_exception(ctx: &Self::Trap, ttbr0: PAddr) -> !;

    /// Switches from `from` to `to`'s saved kernel context. Returns when some other core switches
    /// back to `from` (always true here: single CPU, so this returns when
    /// the scheduler picks `from` again).
    ///
    /// # Safety
    /// Both contexts must be valid kernel stacks belonging to a kthread or
    /// a process currently not running.
    unsafe fn context_switch(from: *mut Self::Context, to: *const Self::Context);
}

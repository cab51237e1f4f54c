//! The architecture-independent half of the MMU layer (spec.md §4.2):
//! pre-MMU direct-map + identity-map bring-up, post-MMU identity teardown
//! and pointer rebasing, `map_periph`, and per-process
//! `umem_map`/`umem_lookup`/`umem_free`. The per-architecture leaf-mapping
//! details (section/block sizes, descriptor bit layout) live behind
//! `arch::interface::{Arch, PageTable}`; this module only ever calls through
//! that trait boundary, mirroring the split `page.rs`'s `ZoneHeader` has
//! from the architecture entirely.
//!
//! Grounded on the teacher's `vm.rs` (direct-map/kernel-page-table bring-up
//! over `PageTable`/`RiscvPageTableManager`), generalized from a single
//! RISC-V Sv39 table shape to the `Armv7Table`/`Armv8Table` split.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::arch::interface::{Arch, MapAttrs, PageTable};
use crate::arch::memlayout::{BOARD, DIRECT_MAP_BASE, VMALLOC_BASE, VMALLOC_SIZE};
use crate::arch::TargetArch;
use crate::error::{KernelError, KResult};
use crate::page::ZoneHeader;

/// Set once `enable()` has actually flipped the MMU on; selects whether
/// `phys_access` resolves through the identity window (pre-MMU) or the
/// direct map (post-MMU).
static MMU_ENABLED: AtomicBool = AtomicBool::new(false);

/// `direct map virt = phys + DIRECT_MAP_OFFSET`. Constant once computed;
/// stored so `direct_map_offset()`/`kvtop`/`ktov` don't need to recompute it.
static DIRECT_MAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

fn identity_access(p: PAddr) -> *mut u64 {
    p.addr() as *mut u64
}

fn direct_access(p: PAddr) -> *mut u64 {
    (p.addr() + DIRECT_MAP_OFFSET.load(Ordering::Relaxed)) as *mut u64
}

/// The `PhysAccess` closure every table operation is threaded through:
/// identity before `enable()`, direct-map after. This is the one place the
/// "pre-MMU vs. post-MMU" distinction is made; every other function in this
/// module and in `kmem.rs` just calls `phys_access()` without caring which
/// phase it is.
pub fn phys_access(p: PAddr) -> *mut u64 {
    if MMU_ENABLED.load(Ordering::Relaxed) {
        direct_access(p)
    } else {
        identity_access(p)
    }
}

/// The kernel's own page tables and physical-RAM page-table-node allocator,
/// held here rather than in `kmem.rs` since both are MMU-internal plumbing;
/// `kmem.rs` only ever calls the free functions below.
struct KernelTables {
    direct_map: <TargetArch as Arch>::Table,
    /// `None` once `teardown_identity` has freed it.
    identity: Option<<TargetArch as Arch>::Table>,
}

static mut KERNEL_TABLES: Option<KernelTables> = None;

/// Backing allocator for page-table nodes during bring-up and for every
/// later `map_blocks`/per-process table call; sourced from the
/// physical-RAM `ZoneHeader` `kmem.rs` owns (`kmem::phys_alloc_table_node`),
/// passed down rather than imported directly so this module has no
/// dependency cycle with `kmem.rs`.
pub type TableAlloc<'a> = &'a mut dyn FnMut(usize, u32) -> Option<PAddr>;

/// Builds the kernel upper-half direct map covering `[DIRECT_MAP_BASE,
/// DIRECT_MAP_BASE + ram_size)` -> `[ram_base, ram_base + ram_size)`, and a
/// temporary identity map covering only `[kernel_load, kernel_load +
/// kernel_size)`, then enables the MMU. Returns the direct-map offset so the
/// caller can rebase its own pointers.
///
/// # Safety
/// Must run exactly once, with the CPU still executing at its physical load
/// address (no mapping active yet), and `alloc_node` must return pages out
/// of a physical-RAM allocator that covers at least the two table trees'
/// own storage.
pub unsafe fn bring_up(ram_base: usize, ram_size: usize, kernel_load: usize, kernel_size: usize, alloc_node: TableAlloc<'_>) -> KResult<usize> {
    let access = identity_access;

    let mut direct_map = <TargetArch as Arch>::Table::new_empty(alloc_node, &access)?;
    direct_map.map_blocks(
        VAddr::new(DIRECT_MAP_BASE),
        PAddr::new(ram_base),
        ram_size,
        MapAttrs::KERNEL_RWX_NORMAL,
        alloc_node,
        &access,
    )?;

    let mut identity = <TargetArch as Arch>::Table::new_empty(alloc_node, &access)?;
    identity.map_blocks(
        VAddr::new(kernel_load),
        PAddr::new(kernel_load),
        kernel_size,
        MapAttrs::KERNEL_RWX_NORMAL,
        alloc_node,
        &access,
    )?;

    // SAFETY: per `Arch::enable_mmu`'s contract -- runs once, before any
    // access other than through the identity map.
    unsafe { TargetArch::enable_mmu(&direct_map, &identity) };

    let offset = DIRECT_MAP_BASE - ram_base;
    DIRECT_MAP_OFFSET.store(offset, Ordering::Relaxed);
    MMU_ENABLED.store(true, Ordering::Relaxed);

    // SAFETY: single-threaded boot, no concurrent access to `KERNEL_TABLES`.
    unsafe {
        KERNEL_TABLES = Some(KernelTables {
            direct_map,
            identity: Some(identity),
        });
    }

    Ok(offset)
}

/// Walks the identity table and frees every intermediate page it consumed,
/// then zeroes `TTBR0` so a stray access through the low half faults loudly
/// instead of silently succeeding. Corresponds to spec.md §4.2's "Walk the
/// identity table and free every page it consumes; then zero the low
/// translation base."
///
/// # Safety
/// Must run only after `bring_up` and only after every use of the identity
/// map (including the branch into the direct-map-addressed continuation)
/// has completed.
pub unsafe fn teardown_identity(mut free_node: impl FnMut(PAddr)) {
    // SAFETY: `bring_up` ran first (caller contract); single-threaded boot.
    let tables = unsafe { KERNEL_TABLES.as_mut().expect("teardown_identity before bring_up") };
    if let Some(mut identity) = tables.identity.take() {
        identity.free_tables(&mut free_node, &direct_access);
        unsafe { TargetArch::set_user_table(PAddr::new(0), 0) };
    }
}

/// Invariant offset such that `kvtop(p) = p - offset` within the direct map.
pub fn direct_map_offset() -> usize {
    DIRECT_MAP_OFFSET.load(Ordering::Relaxed)
}

/// Direct-map virtual address for a physical address known to lie within
/// managed RAM.
pub fn ktov(p: PAddr) -> VAddr {
    VAddr::new(p.addr() + direct_map_offset())
}

/// Physical address backing a direct-map virtual address.
pub fn kvtop(v: VAddr) -> PAddr {
    PAddr::new(v.addr() - direct_map_offset())
}

/// Allocates `size` bytes of kernel virtual space from the vmalloc region
/// (backed by `alloc_vspace`, the vmalloc `ZoneHeader`'s own `alloc`) and
/// maps it device-memory, kernel-only, non-executable at `phys`. Returns the
/// virtual address, or an error if either the virtual space or an
/// intermediate table allocation is exhausted.
pub fn map_periph(
    phys: PAddr,
    size: usize,
    alloc_vspace: impl FnOnce(usize, u32) -> Option<usize>,
    alloc_node: TableAlloc<'_>,
) -> KResult<VAddr> {
    let size = crate::arch::addr::page_round_up(size);
    let virt = alloc_vspace(size, 0).ok_or(KernelError::OutOfMemory)?;

    // SAFETY: post-MMU only; `KERNEL_TABLES` was built by `bring_up`.
    let tables = unsafe { KERNEL_TABLES.as_mut().expect("map_periph before bring_up") };
    tables.direct_map.map_blocks(
        VAddr::new(virt),
        phys,
        size,
        MapAttrs::KERNEL_DEVICE,
        alloc_node,
        &direct_access,
    )?;
    Ok(VAddr::new(virt))
}

/// One per-process page table plus the virtual-address allocator describing
/// its user address range (spec.md §3's "Page allocator instance... Per-
/// process instances describe each user address space").
pub struct UserSpace {
    pub table: <TargetArch as Arch>::Table,
}

impl UserSpace {
    pub fn new(alloc_node: TableAlloc<'_>) -> KResult<Self> {
        Ok(Self {
            table: <TargetArch as Arch>::Table::new_empty(alloc_node, &direct_access)?,
        })
    }

    pub fn root(&self) -> PAddr {
        self.table.root_paddr()
    }

    /// Inserts a page-granular mapping into this process's tables.
    pub fn umem_map(&mut self, virt: VAddr, phys: PAddr, len: usize, perm: MapAttrs, alloc_node: TableAlloc<'_>) -> KResult<()> {
        debug_assert!(virt.is_page_aligned() && phys.is_page_aligned());
        self.table.map_blocks(virt, phys, len, perm, alloc_node, &direct_access)
    }

    /// Page-table walk: virtual to physical, or `None` if unmapped.
    pub fn umem_lookup(&self, virt: VAddr) -> Option<PAddr> {
        self.table.lookup(virt, &direct_access)
    }

    /// Frees every intermediate table page this process's tables own,
    /// leaving the backing RAM (the leaf-mapped pages themselves) to the
    /// caller.
    pub fn umem_free(&mut self, mut free_node: impl FnMut(PAddr)) {
        self.table.free_tables(&mut free_node, &direct_access);
    }
}

/// Validates that every page of `[virt, virt+len)` is mapped user-readable
/// (and, if `write`, user-writable) in `space`, without faulting. Backs the
/// "a pre-call user pointer is validated by walking the user page table for
/// every page the buffer spans" contract in spec.md §4.5; callers translate
/// a `None`/permission mismatch into `KernelError::PermissionDenied`.
pub fn validate_user_range(space: &UserSpace, virt: VAddr, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    let start = virt.addr() & !(PAGE_SIZE - 1);
    let end = (virt.addr() + len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let mut page = start;
    while page < end {
        if space.umem_lookup(VAddr::new(page)).is_none() {
            return false;
        }
        page += PAGE_SIZE;
    }
    true
}

/// Physical-RAM zone allocator storage: one page, used both as the boot-time
/// physical-RAM `ZoneHeader` (through `identity_access`) and, after
/// `bring_up`, through `direct_access`. Placed here (rather than in
/// `kmem.rs`) since it must exist before `bring_up` runs.
#[repr(C, align(4096))]
pub struct ZonePage(pub [u8; PAGE_SIZE]);

impl ZonePage {
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }

    pub fn as_zone_header(&mut self) -> &mut ZoneHeader {
        // SAFETY: `ZonePage` is exactly one page, `ZoneHeader` fits in one
        // page (see `page.rs`'s `static_assertions::const_assert!`), and
        // this reference is the only live one into the page.
        unsafe { &mut *(self.0.as_mut_ptr() as *mut ZoneHeader) }
    }
}

/// Convenience used by `kmem.rs::init` to derive the board's GIC/virtio
/// MMIO bases for the first `map_periph` calls, kept here since both this
/// module and `kmem.rs` need `BOARD`.
pub fn board() -> &'static crate::arch::memlayout::Board {
    BOARD
}

pub const VMALLOC_REGION: (usize, usize) = (VMALLOC_BASE, VMALLOC_BASE + VMALLOC_SIZE);

//! KMEM: the kernel memory façade wrapping PAGE+MMU (`kalloc_pages`,
//! `kmap_periph`, virt<->phys translation for the direct map, per-process
//! map/unmap). Everything here is a thin, `IrqLock`-protected wrapper: the
//! actual zone bookkeeping is `page.rs`, the actual table manipulation is
//! `mmu.rs`.
//!
//! Boot-order dependency: `init_phys` must run before `bring_up_mmu`, which
//! must run before `init_vmalloc`/anything that calls `kmap_periph` or
//! touches a per-process `UserSpace` -- enforced here by each stage
//! panicking if called out of order (see DESIGN.md's "Global mutable state"
//! note).

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::arch::interface::MapAttrs;
use crate::error::{KernelError, KResult};
use crate::lock::IrqLock;
use crate::mmu::{self, TableAlloc, UserSpace, ZonePage};

static mut PHYS_ZONE: ZonePage = ZonePage::zeroed();
static mut VMALLOC_ZONE: ZonePage = ZonePage::zeroed();

struct Kmem {
    phys: Option<&'static mut crate::page::ZoneHeader>,
    vmalloc: Option<&'static mut crate::page::ZoneHeader>,
}

// SAFETY: all access is serialized through `KMEM`'s `IrqLock`.
unsafe impl Send for Kmem {}

static KMEM: IrqLock<Kmem> = IrqLock::new(
    "kmem",
    Kmem {
        phys: None,
        vmalloc: None,
    },
);

/// Initializes the physical-RAM `ZoneHeader` over `[ram_base, ram_base +
/// ram_size)`, then marks the kernel image and the identity/direct-map
/// table nodes `bring_up_mmu` is about to allocate as already taken. Must be
/// the first step after the UART in the documented boot order.
///
/// # Safety
/// Must run exactly once, before the MMU is enabled.
pub unsafe fn init_phys(ram_base: usize, ram_size: usize, reserved: &[(usize, usize)]) -> KResult<()> {
    // SAFETY: single-threaded boot, no concurrent access yet.
    let header = unsafe { PHYS_ZONE.as_zone_header() };
    crate::page::ZoneHeader::init(header, ram_base, ram_base + ram_size)?;
    for &(start, len) in reserved {
        header.mark_alloc(crate::arch::addr::page_round_down(start), crate::arch::addr::page_round_up(len))?;
    }
    let mut guard = KMEM.lock();
    // SAFETY: `header` outlives `'static` as `PHYS_ZONE` is itself `'static`.
    guard.phys = Some(unsafe { &mut *(header as *mut _) });
    Ok(())
}

fn alloc_table_node(nbytes: usize, align_bits: u32) -> Option<PAddr> {
    let mut guard = KMEM.lock();
    let phys = guard.phys.as_mut()?;
    phys.alloc(crate::arch::addr::page_round_up(nbytes), align_bits).map(PAddr::new)
}

fn free_table_node(p: PAddr) {
    let mut guard = KMEM.lock();
    if let Some(phys) = guard.phys.as_mut() {
        let _ = phys.free(p.addr(), PAGE_SIZE);
    }
}

/// Builds the direct map + temporary identity map, enables the MMU, then
/// initializes the vmalloc `ZoneHeader` over `arch::memlayout`'s reserved
/// kernel-virtual-address region.
///
/// # Safety
/// Must run exactly once, after `init_phys`, with the CPU at its physical
/// load address.
pub unsafe fn bring_up_mmu(ram_base: usize, ram_size: usize, kernel_load: usize, kernel_size: usize) -> KResult<()> {
    let mut table_alloc: TableAlloc<'_> = &mut alloc_table_node;
    // SAFETY: per `mmu::bring_up`'s contract, checked by the caller.
    unsafe { mmu::bring_up(ram_base, ram_size, kernel_load, kernel_size, &mut table_alloc)? };

    let (vbase, vend) = mmu::VMALLOC_REGION;
    let header = unsafe { VMALLOC_ZONE.as_zone_header() };
    crate::page::ZoneHeader::init(header, vbase, vend)?;
    let mut guard = KMEM.lock();
    guard.vmalloc = Some(unsafe { &mut *(header as *mut _) });
    Ok(())
}

/// Frees the identity table and zeroes the low translation base; the last
/// step of the MMU bring-up sequence.
///
/// # Safety
/// See `mmu::teardown_identity`.
pub unsafe fn finish_mmu_bringup() {
    unsafe { mmu::teardown_identity(free_table_node) };
}

/// Allocates `nbytes` (rounded up to a page) of physical RAM, aligned to
/// `1 << align_bits` (clamped to at least page alignment).
pub fn kalloc_pages(nbytes: usize, align_bits: u32) -> KResult<PAddr> {
    let mut guard = KMEM.lock();
    let phys = guard.phys.as_mut().ok_or(KernelError::NoSuchDevice)?;
    phys.alloc(crate::arch::addr::page_round_up(nbytes), align_bits)
        .map(PAddr::new)
        .ok_or(KernelError::OutOfMemory)
}

pub fn kfree_pages(p: PAddr, nbytes: usize) -> KResult<()> {
    let mut guard = KMEM.lock();
    let phys = guard.phys.as_mut().ok_or(KernelError::NoSuchDevice)?;
    phys.free(p.addr(), crate::arch::addr::page_round_up(nbytes))
}

/// Allocates `size` bytes of kernel virtual space and maps it
/// device-memory/kernel-only/non-executable at `phys`.
pub fn kmap_periph(phys: PAddr, size: usize) -> KResult<VAddr> {
    let mut table_alloc: TableAlloc<'_> = &mut alloc_table_node;
    let vsize = crate::arch::addr::page_round_up(size);
    mmu::map_periph(
        phys,
        size,
        |want, align_bits| {
            let mut guard = KMEM.lock();
            guard.vmalloc.as_mut().and_then(|v| v.alloc(want, align_bits))
        },
        &mut table_alloc,
    )
    .map(|v| {
        debug_assert!(v.addr() % PAGE_SIZE == 0 || vsize == 0);
        v
    })
}

pub fn direct_map_offset() -> usize {
    mmu::direct_map_offset()
}

pub fn ktov(p: PAddr) -> VAddr {
    mmu::ktov(p)
}

pub fn kvtop(v: VAddr) -> PAddr {
    mmu::kvtop(v)
}

/// Builds a fresh per-process address space.
pub fn new_user_space() -> KResult<UserSpace> {
    let mut table_alloc: TableAlloc<'_> = &mut alloc_table_node;
    UserSpace::new(&mut table_alloc)
}

pub fn umem_map(space: &mut UserSpace, virt: VAddr, phys: PAddr, len: usize, perm: MapAttrs) -> KResult<()> {
    let mut table_alloc: TableAlloc<'_> = &mut alloc_table_node;
    space.umem_map(virt, phys, len, perm, &mut table_alloc)
}

pub fn umem_lookup(space: &UserSpace, virt: VAddr) -> Option<PAddr> {
    space.umem_lookup(virt)
}

pub fn umem_free(space: &mut UserSpace) {
    space.umem_free(free_table_node);
}

pub fn validate_user_range(space: &UserSpace, virt: VAddr, len: usize) -> bool {
    mmu::validate_user_range(space, virt, len)
}

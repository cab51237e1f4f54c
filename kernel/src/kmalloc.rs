//! KMALLOC: the power-of-two general allocator (spec.md §4.3) built on nine
//! `SlabCache`s, sizes 8..=2048 bytes. `kmalloc(n)` routes to the smallest
//! class `>= n`; `kfree(p, n)` routes to the same class by recomputing it
//! from `n`, matching the original's "caller supplies the size back"
//! contract (there is no per-allocation size header).

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use crate::arch::addr::PAGE_SIZE;
use crate::error::{KernelError, KResult};
use crate::lock::IrqLock;
use crate::param::{KMALLOC_CLASSES, KMALLOC_MAX};
use crate::slab::SlabCache;

const NCLASSES: usize = KMALLOC_CLASSES.len();

struct Kmalloc {
    classes: [SlabCache; NCLASSES],
}

static KMALLOC: IrqLock<Kmalloc> = IrqLock::new(
    "kmalloc",
    Kmalloc {
        classes: [
            SlabCache::new(KMALLOC_CLASSES[0], KMALLOC_CLASSES[0]),
            SlabCache::new(KMALLOC_CLASSES[1], KMALLOC_CLASSES[1]),
            SlabCache::new(KMALLOC_CLASSES[2], KMALLOC_CLASSES[2]),
            SlabCache::new(KMALLOC_CLASSES[3], KMALLOC_CLASSES[3]),
            SlabCache::new(KMALLOC_CLASSES[4], KMALLOC_CLASSES[4]),
            SlabCache::new(KMALLOC_CLASSES[5], KMALLOC_CLASSES[5]),
            SlabCache::new(KMALLOC_CLASSES[6], KMALLOC_CLASSES[6]),
            SlabCache::new(KMALLOC_CLASSES[7], KMALLOC_CLASSES[7]),
            SlabCache::new(KMALLOC_CLASSES[8], KMALLOC_CLASSES[8]),
        ],
    },
);

/// Index of the smallest class `>= n`, or `None` if `n > KMALLOC_MAX`.
fn class_for(n: usize) -> Option<usize> {
    KMALLOC_CLASSES.iter().position(|&c| c >= n)
}

fn grow_page() -> Option<NonNull<u8>> {
    crate::kmem::kalloc_pages(PAGE_SIZE, 0)
        .ok()
        .and_then(|p| NonNull::new(crate::kmem::ktov(p).addr() as *mut u8))
}

fn shrink_page(p: NonNull<u8>) {
    let virt = crate::arch::addr::VAddr::new(p.as_ptr() as usize);
    let phys = crate::kmem::kvtop(virt);
    let _ = crate::kmem::kfree_pages(phys, PAGE_SIZE);
}

/// Allocates at least `n` bytes. Requests larger than `KMALLOC_MAX` are
/// rejected with a diagnostic, per spec.md §4.3.
pub fn kmalloc(n: usize) -> KResult<NonNull<u8>> {
    let idx = class_for(n).ok_or_else(|| {
        crate::kerror!("kmalloc: request for {} bytes exceeds KMALLOC_MAX ({})", n, KMALLOC_MAX);
        KernelError::InvalidArgument
    })?;
    let mut guard = KMALLOC.lock();
    let grow: crate::slab::PageAlloc<'_> = &grow_page;
    guard.classes[idx].alloc(grow)
}

/// Frees a pointer previously returned by `kmalloc(n)` (same `n`, not the
/// class size it happened to round up to).
pub fn kfree(p: NonNull<u8>, n: usize) -> KResult<()> {
    let idx = class_for(n).ok_or(KernelError::InvalidArgument)?;
    let mut guard = KMALLOC.lock();
    guard.classes[idx].free(p);
    Ok(())
}

/// Returns every fully-empty page across all nine classes to the page
/// allocator. Not on any hot path; invoked opportunistically (e.g. from a
/// diagnostic syscall) since `SLAB::free` leaving empty pages behind is
/// explicitly not required for correctness.
pub fn reclaim() {
    let mut guard = KMALLOC.lock();
    let shrink: crate::slab::PageFree<'_> = &shrink_page;
    for class in guard.classes.iter_mut() {
        class.shrink(shrink);
    }
}

/// `#[global_allocator]` adapter so `alloc`-crate collections (`Vec`,
/// `Box`, `BTreeMap`) used by non-`#[cfg(test)]` kernel code route through
/// `kmalloc`/`kfree` instead of needing a second, separate heap. Oversize
/// or misaligned (> 8 bytes, the largest natural alignment `kmalloc`
/// guarantees) requests are refused -- none of this kernel's own `alloc`
/// usage needs more than that.
pub struct KmallocGlobalAlloc;

unsafe impl GlobalAlloc for KmallocGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > 8 {
            return core::ptr::null_mut();
        }
        match kmalloc(layout.size()) {
            Ok(p) => p.as_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            let _ = kfree(p, layout.size());
        }
    }
}

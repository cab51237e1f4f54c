//! A single-page virtqueue: descriptor ring, avail ring, used ring, and a
//! parallel table of kernel-virtual pointers indexed by descriptor number.
//! A standalone, reusable type any future virtio-mmio driver could build on,
//! rather than a ring layout inlined into the one block driver that needs it.

use core::sync::atomic::{fence, Ordering};

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::error::{KernelError, KResult};
use crate::virtio_mmio::VirtioMmio;

bitflags::bitflags! {
    pub struct DescFlags: u16 {
        /// Chained with another descriptor via `next`.
        const NEXT = 1;
        /// Device writes this descriptor (vs. driver writes, device reads).
        const WRITE = 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Desc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct AvailRing {
    flags: u16,
    idx: u16,
    /// `len` driver-supplied head indices, followed by one `used_event`
    /// u16; both are accessed through raw offsets below since the array
    /// length is a runtime parameter (`VIRTQ_LEN`), not representable as a
    /// fixed-size Rust array field.
    ring0: u16,
}

#[repr(C)]
struct UsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct UsedRing {
    flags: u16,
    idx: u16,
    ring0: UsedElem,
}

/// Byte offsets of each ring within the queue's backing page, and the
/// queue's descriptor count. Computed once in `create` from `len`.
struct Layout {
    desc_off: usize,
    avail_off: usize,
    used_off: usize,
    ptrs_off: usize,
    len: usize,
}

impl Layout {
    fn compute(len: usize) -> KResult<Self> {
        let desc_off = 0;
        let desc_size = len * core::mem::size_of::<Desc>();
        let avail_off = crate::arch::addr::align_up(desc_off + desc_size, 1); // 2-byte align, already satisfied
        let avail_size = 4 + len * 2 + 2;
        let used_off = crate::arch::addr::align_up(avail_off + avail_size, 2); // 4-byte align
        let used_size = 4 + len * 8 + 2;
        let ptrs_off = crate::arch::addr::align_up(used_off + used_size, 3); // 8-byte align
        let ptrs_size = len * core::mem::size_of::<usize>();

        if ptrs_off + ptrs_size > PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            desc_off,
            avail_off,
            used_off,
            ptrs_off,
            len,
        })
    }
}

/// A constructed virtqueue: physical base, length, seen-used cursor,
/// free-descriptor head, the three rings, and the parallel kernel-virtual
/// pointer table.
pub struct Virtqueue {
    virt_base: VAddr,
    phys_base: PAddr,
    layout: Layout,
    free_head: u16,
    last_seen_used: u16,
}

impl Virtqueue {
    fn desc_ptr(&self, i: usize) -> *mut Desc {
        (self.virt_base.addr() + self.layout.desc_off + i * core::mem::size_of::<Desc>()) as *mut Desc
    }

    fn avail(&self) -> *mut AvailRing {
        (self.virt_base.addr() + self.layout.avail_off) as *mut AvailRing
    }

    fn avail_ring_slot(&self, i: usize) -> *mut u16 {
        unsafe { (self.avail() as *mut u8).add(4 + i * 2) as *mut u16 }
    }

    fn used(&self) -> *mut UsedRing {
        (self.virt_base.addr() + self.layout.used_off) as *mut UsedRing
    }

    fn used_ring_slot(&self, i: usize) -> *const UsedElem {
        unsafe { (self.used() as *const u8).add(4 + i * 8) as *const UsedElem }
    }

    fn ptr_slot(&self, i: usize) -> *mut usize {
        (self.virt_base.addr() + self.layout.ptrs_off + i * core::mem::size_of::<usize>()) as *mut usize
    }

    /// Allocates a fresh page (via `alloc_page`) and initializes the rings,
    /// computing offsets from `len`. Builds the descriptors' singly-linked
    /// free list through their own `next` fields, terminator = `len`.
    pub fn create(len: usize, virt_base: VAddr, phys_base: PAddr) -> KResult<Self> {
        let layout = Layout::compute(len)?;

        // SAFETY: `virt_base` is a fresh, exclusively-owned, zeroed page the
        // caller just allocated and mapped.
        unsafe {
            core::ptr::write_bytes(virt_base.addr() as *mut u8, 0, PAGE_SIZE);
        }

        // `free_head: 0` starts the free list at descriptor 0; the loop
        // below threads every descriptor's `next` through to the one after
        // it, terminating at `len` (an out-of-range index means "no more
        // free descriptors").
        let q = Self {
            virt_base,
            phys_base,
            layout,
            free_head: 0,
            last_seen_used: 0,
        };

        for i in 0..len {
            // SAFETY: within the queue's own page, just zeroed.
            unsafe {
                (*q.desc_ptr(i)).next = (i + 1) as u16;
            }
        }
        Ok(q)
    }

    pub fn len(&self) -> usize {
        self.layout.len
    }

    pub fn phys_base(&self) -> PAddr {
        self.phys_base
    }

    fn desc_phys(&self, i: usize) -> u64 {
        (self.phys_base.addr() + self.layout.desc_off) as u64
    }

    fn avail_phys(&self) -> u64 {
        (self.phys_base.addr() + self.layout.avail_off) as u64
    }

    fn used_phys(&self) -> u64 {
        (self.phys_base.addr() + self.layout.used_off) as u64
    }

    /// Programs the device's registers with this queue's ring addresses and
    /// marks it ready.
    pub fn attach(&self, mmio: &VirtioMmio, queue_sel: u32) {
        mmio.attach_queue(queue_sel, self.len() as u32, self.desc_phys(0), self.avail_phys(), self.used_phys());
    }

    /// Pops the free-list head, records `addr`'s physical translation in
    /// `desc.addr` and its kernel-virtual address in the parallel table.
    /// Returns the descriptor index, or an error if the free list is
    /// exhausted.
    pub fn alloc_desc(&mut self, addr: VAddr, phys: PAddr, len: u32, flags: DescFlags) -> KResult<u16> {
        if self.free_head as usize >= self.layout.len {
            return Err(KernelError::OutOfMemory);
        }
        let i = self.free_head;
        // SAFETY: `i` is within `[0, layout.len)`, checked above.
        let desc = unsafe { &mut *self.desc_ptr(i as usize) };
        self.free_head = desc.next;
        desc.addr = phys.addr() as u64;
        desc.len = len;
        desc.flags = flags.bits();
        desc.next = self.layout.len as u16; // overwritten by `chain` if not the chain's tail
        // SAFETY: `i` is within range.
        unsafe {
            *self.ptr_slot(i as usize) = addr.addr();
        }
        Ok(i)
    }

    /// Links descriptor `head`'s `next` to `tail` and sets the `NEXT` flag,
    /// for building multi-descriptor chains (e.g. virtio-blk's 3-descriptor
    /// request).
    pub fn chain(&mut self, head: u16, tail: u16) {
        // SAFETY: both indices were returned by a prior `alloc_desc` on this
        // queue and are therefore within range.
        let desc = unsafe { &mut *self.desc_ptr(head as usize) };
        desc.next = tail;
        desc.flags |= DescFlags::NEXT.bits();
    }

    /// Pushes `head`'s free-list entries back (in reverse chain order, so
    /// the list stays internally consistent) and clears the parallel
    /// pointer-table entry for each.
    pub fn free_desc(&mut self, head: u16) {
        let mut i = head;
        let mut chain = [0u16; 8];
        let mut n = 0;
        loop {
            chain[n] = i;
            n += 1;
            // SAFETY: `i` was allocated from this queue.
            let desc = unsafe { &*self.desc_ptr(i as usize) };
            let has_next = desc.flags & DescFlags::NEXT.bits() != 0;
            let next = desc.next;
            if !has_next || n == chain.len() {
                break;
            }
            i = next;
        }
        for &idx in chain[..n].iter().rev() {
            // SAFETY: `idx` is within range.
            unsafe {
                (*self.desc_ptr(idx as usize)).next = self.free_head;
                *self.ptr_slot(idx as usize) = 0;
            }
            self.free_head = idx;
        }
    }

    /// Kernel-virtual address stashed for descriptor `i` by `alloc_desc`,
    /// or `0` if it has since been freed.
    pub fn ptr_for(&self, i: u16) -> usize {
        // SAFETY: `i` is within range (caller contract, checked by callers
        // against `len()`).
        unsafe { *self.ptr_slot(i as usize) }
    }

    /// Publishes `head` on the avail ring and makes sure the store is
    /// visible to the device before the driver's next action (notify).
    pub fn publish(&mut self, head: u16) {
        // SAFETY: the avail ring is this queue's own page.
        unsafe {
            let avail = &mut *self.avail();
            let slot = avail.idx as usize % self.layout.len;
            *self.avail_ring_slot(slot) = head;
            fence(Ordering::SeqCst);
            avail.idx = avail.idx.wrapping_add(1);
        }
    }

    pub fn notify(&self, mmio: &VirtioMmio, queue_sel: u32) {
        fence(Ordering::SeqCst);
        mmio.notify(queue_sel);
    }

    /// Drains every used-ring entry the device has posted since the last
    /// call, invoking `f(desc_index, written_len)` for each, then advances
    /// the seen-used cursor.
    pub fn drain_used(&mut self, mut f: impl FnMut(u16, u32)) {
        fence(Ordering::SeqCst);
        // SAFETY: the used ring is this queue's own page.
        let device_idx = unsafe { (*self.used()).idx };
        while self.last_seen_used != device_idx {
            let slot = self.last_seen_used as usize % self.layout.len;
            // SAFETY: `slot` is within `[0, len)`.
            let elem = unsafe { &*self.used_ring_slot(slot) };
            f(elem.id as u16, elem.len);
            self.last_seen_used = self.last_seen_used.wrapping_add(1);
        }
    }

    /// Number of descriptors currently on the free list (walks the chain;
    /// diagnostic/test use only).
    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let mut n = 0;
        let mut i = self.free_head;
        while (i as usize) < self.layout.len {
            n += 1;
            // SAFETY: test-only, single-threaded.
            i = unsafe { (*self.desc_ptr(i as usize)).next };
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout as AllocLayout};

    fn new_queue(len: usize) -> (Virtqueue, *mut u8, AllocLayout) {
        let layout = AllocLayout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let mem = unsafe { alloc_zeroed(layout) };
        let addr = mem as usize;
        let q = Virtqueue::create(len, VAddr::new(addr), PAddr::new(addr)).unwrap();
        (q, mem, layout)
    }

    #[test]
    fn fresh_queue_has_full_free_list() {
        let (q, mem, layout) = new_queue(8);
        assert_eq!(q.free_list_len(), 8);
        unsafe { std::alloc::dealloc(mem, layout) };
    }

    #[test]
    fn alloc_then_free_restores_free_list() {
        let (mut q, mem, layout) = new_queue(8);
        let i = q.alloc_desc(VAddr::new(0x1000), PAddr::new(0x1000), 16, DescFlags::empty()).unwrap();
        assert_eq!(q.free_list_len(), 7);
        q.free_desc(i);
        assert_eq!(q.free_list_len(), 8);
        assert_eq!(q.ptr_for(i), 0);
        unsafe { std::alloc::dealloc(mem, layout) };
    }

    #[test]
    fn chain_sets_next_and_flag() {
        let (mut q, mem, layout) = new_queue(8);
        let a = q.alloc_desc(VAddr::new(0x1000), PAddr::new(0x1000), 16, DescFlags::empty()).unwrap();
        let b = q.alloc_desc(VAddr::new(0x2000), PAddr::new(0x2000), 512, DescFlags::WRITE).unwrap();
        q.chain(a, b);
        // SAFETY: test-only direct inspection.
        let desc = unsafe { &*q.desc_ptr(a as usize) };
        assert_eq!(desc.next, b);
        assert_ne!(desc.flags & DescFlags::NEXT.bits(), 0);
        unsafe { std::alloc::dealloc(mem, layout) };
    }
}

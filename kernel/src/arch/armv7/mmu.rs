//! ARMv7-A 2-level short-descriptor translation tables, 4 KiB granule.
//!
//! L1 is a 4096-entry, 16 KiB, 16 KiB-aligned root table; each entry is
//! either a 1 MiB section leaf or a pointer to a 256-entry, 1 KiB coarse L2
//! table of 4 KiB small-page leaves. `map_blocks` always
//! picks a section when `virt`/`phys`/`len` allow it, falling back to small
//! pages otherwise -- the ARMv7-A analogue of `Armv8Table::map_recursive`.

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::arch::interface::{AllocTable, MapAttrs, PageTable, PhysAccess};
use crate::error::KernelError;
use crate::error::KResult;

const L1_ENTRIES: usize = 4096;
const L1_SIZE: usize = L1_ENTRIES * 4;
const L2_ENTRIES: usize = 256;
const L2_SIZE: usize = L2_ENTRIES * 4;
const SECTION_SIZE: usize = 1 << 20;

const L1_TYPE_FAULT: u32 = 0b00;
const L1_TYPE_COARSE: u32 = 0b01;
const L1_TYPE_SECTION: u32 = 0b10;
const L1_TYPE_MASK: u32 = 0b11;

fn l1_index(virt: VAddr) -> usize {
    virt.addr() >> 20
}

fn l2_index(virt: VAddr) -> usize {
    (virt.addr() >> 12) & 0xff
}

fn ap_bits(attrs: MapAttrs) -> (u32, u32) {
    // Returns (apx, ap).
    match (attrs.user, attrs.writable) {
        (false, true) => (0, 0b01),
        (false, false) => (1, 0b01),
        (true, true) => (0, 0b11),
        (true, false) => (1, 0b11),
    }
}

fn section_bits(attrs: MapAttrs) -> u32 {
    let (apx, ap) = ap_bits(attrs);
    let (tex, c, b) = if attrs.device { (0u32, 0u32, 0u32) } else { (0u32, 1u32, 1u32) };
    let xn = if attrs.executable { 0 } else { 1 };
    L1_TYPE_SECTION
        | (xn << 4)
        | (0 << 5) // domain 0
        | (tex << 12)
        | (ap << 10)
        | (apx << 15)
        | (c << 3)
        | (b << 2)
}

fn small_page_bits(attrs: MapAttrs) -> u32 {
    let (apx, ap) = ap_bits(attrs);
    let (tex, c, b) = if attrs.device { (0u32, 0u32, 0u32) } else { (0u32, 1u32, 1u32) };
    let xn = if attrs.executable { 0 } else { 1 };
    0b1 // small page fixed bit1
        | xn
        | (ap << 4)
        | (apx << 9)
        | (tex << 6)
        | (c << 3)
        | (b << 2)
}

pub struct Armv7Table {
    root: PAddr,
}

impl Armv7Table {
    fn l1_entries(root: PAddr, access: PhysAccess<'_>) -> &'static mut [u32; L1_ENTRIES] {
        // SAFETY: `access` resolves the L1 root's physical address to a
        // currently-mapped, exclusively-owned 16 KiB region.
        unsafe { &mut *(access(root) as *mut [u32; L1_ENTRIES]) }
    }

    fn l2_entries(table: PAddr, access: PhysAccess<'_>) -> &'static mut [u32; L2_ENTRIES] {
        // SAFETY: same contract as `l1_entries`, for a 1 KiB coarse table.
        unsafe { &mut *(access(table) as *mut [u32; L2_ENTRIES]) }
    }

    fn map_one_section(
        &mut self,
        virt: VAddr,
        phys: PAddr,
        attrs: MapAttrs,
        access: PhysAccess<'_>,
    ) -> KResult<()> {
        let entries = Self::l1_entries(self.root, access);
        let idx = l1_index(virt);
        if entries[idx] & L1_TYPE_MASK != L1_TYPE_FAULT {
            return Err(KernelError::InvalidArgument);
        }
        entries[idx] = (phys.addr() as u32 & !0xfffff) | section_bits(attrs);
        Ok(())
    }

    fn map_one_page(
        &mut self,
        virt: VAddr,
        phys: PAddr,
        attrs: MapAttrs,
        alloc_table: AllocTable<'_>,
        access: PhysAccess<'_>,
    ) -> KResult<()> {
        let l1 = Self::l1_entries(self.root, access);
        let l1_idx = l1_index(virt);

        let l2_table = match l1[l1_idx] & L1_TYPE_MASK {
            L1_TYPE_FAULT => {
                let page = alloc_table(L2_SIZE, 10).ok_or(KernelError::OutOfMemory)?;
                for e in Self::l2_entries(page, access).iter_mut() {
                    *e = 0;
                }
                l1[l1_idx] = (page.addr() as u32 & !0x3ff) | L1_TYPE_COARSE;
                page
            }
            L1_TYPE_COARSE => PAddr::new((l1[l1_idx] & !0x3ff) as usize),
            _ => return Err(KernelError::InvalidArgument),
        };

        let l2 = Self::l2_entries(l2_table, access);
        let l2_idx = l2_index(virt);
        if l2[l2_idx] & 0b11 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        l2[l2_idx] = (phys.addr() as u32 & !0xfff) | small_page_bits(attrs);
        Ok(())
    }
}

impl PageTable for Armv7Table {
    fn new_empty(alloc_table: AllocTable<'_>, access: PhysAccess<'_>) -> KResult<Self> {
        let root = alloc_table(L1_SIZE, 14).ok_or(KernelError::OutOfMemory)?;
        for e in Self::l1_entries(root, access).iter_mut() {
            *e = 0;
        }
        Ok(Self { root })
    }

    fn root_paddr(&self) -> PAddr {
        self.root
    }

    fn map_blocks(
        &mut self,
        virt: VAddr,
        phys: PAddr,
        len: usize,
        attrs: MapAttrs,
        alloc_table: AllocTable<'_>,
        access: PhysAccess<'_>,
    ) -> KResult<()> {
        let mut virt = virt;
        let mut phys = phys;
        let mut remaining = len;

        while remaining > 0 {
            if virt.addr() % SECTION_SIZE == 0 && phys.addr() % SECTION_SIZE == 0 && remaining >= SECTION_SIZE {
                self.map_one_section(virt, phys, attrs, access)?;
                virt = virt + SECTION_SIZE;
                phys = phys + SECTION_SIZE;
                remaining -= SECTION_SIZE;
            } else {
                self.map_one_page(virt, phys, attrs, alloc_table, access)?;
                virt = virt + PAGE_SIZE;
                phys = phys + PAGE_SIZE;
                remaining -= PAGE_SIZE;
            }
        }
        Ok(())
    }

    fn lookup(&self, virt: VAddr, access: PhysAccess<'_>) -> Option<PAddr> {
        let l1 = Self::l1_entries(self.root, access);
        let entry = l1[l1_index(virt)];
        match entry & L1_TYPE_MASK {
            L1_TYPE_SECTION => {
                let base = (entry & !0xfffff) as usize;
                Some(PAddr::new(base | (virt.addr() & 0xfffff)))
            }
            L1_TYPE_COARSE => {
                let l2_table = PAddr::new((entry & !0x3ff) as usize);
                let l2 = Self::l2_entries(l2_table, access);
                let leaf = l2[l2_index(virt)];
                if leaf & 0b11 == 0 {
                    return None;
                }
                let base = (leaf & !0xfff) as usize;
                Some(PAddr::new(base | (virt.addr() & 0xfff)))
            }
            _ => None,
        }
    }

    fn free_tables(&mut self, free_page: &mut dyn FnMut(PAddr), access: PhysAccess<'_>) {
        let l1 = Self::l1_entries(self.root, access);
        for &entry in l1.iter() {
            if entry & L1_TYPE_MASK == L1_TYPE_COARSE {
                free_page(PAddr::new((entry & !0x3ff) as usize));
            }
        }
    }
}

//! AArch64 4-level (L0..L3) translation tables, 4 KiB granule.
//!
//! Block descriptors are placed at L1 (1 GiB) and L2 (2 MiB); L3 always
//! holds 4 KiB page descriptors. `map_blocks` descends from L0, allocating
//! intermediate tables lazily and always picking the largest block the
//! remaining `virt`/`phys`/`len` alignment allows.

use crate::arch::addr::{PAddr, VAddr, PAGE_SIZE};
use crate::arch::interface::{AllocTable, MapAttrs, PageTable, PhysAccess};
use crate::error::KernelError;
use crate::error::KResult;

const ENTRIES: usize = 512;
const ONE_GIB: usize = 1 << 30;
const TWO_MIB: usize = 1 << 21;

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 1 << 1; // set => table (at L1/L2) or page (at L3); clear at L1/L2 => block
const AF: u64 = 1 << 10; // access flag, always set: no demand paging
const SH_INNER: u64 = 0b11 << 8;
const NG: u64 = 1 << 11;
const UXN: u64 = 1 << 54;
const PXN: u64 = 1 << 53;

fn level_index(virt: VAddr, level: usize) -> usize {
    let shift = 12 + 9 * (3 - level);
    (virt.addr() >> shift) & 0x1ff
}

fn leaf_attr_bits(attrs: MapAttrs) -> u64 {
    let attrindx: u64 = if attrs.device { 0 } else { 1 };
    let ap: u64 = match (attrs.user, attrs.writable) {
        (false, true) => 0b00,
        (false, false) => 0b10,
        (true, true) => 0b01,
        (true, false) => 0b11,
    };
    let mut bits = DESC_VALID | AF | NG | SH_INNER | (attrindx << 2) | (ap << 6);
    if !attrs.executable {
        bits |= UXN | PXN;
    } else if !attrs.user {
        // Kernel-executable mappings must still be non-executable from EL0.
        bits |= UXN;
    }
    bits
}

pub struct Armv8Table {
    root: PAddr,
}

impl Armv8Table {
    fn table_ptr(paddr: PAddr, access: PhysAccess<'_>) -> *mut u64 {
        access(paddr)
    }

    fn entries(paddr: PAddr, access: PhysAccess<'_>) -> &'static mut [u64; ENTRIES] {
        // SAFETY: `access` resolves a page-table page's physical address to
        // a currently-mapped, exclusively-owned [u64; 512] region.
        unsafe { &mut *(Self::table_ptr(paddr, access) as *mut [u64; ENTRIES]) }
    }

    fn map_recursive(
        table: PAddr,
        level: usize,
        virt: VAddr,
        phys: PAddr,
        len: usize,
        attrs: MapAttrs,
        alloc_table: AllocTable<'_>,
        access: PhysAccess<'_>,
    ) -> KResult<()> {
        let idx = level_index(virt, level);
        let entries = Self::entries(table, access);

        let block_size = match level {
            1 => Some(ONE_GIB),
            2 => Some(TWO_MIB),
            _ => None,
        };

        if let Some(bs) = block_size {
            if virt.addr() % bs == 0 && phys.addr() % bs == 0 && len >= bs {
                if entries[idx] & DESC_VALID != 0 {
                    return Err(KernelError::InvalidArgument);
                }
                entries[idx] = phys.addr() as u64 | leaf_attr_bits(attrs);
                let remaining = len - bs;
                if remaining > 0 {
                    return Self::map_recursive(
                        table,
                        level,
                        virt + bs,
                        phys + bs,
                        remaining,
                        attrs,
                        alloc_table,
                        access,
                    );
                }
                return Ok(());
            }
        }

        if level == 3 {
            if entries[idx] & DESC_VALID != 0 {
                return Err(KernelError::InvalidArgument);
            }
            entries[idx] = phys.addr() as u64 | DESC_TABLE | leaf_attr_bits(attrs);
            let remaining = len - PAGE_SIZE;
            if remaining > 0 {
                return Self::map_recursive(
                    table,
                    level,
                    virt + PAGE_SIZE,
                    phys + PAGE_SIZE,
                    remaining,
                    attrs,
                    alloc_table,
                    access,
                );
            }
            return Ok(());
        }

        // Descend: allocate the next-level table if this slot is empty.
        let next_table = if entries[idx] & DESC_VALID != 0 {
            PAddr::new((entries[idx] & 0x0000_ffff_ffff_f000) as usize)
        } else {
            let page = alloc_table(PAGE_SIZE, 12).ok_or(KernelError::OutOfMemory)?;
            for e in Self::entries(page, access).iter_mut() {
                *e = 0;
            }
            entries[idx] = page.addr() as u64 | DESC_VALID | DESC_TABLE;
            page
        };

        // Process at most up to the next level's coverage per call so the
        // caller's remaining length is chunked correctly across sub-tables.
        let sub_shift = 12 + 9 * (3 - (level + 1));
        let sub_size = 1usize << (sub_shift + 9);
        let this_chunk = sub_size - (virt.addr() % sub_size);
        let this_chunk = this_chunk.min(len);

        Self::map_recursive(
            next_table,
            level + 1,
            virt,
            phys,
            this_chunk,
            attrs,
            alloc_table,
            access,
        )?;

        let remaining = len - this_chunk;
        if remaining > 0 {
            Self::map_recursive(
                table,
                level,
                virt + this_chunk,
                phys + this_chunk,
                remaining,
                attrs,
                alloc_table,
                access,
            )
        } else {
            Ok(())
        }
    }

    fn lookup_recursive(table: PAddr, level: usize, virt: VAddr, access: PhysAccess<'_>) -> Option<PAddr> {
        let idx = level_index(virt, level);
        let entries = Self::entries(table, access);
        let entry = entries[idx];
        if entry & DESC_VALID == 0 {
            return None;
        }

        let is_block = (level == 1 || level == 2) && entry & DESC_TABLE == 0;
        let is_page = level == 3;
        if is_block || is_page {
            let base = (entry & 0x0000_ffff_ffff_f000) as usize;
            let (shift, mask) = match level {
                1 => (30, ONE_GIB - 1),
                2 => (21, TWO_MIB - 1),
                _ => (12, PAGE_SIZE - 1),
            };
            let _ = shift;
            return Some(PAddr::new(base | (virt.addr() & mask)));
        }

        let next = PAddr::new((entry & 0x0000_ffff_ffff_f000) as usize);
        Self::lookup_recursive(next, level + 1, virt, access)
    }

    fn free_recursive(table: PAddr, level: usize, free_page: &mut dyn FnMut(PAddr), access: PhysAccess<'_>) {
        if level == 3 {
            return;
        }
        let entries = Self::entries(table, access);
        for &entry in entries.iter() {
            if entry & DESC_VALID == 0 {
                continue;
            }
            let is_table = level == 0 || entry & DESC_TABLE != 0;
            if is_table {
                let child = PAddr::new((entry & 0x0000_ffff_ffff_f000) as usize);
                Self::free_recursive(child, level + 1, free_page, access);
                free_page(child);
            }
        }
    }
}

impl PageTable for Armv8Table {
    fn new_empty(alloc_table: AllocTable<'_>, access: PhysAccess<'_>) -> KResult<Self> {
        let root = alloc_table(PAGE_SIZE, 12).ok_or(KernelError::OutOfMemory)?;
        for e in Self::entries(root, access).iter_mut() {
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
        if len == 0 {
            return Ok(());
        }
        Self::map_recursive(self.root, 0, virt, phys, len, attrs, alloc_table, access)
    }

    fn lookup(&self, virt: VAddr, access: PhysAccess<'_>) -> Option<PAddr> {
        Self::lookup_recursive(self.root, 0, virt, access)
    }

    fn free_tables(&mut self, free_page: &mut dyn FnMut(PAddr), access: PhysAccess<'_>) {
        Self::free_recursive(self.root, 0, free_page, access);
    }
}

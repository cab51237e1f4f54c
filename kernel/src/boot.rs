//! Boot sequencing: the one piece of glue between the external entry
//! assembly/linker script (outside this crate -- a `_start` stub that sets
//! up the boot stack and zeroes `.bss` before branching here, same split the
//! teacher's own staticlib crate-type implies) and the documented subsystem
//! bring-up order (spec.md §9's "Global mutable state" note: "UART -> page
//! allocator -> direct map -> MMU -> kmem -> slab -> scheduler -> interrupt
//! controller -> device drivers"). Grounded on `arch::arm::start.rs`'s own
//! cache/TLB flush before `main()`, generalized behind the `Arch` trait
//! instead of inlined asm since this kernel never launches a second core
//! (SMP is a named non-goal).

use crate::arch::addr::{PAddr, PAGE_SIZE};
use crate::arch::interface::Arch;
use crate::arch::memlayout::BOARD;
use crate::arch::TargetArch;
use crate::{blk, console, gic, kmem, proc};

// Linker-provided symbols delimiting the kernel image (spec.md §6): used to
// mark the kernel's own footprint as already-allocated before the physical
// page allocator hands out anything else.
extern "C" {
    static code_start: u8;
    static unused_start: u8;
}

fn linker_addr(sym: &u8) -> usize {
    sym as *const u8 as usize
}

/// Called once, by the external entry stub, with interrupts off, `.bss`
/// zeroed, and a valid boot stack -- the same precondition the teacher's
/// `start()` hands to `main()`. Never returns.
///
/// # Safety
/// Must run exactly once, before any other kernel code, at the CPU's
/// physical load address.
#[no_mangle]
pub unsafe extern "C" fn kernel_main() -> ! {
    // SAFETY: first kernel code to run; no state to race yet.
    unsafe { console::init_pre_mmu() };
    crate::kinfo!("booting (direct map base below, UART already live)");

    let kernel_load = linker_addr(unsafe { &code_start });
    let kernel_end = linker_addr(unsafe { &unused_start });
    let kernel_size = kernel_end - kernel_load;

    // SAFETY: before the MMU is enabled, per this function's own contract.
    unsafe {
        kmem::init_phys(BOARD.ram_base, BOARD.ram_size, &[(kernel_load, kernel_size)])
            .expect("boot: init_phys failed")
    };

    // SAFETY: still at the physical load address; runs exactly once.
    unsafe {
        kmem::bring_up_mmu(BOARD.ram_base, BOARD.ram_size, kernel_load, kernel_size)
            .expect("boot: bring_up_mmu failed")
    };
    // SAFETY: every identity-mapped access this boot path needed is done.
    unsafe { kmem::finish_mmu_bringup() };

    console::rebase_post_mmu(kmem::direct_map_offset());
    crate::kinfo!("mmu live, direct map offset {:#x}", kmem::direct_map_offset());

    proc::init(&[]);

    let gicd_virt = kmem::kmap_periph(PAddr::new(BOARD.gicd_base), PAGE_SIZE).expect("boot: map gicd");
    let gicc_virt = kmem::kmap_periph(PAddr::new(BOARD.gicc_base), PAGE_SIZE).expect("boot: map gicc");
    gic::init_from_board(gicd_virt.addr(), gicc_virt.addr());

    gic::register_isr(BOARD.uart0_irq as u32, 1, uart_isr, "uart0");
    gic::enable(BOARD.uart0_irq as u32);
    console::enable_rx_interrupt();

    if BOARD.virtio0 != 0 {
        probe_virtio_blk();
    } else {
        crate::kwarn!("boot: board has no virtio-mmio transport, no block device registered");
    }

    // SAFETY: the exception vector table is installed exactly once, before
    // interrupts are unmasked below.
    unsafe { TargetArch::install_vectors() };
    TargetArch::intr_on();

    crate::kinfo!("boot: entering scheduler");
    proc::start_scheduler();
}

fn uart_isr(_intid: u32) {
    console::handle_rx_isr(console::feed_input_byte);
}

fn virtio_isr(_intid: u32) {
    blk::handle_virtio_irq();
}

/// Probes the board's one virtio-mmio transport for a block device and
/// registers it under the name `"virtio-blk0"` (SPEC_FULL.md's supplemented
/// blockdev-by-name registry), skipping quietly if nothing virtio-blk shaped
/// answers -- there is no requirement that every board have a disk attached.
fn probe_virtio_blk() {
    let mmio_virt = match kmem::kmap_periph(PAddr::new(BOARD.virtio0), PAGE_SIZE) {
        Ok(v) => v,
        Err(e) => {
            crate::kerror!("boot: failed to map virtio0: {}", e);
            return;
        }
    };

    let queue_phys = match kmem::kalloc_pages(PAGE_SIZE, 0) {
        Ok(p) => p,
        Err(e) => {
            crate::kerror!("boot: failed to allocate virtqueue page: {}", e);
            return;
        }
    };
    let queue_virt = kmem::ktov(queue_phys);

    match blk::VirtioBlk::probe(mmio_virt, queue_virt, queue_phys) {
        Ok(dev) => {
            if let Err(e) = blk::blkdev_register("virtio-blk0", dev) {
                crate::kerror!("boot: failed to register virtio-blk0: {}", e);
                return;
            }
            gic::register_isr(BOARD.virtio0_irq as u32, 1, virtio_isr, "virtio-blk0");
            gic::enable(BOARD.virtio0_irq as u32);
            crate::kinfo!("boot: virtio-blk0 ready");
        }
        Err(e) => {
            let _ = kmem::kfree_pages(queue_phys, PAGE_SIZE);
            crate::kwarn!("boot: no virtio-blk device found ({})", e);
        }
    }
}


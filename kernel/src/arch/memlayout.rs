//! Per-board physical memory layout tables.
//!
//! Board selection is a `cfg` matter (feature `board_rpi4`, default QEMU
//! `virt`), mirroring the teacher's arch/board feature-gated constant
//! modules. Everything here is a physical-address constant; none of it is
//! board bring-up logic (GPIO/mailbox/device-tree), which is out of scope.

/// One physical-memory-layout table per supported board.
pub struct Board {
    /// Start of physical RAM.
    pub ram_base: usize,
    /// Size of physical RAM, in bytes.
    pub ram_size: usize,
    /// Physical load address of the kernel image (where the boot ROM / QEMU
    /// `-kernel` places it).
    pub kernel_load: usize,
    /// MMIO base of the primary UART (PL011).
    pub uart0: usize,
    /// MMIO base of the GIC distributor.
    pub gicd_base: usize,
    /// MMIO base of the GIC CPU interface (GICv2) / redistributor (GICv3).
    pub gicc_base: usize,
    /// MMIO base of the virtio-mmio transport used for the block device.
    pub virtio0: usize,
    pub uart0_irq: usize,
    pub virtio0_irq: usize,
    pub timer_irq: usize,
}

/// QEMU's `virt` machine, the default target for both ARMv7-A and ARMv8-A
/// builds (`qemu-system-arm -M virt` / `qemu-system-aarch64 -M virt`).
pub const QEMU_VIRT: Board = Board {
    ram_base: 0x4000_0000,
    ram_size: 256 * 1024 * 1024,
    kernel_load: 0x4008_0000,
    uart0: 0x0900_0000,
    gicd_base: 0x0800_0000,
    gicc_base: 0x0801_0000,
    virtio0: 0x0a00_0000,
    uart0_irq: 33,
    virtio0_irq: 48,
    timer_irq: 30,
};

/// Raspberry Pi 4B (BCM2711), ARMv8-A only in this kernel.
pub const RASPBERRY_PI4: Board = Board {
    ram_base: 0x0000_0000,
    ram_size: 1024 * 1024 * 1024,
    kernel_load: 0x0008_0000,
    uart0: 0xFE20_1000,
    gicd_base: 0xFF84_1000,
    gicc_base: 0xFF84_2000,
    // The Pi 4 has no virtio-mmio device; this kernel targets it for the
    // CPU/MMU/scheduler core only. A real deployment would substitute a
    // native SD/eMMC block driver as an external collaborator, same as the
    // UART/GIC boundary.
    virtio0: 0,
    uart0_irq: 153,
    virtio0_irq: 0,
    timer_irq: 30,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "board_rpi4")] {
        pub const BOARD: &Board = &RASPBERRY_PI4;
    } else {
        pub const BOARD: &Board = &QEMU_VIRT;
    }
}

/// Base of the kernel direct map, in the upper half of the address space.
/// On ARMv7-A (32-bit) this sits below
/// `CONFIG_KERNEL_START`; on ARMv8-A it is the canonical upper-half base
/// selected by `TTBR1`.
#[cfg(target_pointer_width = "64")]
pub const DIRECT_MAP_BASE: usize = 0xFFFF_0000_0000_0000;
#[cfg(target_pointer_width = "32")]
pub const DIRECT_MAP_BASE: usize = 0xC000_0000;

/// Upper bound (exclusive) of the user address range.
#[cfg(target_pointer_width = "64")]
pub const USER_END: usize = 0x0000_8000_0000_0000;
#[cfg(target_pointer_width = "32")]
pub const USER_END: usize = DIRECT_MAP_BASE;

/// Base of the kernel virtual-address ("vmalloc") region used for on-demand
/// MMIO mappings (`MMU::map_periph`), placed right after the direct map's
/// maximum extent so the two never collide.
#[cfg(target_pointer_width = "64")]
pub const VMALLOC_BASE: usize = 0xFFFF_1000_0000_0000;
#[cfg(target_pointer_width = "32")]
pub const VMALLOC_BASE: usize = 0xF000_0000;

pub const VMALLOC_SIZE: usize = 256 * 1024 * 1024;

//! virtio-mmio transport register layout, version 2, and the device feature
//! bits this kernel's single consumer (virtio-blk) cares about. Targets the
//! v2 queue-descriptor-address layout (`QueueDescLow/High`, etc.) rather
//! than the legacy v1 `QUEUE_PFN` scheme.

use core::ptr;

/// Fixed offsets per the virtio-mmio v2 register layout.
#[repr(usize)]
#[allow(dead_code)]
pub enum Reg {
    MagicValue = 0x000,
    Version = 0x004,
    DeviceId = 0x008,
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DeviceFeaturesSel = 0x014,
    DriverFeatures = 0x020,
    DriverFeaturesSel = 0x024,
    QueueSel = 0x030,
    QueueNumMax = 0x034,
    QueueNum = 0x038,
    QueueReady = 0x044,
    QueueNotify = 0x050,
    InterruptStatus = 0x060,
    InterruptAck = 0x064,
    Status = 0x070,
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    QueueAvailLow = 0x090,
    QueueAvailHigh = 0x094,
    QueueUsedLow = 0x0a0,
    QueueUsedHigh = 0x0a4,
    ConfigGeneration = 0x0fc,
    Config = 0x100,
}

pub const MAGIC_VALUE: u32 = 0x7472_6976;
pub const VERSION: u32 = 2;

bitflags::bitflags! {
    /// Device status register bits: the "acknowledge -> driver -> features
    /// -> features-ok -> driver-ok" negotiation state machine.
    pub struct Status: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags::bitflags! {
    /// virtio-blk feature bits this driver understands; any other bit the
    /// device advertises is logged and left unacknowledged.
    pub struct BlkFeatures: u32 {
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        const FLUSH = 1 << 9;
    }
}

/// A single virtio-mmio transport instance, mapped at a fixed MMIO base
/// (`MMU::map_periph`'s result).
pub struct VirtioMmio {
    base: usize,
}

impl VirtioMmio {
    /// # Safety
    /// `base` must be the virtual address of a live virtio-mmio device
    /// register block.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn addr(&self, r: Reg) -> *mut u32 {
        (self.base + r as usize) as *mut u32
    }

    pub fn read(&self, r: Reg) -> u32 {
        // SAFETY: `r`'s offset is within the mapped device-register block.
        unsafe { ptr::read_volatile(self.addr(r)) }
    }

    pub fn write(&self, r: Reg, v: u32) {
        // SAFETY: see `read`.
        unsafe { ptr::write_volatile(self.addr(r), v) }
    }

    /// Validates the magic value, version, and device id (2 == block
    /// device), returning `false` (logged by the caller) if anything
    /// doesn't match.
    pub fn probe(&self, want_device_id: u32) -> bool {
        self.read(Reg::MagicValue) == MAGIC_VALUE
            && self.read(Reg::Version) == VERSION
            && self.read(Reg::DeviceId) == want_device_id
    }

    /// Runs the acknowledge -> driver -> features -> features-ok -> driver-ok
    /// state machine. For every bit in `caps` the device advertises, the
    /// corresponding driver-feature bit is set; advertised bits not in
    /// `caps` are logged and left clear.
    pub fn negotiate(&self, caps: u32) -> bool {
        self.write(Reg::Status, 0); // reset
        self.write(Reg::Status, Status::ACKNOWLEDGE.bits());
        self.write(Reg::Status, (Status::ACKNOWLEDGE | Status::DRIVER).bits());

        self.write(Reg::DeviceFeaturesSel, 0);
        let device_features = self.read(Reg::DeviceFeatures);
        let unsupported = device_features & !caps;
        if unsupported != 0 {
            crate::kwarn!("virtio: device advertises unsupported features {:#x}", unsupported);
        }
        let accepted = device_features & caps;
        self.write(Reg::DriverFeaturesSel, 0);
        self.write(Reg::DriverFeatures, accepted);

        self.write(
            Reg::Status,
            (Status::ACKNOWLEDGE | Status::DRIVER | Status::FEATURES_OK).bits(),
        );
        if self.read(Reg::Status) & Status::FEATURES_OK.bits() == 0 {
            crate::kerror!("virtio: device rejected feature set {:#x}", accepted);
            self.write(Reg::Status, Status::FAILED.bits());
            return false;
        }

        self.write(
            Reg::Status,
            (Status::ACKNOWLEDGE | Status::DRIVER | Status::FEATURES_OK | Status::DRIVER_OK).bits(),
        );
        true
    }

    /// Programs queue `queue_sel`'s descriptor/avail/used physical addresses
    /// and marks it ready.
    pub fn attach_queue(&self, queue_sel: u32, len: u32, desc: u64, avail: u64, used: u64) {
        self.write(Reg::QueueSel, queue_sel);
        let max = self.read(Reg::QueueNumMax);
        debug_assert!(max == 0 || len <= max, "queue length exceeds device maximum");
        self.write(Reg::QueueNum, len);
        self.write(Reg::QueueDescLow, desc as u32);
        self.write(Reg::QueueDescHigh, (desc >> 32) as u32);
        self.write(Reg::QueueAvailLow, avail as u32);
        self.write(Reg::QueueAvailHigh, (avail >> 32) as u32);
        self.write(Reg::QueueUsedLow, used as u32);
        self.write(Reg::QueueUsedHigh, (used >> 32) as u32);
        self.write(Reg::QueueReady, 1);
    }

    pub fn notify(&self, queue_sel: u32) {
        self.write(Reg::QueueNotify, queue_sel);
    }

    /// Reads and acknowledges the interrupt-status bits that fired; returns
    /// the bits so the caller can tell a used-buffer notification from a
    /// config-change one.
    pub fn ack_interrupt(&self) -> u32 {
        let bits = self.read(Reg::InterruptStatus);
        self.write(Reg::InterruptAck, bits);
        bits
    }
}

// SAFETY: register accesses are volatile MMIO; callers serialize concurrent
// use with `IrqLock`/`push_off`-`pop_off` (single CPU, interrupts disabled
// during submit).
unsafe impl Sync for VirtioMmio {}

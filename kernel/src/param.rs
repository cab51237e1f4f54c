//! Kernel tunables.
//!
//! Everything here is a compile-time constant rather than a runtime config
//! file: this is a kernel image, not a hosted program. Board-specific
//! physical addresses live in `arch::memlayout` instead, since they vary
//! per target (`arch::memlayout::QemuVirt` / `arch::memlayout::RaspberryPi4`).

/// Maximum number of live process descriptors (user processes + kthreads).
pub const NPROC: usize = 64;

/// Kernel stack size for each process, in pages.
pub const KSTACK_PAGES: usize = 1;

/// Maximum length of a process name, used for diagnostics only.
pub const MAXPROCNAME: usize = 16;

/// Fixed user-space load address for process images.
pub const USER_LOAD_ADDR: usize = 0x0000_0000_0010_0000;

/// The slab/kmalloc size classes, in bytes. Nine classes, 8..=2048.
pub const KMALLOC_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest request `kmalloc` will service; anything bigger is rejected.
pub const KMALLOC_MAX: usize = 2048;

/// Total virtqueue length (number of descriptors), chosen so that the
/// control block, three rings, and the parallel pointer table all fit in a
/// single page.
pub const VIRTQ_LEN: usize = 64;

/// Sector size used by the block layer / virtio-blk data descriptor.
pub const BLK_SECTOR_SIZE: usize = 512;

/// Capacity of the zone array that fits in one page of a page-zone
/// allocator instance.
pub const ZONE_CAPACITY: usize = crate::arch::addr::PAGE_SIZE / core::mem::size_of::<crate::page::Zone>();

/// Static table of bundled process images consulted by the `runproc`
/// syscall; grounded on the original's `process_image_lookup`/`binaries[]`
/// (see DESIGN.md).
pub type BinaryTable = &'static [(&'static str, &'static [u8])];

/// Number of distinct GIC interrupt lines this kernel tracks (SGIs + PPIs +
/// a generous span of SPIs covering UART/virtio/timer on both boards).
pub const NIRQ: usize = 128;

/// Maximum number of live sockets (spec.md §4.5's `socket`/`bind`/`connect`/
/// `send` syscalls; see `socket.rs`).
pub const NSOCKET: usize = 16;

/// Maximum sockets a single process may hold open at once (spec.md §3's
/// per-process "open-socket list").
pub const NPROC_SOCKETS: usize = 8;

/// Upper bound on a `display` syscall's scanned string length: the
/// pre-read validation window spec.md §4.5 requires ("a pre-call user
/// pointer is validated by walking the user page table for every page the
/// buffer spans") is capped to this many bytes so a caller can't make the
/// kernel scan for a NUL terminator forever.
pub const MAX_DISPLAY_LEN: usize = 1024;

/// Capacity of the input byte queue the UART RX ISR feeds and the blocking
/// `getchar` syscall drains.
pub const CONSOLE_INPUT_CAP: usize = 256;

/// Base of the per-process virtual-memory allocator's managed range (spec.md
/// §4.5 step 3: "allocate a per-process virtual-memory allocator spanning
/// the user address range"). Starts at the fixed load address; nothing
/// below it is ever handed out.
pub const USER_VM_BASE: usize = USER_LOAD_ADDR;

/// Maximum number of registered block devices (spec.md §9's supplemented
/// blockdev-by-name registry).
pub const NBLKDEV: usize = 4;


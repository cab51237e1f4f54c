//! The `Printer` singleton: wraps the UART byte-out primitive so that kernel
//! text (diagnostics, fault decode, capability-negotiation warnings) has one
//! serializing choke point. Collapsed to the pieces this kernel actually
//! needs: there is no line-editing input buffer (no in-kernel shell in the
//! core), just `putc`/`puts` plus the blocking `getchar` the `getchar`
//! syscall rides on.

use core::fmt;

use arrayvec::ArrayVec;

use crate::arch::memlayout::BOARD;
use crate::lock::IrqLock;
use crate::param::CONSOLE_INPUT_CAP;
use crate::uart::Uart;
use crate::wait::WaitList;

struct Printer {
    uart: Uart,
}

// SAFETY: `uart` is the single PL011 instance, mapped once at boot, and
// every access goes through `PRINTER`'s `IrqLock`.
unsafe impl Send for Printer {}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.uart.putc(b);
        }
        Ok(())
    }
}

static PRINTER: IrqLock<Option<Printer>> = IrqLock::new("printer", None);

/// Maps the board's UART0 MMIO range and installs the `Printer` singleton.
/// Must run before any `print!`/`kinfo!` call other than this one's own
/// diagnostics; first step of the documented boot order (UART -> ...).
///
/// # Safety
/// Must be called exactly once, before the MMU is enabled (the UART is
/// addressed by its physical address at this point).
pub unsafe fn init_pre_mmu() {
    let uart = unsafe { Uart::new(BOARD.uart0) };
    uart.init();
    *PRINTER.lock() = Some(Printer { uart });
}

/// Rebases the `Printer`'s UART pointer from physical to direct-map virtual,
/// called once post-MMU as part of the same pointer-rebasing pass the MMU
/// module performs for the page allocators.
pub fn rebase_post_mmu(direct_map_offset: usize) {
    let mut guard = PRINTER.lock();
    if let Some(p) = guard.as_mut() {
        // SAFETY: the UART's physical MMIO base is identity-adjacent to its
        // direct-map virtual address by construction of the direct map.
        p.uart = unsafe { Uart::new(BOARD.uart0 + direct_map_offset) };
    }
}

/// Enables the UART's RX interrupt; called once the GIC is up.
pub fn enable_rx_interrupt() {
    let guard = PRINTER.lock();
    if let Some(p) = guard.as_ref() {
        p.uart.enable_rx_interrupt();
    }
}

/// Blocks (spin-polling, not through the scheduler -- this is the
/// diagnostic path) until a byte arrives and returns it. The `getchar`
/// syscall instead blocks through `wait::WaitList`, fed by `handle_rx_isr`.
pub fn getc_poll() -> u8 {
    loop {
        let guard = PRINTER.lock();
        if let Some(p) = guard.as_ref() {
            if let Some(c) = p.uart.getc() {
                return c;
            }
        }
        drop(guard);
        core::hint::spin_loop();
    }
}

/// The UART ISR: drains the receive FIFO, handing each byte to `sink`
/// (installed by the console-input path once it exists), then clears the
/// interrupt cause.
pub fn handle_rx_isr(mut sink: impl FnMut(u8)) {
    let guard = PRINTER.lock();
    if let Some(p) = guard.as_ref() {
        while let Some(c) = p.uart.getc() {
            sink(c);
        }
        p.uart.clear_interrupts();
    }
}

struct ConsoleInput {
    queue: ArrayVec<u8, CONSOLE_INPUT_CAP>,
    waiters: WaitList,
}

static INPUT: IrqLock<ConsoleInput> = IrqLock::new(
    "console_input",
    ConsoleInput {
        queue: ArrayVec::new_const(),
        waiters: WaitList::new(),
    },
);

/// Feeds one RX byte into the blocking `getchar` path. Installed as
/// `handle_rx_isr`'s sink once the GIC is up; the oldest byte is dropped
/// (logged) if the queue is already full, since there is no backpressure to
/// apply to a UART.
pub fn feed_input_byte(c: u8) {
    let mut guard = INPUT.lock();
    if guard.queue.is_full() {
        crate::kwarn!("console input queue full, dropping oldest byte");
        guard.queue.remove(0);
    }
    guard.queue.push(c);
    guard.waiters.awaken();
}

/// Blocks the calling process through the scheduler (not spin-polling, see
/// `getc_poll`) until a byte is available, and returns it. Backs the
/// `getchar` syscall.
pub fn getchar_blocking() -> u8 {
    loop {
        let mut guard = INPUT.lock();
        if !guard.queue.is_empty() {
            return guard.queue.remove(0);
        }
        // Must add the waiter and drop the lock before calling the
        // scheduler: `schedule` never returns to this stack frame until
        // `feed_input_byte` wakes it, and that needs `INPUT`'s lock itself.
        unsafe { crate::lock::push_off() };
        if let Some(idx) = crate::proc::current_idx() {
            guard.waiters.add_waiter(idx);
            crate::proc::set_ready(idx, false);
        }
        drop(guard);
        unsafe { crate::lock::pop_off() };
        crate::proc::yield_current();
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    let mut guard = PRINTER.lock();
    if let Some(p) = guard.as_mut() {
        let _ = p.write_fmt(args);
    }
}

/// Prints to the console with no trailing newline.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints to the console, with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Informational diagnostic (boot progress, capability negotiation, scheduler
/// fallback).
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => ($crate::println!("[info] {}", format_args!($($arg)*)));
}

/// A recoverable-but-notable condition: a refused precondition violation, a
/// dropped malformed virtqueue entry, a full wait list.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => ($crate::println!("[warn] {}", format_args!($($arg)*)));
}

/// A fault, an unknown syscall number, or another error-taxonomy event
/// spec.md §7 says must be logged.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => ($crate::println!("[error] {}", format_args!($($arg)*)));
}

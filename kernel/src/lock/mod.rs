//! Mutual exclusion.
//!
//! This kernel is single-CPU (no SMP), so the only
//! mutual exclusion the shared-resource policy actually needs is disabling
//! interrupts around a critical section -- there is no second core that can
//! observe a half-updated structure. `IrqLock<T>` is that discipline wrapped
//! in a `Lock`/`Guard` pair in the teacher's shape, rather than a busy-wait
//! spin loop: a spin loop with a single CPU and interrupts disabled could
//! never be released by anyone else.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::interface::Arch;
use crate::arch::TargetArch;

/// Nesting depth of `push_off`/`pop_off` calls on this (the only) core, and
/// whether interrupts were enabled before the outermost `push_off`. Mirrors
/// the teacher's per-`Cpu` `noff`/`interrupt_enabled` fields, collapsed to
/// globals since there is exactly one core.
static NOFF: AtomicUsize = AtomicUsize::new(0);
static mut INTR_ENABLED_BEFORE: bool = false;

/// `push_off`/`pop_off` are matched: it takes two `pop_off`s to undo two
/// `push_off`s. If interrupts are initially off, `push_off` then `pop_off`
/// leaves them off.
///
/// # Safety
/// Must be paired with a later `pop_off`. The pair must not interleave with
/// another thread of control's push/pop pair; since there is only one core
/// and interrupts are off for the whole region, the only such interleaving
/// would be a bug (reentrant use), not concurrent hardware execution.
pub unsafe fn push_off() {
    let old = TargetArch::intr_get();
    TargetArch::intr_off();
    if NOFF.load(Ordering::Relaxed) == 0 {
        // SAFETY: interrupts are off and NOFF == 0, so nothing else touches this.
        unsafe { INTR_ENABLED_BEFORE = old };
    }
    let _ = NOFF.fetch_add(1, Ordering::Relaxed);
}

/// # Safety
/// Must be paired with an earlier `push_off`.
pub unsafe fn pop_off() {
    debug_assert!(!TargetArch::intr_get(), "pop_off: interruptible");
    let prev = NOFF.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev >= 1, "pop_off: unbalanced");
    if prev == 1 {
        // SAFETY: interrupts are off and we just brought NOFF to 0.
        if unsafe { INTR_ENABLED_BEFORE } {
            TargetArch::intr_on();
        }
    }
}

/// A lock held by disabling interrupts, in the teacher's `Lock`/`Guard`
/// shape. There is no spin loop: on a single CPU, `lock()` observing
/// already-held state can only mean the same thread of control re-entered,
/// which is a bug, not contention from another core.
pub struct IrqLock<T> {
    name: &'static str,
    held: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is always gated by `held`, toggled only while
// interrupts are off on the kernel's single core.
unsafe impl<T: Send> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        // SAFETY: paired with the guard's `Drop`.
        unsafe { push_off() };
        let was_held = self.held.swap(true, Ordering::Acquire);
        assert!(!was_held, "IrqLock re-entered: {}", self.name);
        IrqLockGuard { lock: self }
    }

    /// Raw pointer to the inner data, bypassing the guard. The caller must
    /// already hold the lock, or otherwise guarantee exclusive access (e.g.
    /// during single-threaded boot, before interrupts are ever enabled).
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn holding(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies `held == true` and interrupts off.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        // SAFETY: paired with `IrqLock::lock`'s `push_off`.
        unsafe { pop_off() };
    }
}

/// Load/store-exclusive-style counting semaphore, kept for the future-SMP
/// readiness that a future SMP port would need ("the spin-semaphore primitive...
/// is available for future SMP but on a single CPU it is functionally
/// equivalent to disabling interrupts"). Not exercised by this kernel's own
/// code paths, which all use `IrqLock`/`push_off`/`pop_off` instead.
pub struct SpinSemaphore {
    value: AtomicUsize,
}

impl SpinSemaphore {
    pub const fn new(initial: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial),
        }
    }

    pub fn decrement_if_positive(&self) -> bool {
        loop {
            let cur = self.value.load(Ordering::Relaxed);
            if cur == 0 {
                return false;
            }
            if self
                .value
                .compare_exchange_weak(cur, cur - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn increment(&self) {
        let _ = self.value.fetch_add(1, Ordering::Release);
    }
}

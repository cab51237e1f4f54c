//! Architecture-dependent code: one module per supported ARM width, behind
//! the `interface::Arch` trait.

pub mod addr;
pub mod interface;
pub mod memlayout;

#[cfg(target_pointer_width = "32")]
pub mod armv7;
#[cfg(target_pointer_width = "64")]
pub mod armv8;

#[cfg(target_pointer_width = "32")]
pub type TargetArch = armv7::Armv7;
#[cfg(target_pointer_width = "64")]
pub type TargetArch = armv8::Armv8;

/// Entry point a freshly built kthread context resumes into; recovers the
/// `(fn, arg)` pair out of the argument register and calls `proc_kthread_entry`.
#[cfg(target_pointer_width = "32")]
pub use armv7::kthread_trampoline;
#[cfg(target_pointer_width = "64")]
pub use armv8::kthread_trampoline;

/// Entry point a freshly built user-process context resumes into; recovers
/// the trap-frame pointer and calls `proc_user_entry`.
#[cfg(target_pointer_width = "32")]
pub use armv7::user_trampoline;
#[cfg(target_pointer_width = "64")]
pub use armv8::user_trampoline;

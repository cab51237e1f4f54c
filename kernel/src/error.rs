//! Kernel-wide error type.
//!
//! Every fallible kernel-internal operation (PAGE, SLAB/KMALLOC, MMU, syscall
//! dispatch) returns `Result<_, KernelError>` instead of a sentinel value or a
//! panic. The variants are exactly the negative error codes the syscall ABI
//! returns to user space, plus `OutOfMemory` for the PAGE/SLAB exhaustion path.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    PermissionDenied = 1,
    BadFileDescriptor = 2,
    AddressNotAvailable = 3,
    AddressInUse = 4,
    NotSupported = 5,
    InvalidArgument = 6,
    NoSuchDevice = 7,
    NoSuchEntry = 8,
    NameTooLong = 9,
    NotADirectory = 10,
    Busy = 11,
    OutOfMemory = 12,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::PermissionDenied => "permission denied",
            KernelError::BadFileDescriptor => "bad file descriptor",
            KernelError::AddressNotAvailable => "address not available",
            KernelError::AddressInUse => "address in use",
            KernelError::NotSupported => "not supported",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NoSuchDevice => "no such device",
            KernelError::NoSuchEntry => "no such entry",
            KernelError::NameTooLong => "name too long",
            KernelError::NotADirectory => "not a directory",
            KernelError::Busy => "busy",
            KernelError::OutOfMemory => "out of memory",
        };
        f.write_str(s)
    }
}

/// Converts a `KernelError` into the raw negative-int value returned across
/// the syscall ABI boundary: error codes are small positive ints returned
/// negative.
impl From<KernelError> for isize {
    fn from(e: KernelError) -> Self {
        -(e as isize)
    }
}

pub type KResult<T> = Result<T, KernelError>;

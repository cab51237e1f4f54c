//! Address types and page-granularity helpers shared by both ARM widths.

use core::fmt;
use core::ops::{Add, Sub};

/// Bytes per page on both ARMv7-A and ARMv8-A with a 4 KiB granule.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

#[inline]
pub const fn page_round_up(x: usize) -> usize {
    (x + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_round_down(x: usize) -> usize {
    x & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(x: usize) -> bool {
    x & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn is_aligned(x: usize, align_bits: u32) -> bool {
    x & ((1usize << align_bits) - 1) == 0
}

#[inline]
pub const fn align_up(x: usize, align_bits: u32) -> usize {
    let mask = (1usize << align_bits) - 1;
    (x + mask) & !mask
}

macro_rules! define_addr {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
        #[repr(transparent)]
        pub struct $name(pub usize);

        impl $name {
            #[inline]
            pub const fn new(x: usize) -> Self {
                Self(x)
            }

            #[inline]
            pub const fn addr(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                is_page_aligned(self.0)
            }

            #[inline]
            pub const fn round_down(self) -> Self {
                Self(page_round_down(self.0))
            }

            #[inline]
            pub const fn round_up(self) -> Self {
                Self(page_round_up(self.0))
            }
        }

        impl From<usize> for $name {
            fn from(x: usize) -> Self {
                Self(x)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;
            fn add(self, rhs: usize) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;
            fn sub(self, rhs: usize) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;
            fn sub(self, rhs: Self) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

define_addr!(PAddr, "A physical address.");
define_addr!(VAddr, "A kernel or user virtual address.");

//! Small free-standing helpers with no better home.

/// Blocks inlining to avoid an infinite-loop miscompilation of LLVM on some
/// targets (rust-lang/rust#28728) when a spin loop is inlined into a caller
/// that itself never returns.
#[inline(never)]
pub fn spin_loop() -> ! {
    loop {
        ::core::hint::spin_loop();
    }
}

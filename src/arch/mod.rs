//! Architecture layer
//!
//! The core is x86_64-only; the indirection is kept so the module paths the
//! rest of the kernel uses stay stable.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64/mod.rs"]
pub mod platform;

pub use platform::cpu;
pub use platform::serial;

/// Run a closure with interrupts disabled, restoring the previous state after.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

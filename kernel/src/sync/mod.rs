//! Kernel synchronization primitives.

pub mod spinlock;

pub use spinlock::{without_interrupts, SpinLock};

//! Interrupt and exception handling.

mod handlers;
mod idt;

pub use handlers::{SPURIOUS_VECTOR_BASE, TIMER_VECTOR};
pub use idt::{init, load_on_ap};

//! Architecture support: CPU accessors, descriptor tables, per-CPU state,
//! and SMP bring-up.

pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod local;
pub mod smp;
pub mod tss;

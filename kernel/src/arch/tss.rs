//! Task State Segment.
//!
//! In long mode the TSS only carries the stack pointers for privilege
//! transitions (RSP0-RSP2) and the Interrupt Stack Table used to force a
//! known-good stack on critical exceptions.

/// The 64-bit Task State Segment.
#[repr(C, packed)]
pub struct Tss {
    reserved0: u32,
    /// RSP0 is loaded on a Ring 3 → Ring 0 transition.
    pub rsp: [u64; 3],
    reserved1: u64,
    /// IST1-IST7 dedicated interrupt stacks.
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset of the I/O permission bitmap; pointing past the limit
    /// means "no bitmap".
    pub iomap_base: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iomap_base: core::mem::size_of::<Tss>() as u16,
        }
    }
}

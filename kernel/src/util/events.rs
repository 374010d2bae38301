// =============================================================================
// Basalt — Debug Event Stream
// =============================================================================
//
// A binary log of kernel events on COM2, consumed by tooling on the host
// side. Records are framed by size alone: one event byte followed by that
// event's fixed-layout payload. Payloads are plain-old-data structs
// serialized field by field in little-endian order, so the wire layout is
// independent of struct padding.
// =============================================================================

use core::sync::atomic::{AtomicBool, Ordering};

/// Wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    Ack = 0,
    AllocatePhysicalMemory = 1,
    AllocateVirtualMemory = 2,
    ReleasePhysicalMemory = 3,
    ReleaseVirtualMemory = 4,
    ScheduleTask = 5,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct AllocatePhysicalMemory {
    pub size: u64,
    pub address: u64,
    pub alignment: u32,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct AllocateVirtualMemory {
    pub size: u64,
    pub address: u64,
    pub alignment: u32,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ReleasePhysicalMemory {
    pub begin: u64,
    pub end: u64,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ReleaseVirtualMemory {
    pub begin: u64,
    pub end: u64,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ScheduleTask {
    pub thread_id: u64,
    pub cpu: u32,
    pub tag: u32,
}

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Opens the stream and acknowledges to the listener.
pub fn init() {
    ENABLED.store(true, Ordering::Release);
    send_raw(Event::Ack, &[]);
}

#[inline]
fn enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

fn send_raw(event: Event, payload: &[u8]) {
    crate::sync::without_interrupts(|| {
        let serial = khal::serial::COM2.lock();
        serial.write_byte(event as u8);
        serial.write_bytes(payload);
    });
}

/// Little-endian field-by-field serializer for the fixed payloads.
struct Packet {
    buffer: [u8; 24],
    length: usize,
}

impl Packet {
    fn new() -> Self {
        Self {
            buffer: [0; 24],
            length: 0,
        }
    }

    fn put_u64(mut self, value: u64) -> Self {
        self.buffer[self.length..self.length + 8].copy_from_slice(&value.to_le_bytes());
        self.length += 8;
        self
    }

    fn put_u32(mut self, value: u32) -> Self {
        self.buffer[self.length..self.length + 4].copy_from_slice(&value.to_le_bytes());
        self.length += 4;
        self
    }

    fn send(self, event: Event) {
        send_raw(event, &self.buffer[..self.length]);
    }
}

pub fn allocate_physical(event: AllocatePhysicalMemory) {
    if !enabled() {
        return;
    }
    Packet::new()
        .put_u64(event.size)
        .put_u64(event.address)
        .put_u32(event.alignment)
        .put_u32(event.tag)
        .send(Event::AllocatePhysicalMemory);
}

pub fn allocate_virtual(event: AllocateVirtualMemory) {
    if !enabled() {
        return;
    }
    Packet::new()
        .put_u64(event.size)
        .put_u64(event.address)
        .put_u32(event.alignment)
        .put_u32(event.tag)
        .send(Event::AllocateVirtualMemory);
}

pub fn release_physical(event: ReleasePhysicalMemory) {
    if !enabled() {
        return;
    }
    Packet::new()
        .put_u64(event.begin)
        .put_u64(event.end)
        .put_u32(event.tag)
        .send(Event::ReleasePhysicalMemory);
}

pub fn release_virtual(event: ReleaseVirtualMemory) {
    if !enabled() {
        return;
    }
    Packet::new()
        .put_u64(event.begin)
        .put_u64(event.end)
        .put_u32(event.tag)
        .send(Event::ReleaseVirtualMemory);
}

pub fn schedule_task(event: ScheduleTask) {
    if !enabled() {
        return;
    }
    Packet::new()
        .put_u64(event.thread_id)
        .put_u32(event.cpu)
        .put_u32(event.tag)
        .send(Event::ScheduleTask);
}

//! Threads and their CAS-driven state machine.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use alloc::boxed::Box;
use alloc::string::String;

use krcu::{Intrusive, IntrusiveBase};
use spin::Mutex;

use crate::context::{FpuArea, RegisterSet};

/// Size of each thread's kernel-mode stack (32 KiB). Large enough for
/// nested interrupt frames and anything called from interrupt context.
pub const KERNEL_STACK_SIZE: usize = 4096 * 8;

/// An aligned kernel stack.
#[repr(C, align(16))]
pub struct KernelStack {
    pub data: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Top of the stack; stacks grow downward.
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

/// Monotonically increasing thread id counter.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Scheduling states. Transitions are compare-and-swap only; observing an
/// unexpected state redirects the caller rather than blocking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Sitting in a run queue, ready to execute.
    Queued = 0,
    /// Executing on some CPU.
    Running = 1,
    /// Parked on a wait queue until signalled or timed out.
    Waiting = 2,
    /// Removed from scheduling until resumed.
    Suspended = 3,
    /// Ran to completion.
    Finished = 4,
    /// Abandoned; will never run again.
    Orphaned = 5,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::Queued,
            1 => ThreadState::Running,
            2 => ThreadState::Waiting,
            3 => ThreadState::Suspended,
            4 => ThreadState::Finished,
            5 => ThreadState::Orphaned,
            _ => unreachable!("invalid thread state"),
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadState::Finished | ThreadState::Orphaned)
    }
}

/// Outcome of the last wait or sleep, read by the thread when it next runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitStatus {
    None = 0,
    /// The awaited object was signalled before the deadline.
    Completed = 1,
    /// The deadline passed first.
    Timeout = 2,
}

impl WaitStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WaitStatus::None,
            1 => WaitStatus::Completed,
            2 => WaitStatus::Timeout,
            _ => unreachable!("invalid wait status"),
        }
    }
}

/// A schedulable thread.
///
/// Built through [`krcu::Shared::new_intrusive`] so scheduler code can mint
/// handles from a bare reference.
pub struct Thread {
    base: IntrusiveBase<Thread>,
    id: u64,
    name: String,
    state: AtomicU8,
    signal: AtomicU8,
    regs: Mutex<RegisterSet>,
    // Only ever touched by the CPU that owns the thread during a context
    // switch, so a lock would buy nothing.
    fpu: UnsafeCell<Box<FpuArea>>,
    kernel_stack: Box<KernelStack>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a thread that will first run with `regs`.
    pub fn new(name: &str, regs: RegisterSet) -> Self {
        // Allocate the stack directly on the heap without staging the full
        // array on the current stack, which would overflow it.
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            assert!(!ptr.is_null(), "failed to allocate a kernel stack");
            Box::from_raw(ptr)
        };

        Self {
            base: IntrusiveBase::new(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            state: AtomicU8::new(ThreadState::Queued as u8),
            signal: AtomicU8::new(WaitStatus::None as u8),
            regs: Mutex::new(regs),
            fpu: UnsafeCell::new(Box::new(FpuArea::new())),
            kernel_stack,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the transition `*expected → desired`.
    ///
    /// On failure the observed state is written back into `expected`, so a
    /// caller can loop and redirect on what it actually saw.
    pub fn cmpxchg_state(&self, expected: &mut ThreadState, desired: ThreadState) -> bool {
        match self.state.compare_exchange(
            *expected as u8,
            desired as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => {
                *expected = ThreadState::from_u8(observed);
                false
            }
        }
    }

    /// Marks the thread terminal. Used when it returns from its entry
    /// point or is abandoned.
    pub fn set_terminal(&self, state: ThreadState) {
        debug_assert!(state.is_terminal());
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn signal_status(&self) -> WaitStatus {
        WaitStatus::from_u8(self.signal.load(Ordering::Acquire))
    }

    pub fn set_signal_status(&self, status: WaitStatus) {
        self.signal.store(status as u8, Ordering::Release);
    }

    pub fn save_state(&self, regs: RegisterSet) {
        *self.regs.lock() = regs;
    }

    pub fn load_state(&self) -> RegisterSet {
        *self.regs.lock()
    }

    /// Base of the kernel stack, loaded into the per-CPU state so a
    /// system-call entry from user mode can find its stack.
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.top()
    }

    /// The FXSAVE area, for the context-switch path only.
    ///
    /// # Safety
    /// May only be used by the CPU currently switching this thread, which
    /// is the only place that accesses it.
    pub unsafe fn fpu_area(&self) -> *mut FpuArea {
        unsafe { &mut **self.fpu.get() }
    }
}

impl Intrusive for Thread {
    fn intrusive_base(&self) -> &IntrusiveBase<Self> {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let thread = Thread::new("t", RegisterSet::default());
        assert_eq!(thread.state(), ThreadState::Queued);

        let mut expected = ThreadState::Queued;
        assert!(thread.cmpxchg_state(&mut expected, ThreadState::Running));
        assert_eq!(thread.state(), ThreadState::Running);

        // Failing CAS reports what it saw.
        let mut expected = ThreadState::Queued;
        assert!(!thread.cmpxchg_state(&mut expected, ThreadState::Suspended));
        assert_eq!(expected, ThreadState::Running);

        thread.set_terminal(ThreadState::Finished);
        assert!(thread.state().is_terminal());
    }

    #[test]
    fn signal_status_round_trip() {
        let thread = Thread::new("t", RegisterSet::default());
        assert_eq!(thread.signal_status(), WaitStatus::None);

        thread.set_signal_status(WaitStatus::Timeout);
        assert_eq!(thread.signal_status(), WaitStatus::Timeout);
    }

    #[test]
    fn ids_are_unique() {
        let a = Thread::new("a", RegisterSet::default());
        let b = Thread::new("b", RegisterSet::default());
        assert_ne!(a.id(), b.id());
    }
}

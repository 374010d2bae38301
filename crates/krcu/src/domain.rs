//! The reclamation domain and its generations.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use alloc::boxed::Box;

use crate::lock::SwapLock;

/// Intrusive header for anything that can be parked on a generation's
/// retired list.  The eject function runs once the generation has no
/// readers left.
pub struct RcuHead {
    next: AtomicPtr<RcuHead>,
    eject: core::cell::Cell<Option<unsafe fn(&'static RcuDomain, *mut RcuHead)>>,
}

// The cell is only written by the thread enqueueing the head and read after
// the generation quiesces, with the retired-list CAS ordering the two.
unsafe impl Send for RcuHead {}
unsafe impl Sync for RcuHead {}

impl RcuHead {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            eject: core::cell::Cell::new(None),
        }
    }
}

impl Default for RcuHead {
    fn default() -> Self {
        Self::new()
    }
}

/// One reclamation epoch: a reader count and the objects retired while the
/// epoch was current.
struct Generation {
    guard: AtomicU32,
    retired: AtomicPtr<RcuHead>,
}

impl Generation {
    fn new() -> Box<Generation> {
        Box::new(Generation {
            guard: AtomicU32::new(0),
            retired: AtomicPtr::new(ptr::null_mut()),
        })
    }

    fn push(&self, head: *mut RcuHead) {
        let mut current = self.retired.load(Ordering::Acquire);
        loop {
            unsafe { (*head).next.store(current, Ordering::Relaxed) };
            match self.retired.compare_exchange_weak(
                current,
                head,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// The reclamation domain.
///
/// Created once at boot and shared by reference; every counted object keeps
/// a pointer to the domain it retires into.
pub struct RcuDomain {
    current: AtomicPtr<Generation>,
    // Guards the swap of `current` so a reader cannot acquire a generation
    // that has already been ejected. Held only for pointer-sized work.
    swap_lock: SwapLock,
}

unsafe impl Send for RcuDomain {}
unsafe impl Sync for RcuDomain {}

impl RcuDomain {
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Generation::new())),
            swap_lock: SwapLock::new(),
        }
    }

    /// Enters a read-side critical section.
    ///
    /// Objects reachable at any point inside the section stay alive until
    /// the guard drops, however many writers retire them meanwhile.
    pub fn read_lock(&'static self) -> RcuGuard {
        RcuGuard {
            generation: self.acquire(),
        }
    }

    /// Waits until every reader that was inside a critical section when
    /// this call started has left, then reclaims everything retired before
    /// the call.
    ///
    /// Must not be called from interrupt context, and never while holding a
    /// lock a reader on another CPU might need to make progress.
    pub fn synchronize(&'static self) {
        let fresh = Box::into_raw(Generation::new());
        let old = {
            let _guard = self.swap_lock.lock();
            self.current.swap(fresh, Ordering::AcqRel)
        };

        unsafe {
            while (*old).guard.load(Ordering::Acquire) != 0 {
                core::hint::spin_loop();
            }

            self.destroy(old);
        }
    }

    /// Parks `head` on the current generation; `eject` runs after the next
    /// quiescent period.
    pub(crate) fn retire(
        &'static self,
        head: *mut RcuHead,
        eject: unsafe fn(&'static RcuDomain, *mut RcuHead),
    ) {
        let generation = self.acquire();
        unsafe {
            (*head).eject.set(Some(eject));
            (*generation).push(head);
            (*generation).guard.fetch_sub(1, Ordering::Release);
        }
    }

    fn acquire(&self) -> *mut Generation {
        let _guard = self.swap_lock.lock();
        let generation = self.current.load(Ordering::Acquire);
        unsafe {
            (*generation).guard.fetch_add(1, Ordering::Acquire);
        }
        generation
    }

    /// Runs every retired eject and frees the generation.
    ///
    /// Ejects may re-retire objects; those land in the (new) current
    /// generation, not this one.
    unsafe fn destroy(&'static self, generation: *mut Generation) {
        unsafe {
            let mut head = (*generation).retired.swap(ptr::null_mut(), Ordering::AcqRel);
            while !head.is_null() {
                let next = (*head).next.load(Ordering::Relaxed);
                if let Some(eject) = (*head).eject.take() {
                    eject(self, head);
                }
                head = next;
            }

            drop(Box::from_raw(generation));
        }
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// A live read-side critical section. Dropping it releases the reader's
/// hold on the generation.
pub struct RcuGuard {
    generation: *mut Generation,
}

impl Drop for RcuGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.generation).guard.fetch_sub(1, Ordering::Release);
        }
    }
}

//! The bounded per-CPU run queue.
//!
//! A fixed-capacity ring of weak thread references behind a spinlock.
//! Multiple producers enqueue (load balancing, resume paths on other CPUs)
//! and the owning CPU consumes, so every operation is a short critical
//! section; the length is mirrored in an atomic so the balancer can pick
//! the least-loaded CPU without taking anybody's lock.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::VecDeque;

use krcu::Weak;
use spin::Mutex;

use crate::thread::Thread;

/// Default queue capacity per CPU.
pub const DEFAULT_CAPACITY: usize = 128;

pub struct RunQueue {
    ring: Mutex<VecDeque<Weak<Thread>>>,
    capacity: usize,
    len: AtomicUsize,
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            len: AtomicUsize::new(0),
        }
    }

    /// Enqueues a weak thread reference; false when the queue is full.
    pub fn try_enqueue(&self, thread: Weak<Thread>) -> bool {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            return false;
        }

        ring.push_back(thread);
        self.len.store(ring.len(), Ordering::Relaxed);
        true
    }

    pub fn try_dequeue(&self) -> Option<Weak<Thread>> {
        let mut ring = self.ring.lock();
        let thread = ring.pop_front();
        self.len.store(ring.len(), Ordering::Relaxed);
        thread
    }

    /// Approximate occupancy, used by the balancer.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RegisterSet;
    use krcu::{RcuDomain, Shared};

    fn domain() -> &'static RcuDomain {
        Box::leak(Box::new(RcuDomain::new()))
    }

    #[test]
    fn fifo_order() {
        let domain = domain();
        let queue = RunQueue::new(4);

        let a = Shared::new_intrusive(domain, Thread::new("a", RegisterSet::default()));
        let b = Shared::new_intrusive(domain, Thread::new("b", RegisterSet::default()));

        assert!(queue.try_enqueue(a.downgrade()));
        assert!(queue.try_enqueue(b.downgrade()));
        assert_eq!(queue.len(), 2);

        let first = queue.try_dequeue().unwrap().upgrade().unwrap();
        assert_eq!(first.name(), "a");
        let second = queue.try_dequeue().unwrap().upgrade().unwrap();
        assert_eq!(second.name(), "b");
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn bounded_capacity() {
        let domain = domain();
        let queue = RunQueue::new(2);
        let t = Shared::new_intrusive(domain, Thread::new("t", RegisterSet::default()));

        assert!(queue.try_enqueue(t.downgrade()));
        assert!(queue.try_enqueue(t.downgrade()));
        assert!(!queue.try_enqueue(t.downgrade()));
    }

    #[test]
    fn dead_entries_fail_upgrade() {
        let domain = domain();
        let queue = RunQueue::new(4);

        let t = Shared::new_intrusive(domain, Thread::new("t", RegisterSet::default()));
        queue.try_enqueue(t.downgrade());

        drop(t);
        domain.synchronize();

        // The weak entry is still in the ring but can no longer upgrade.
        assert!(queue.try_dequeue().unwrap().upgrade().is_none());
    }
}

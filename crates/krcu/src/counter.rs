//! Zero-latching reference counter.

use core::sync::atomic::{AtomicU32, Ordering};

/// The high bit marks a counter that has latched at zero.
const STUCK: u32 = 1 << 31;

/// A counter that, once it reaches zero, can never be raised again.
///
/// The latch is what makes the weak-upgrade protocol sound: a successful
/// [`StickyCounter::increment`] proves the counted value has not been
/// destroyed, because destruction only happens after the counter latches
/// and the latch refuses every later increment.
pub struct StickyCounter(AtomicU32);

impl StickyCounter {
    pub const fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    /// The current count, reading a latched counter as zero.
    pub fn load(&self) -> u32 {
        let value = self.0.load(Ordering::Acquire);
        if value & STUCK != 0 {
            0
        } else {
            value
        }
    }

    /// Adds `count`, failing iff the counter has already latched.
    pub fn increment(&self, count: u32) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current & STUCK != 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Subtracts `count`.
    ///
    /// Returns true iff this call took the counter to zero *and* won the
    /// latch; the caller then owns whatever teardown zero implies.  A
    /// racing increment that lands between the subtraction and the latch
    /// revives the counter and this call returns false.
    pub fn decrement(&self, count: u32) -> bool {
        let old = self.0.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(old & STUCK == 0, "decrement of a latched counter");
        debug_assert!(old >= count, "counter underflow");

        if old == count {
            self.0
                .compare_exchange(0, STUCK, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_and_down() {
        let counter = StickyCounter::new(1);
        assert!(counter.increment(2));
        assert_eq!(counter.load(), 3);
        assert!(!counter.decrement(1));
        assert_eq!(counter.load(), 2);
    }

    #[test]
    fn latches_at_zero() {
        let counter = StickyCounter::new(1);
        assert!(counter.decrement(1));
        assert_eq!(counter.load(), 0);

        // No increment can revive a latched counter.
        assert!(!counter.increment(1));
        assert_eq!(counter.load(), 0);
    }

    #[test]
    fn only_one_decrement_wins() {
        let counter = StickyCounter::new(2);
        assert!(!counter.decrement(1));
        assert!(counter.decrement(1));
    }
}

//! Counted control blocks and the user-facing handle types.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{offset_of, ManuallyDrop};
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use alloc::boxed::Box;

use crate::counter::StickyCounter;
use crate::domain::{RcuDomain, RcuHead};
use crate::EjectAction;

/// One retire slot: batches deferred releases of a single flavour (strong
/// or weak) for one object within a generation.
///
/// `prepare` accumulates counts; only the transition away from zero
/// enqueues the slot, so an object is parked on a generation at most once
/// per flavour no matter how many releases happen inside it.
struct Slot {
    head: RcuHead,
    pending: AtomicU32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            head: RcuHead::new(),
            pending: AtomicU32::new(0),
        }
    }

    /// Adds `count` to the slot. True means the caller must enqueue it.
    fn prepare(&self, count: u32) -> bool {
        self.pending.fetch_add(count, Ordering::AcqRel) == 0
    }

    fn take(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }
}

/// Control block: the value, both counters, the retire slots, and the
/// domain reclamation goes through.
///
/// The strong count owns the value; the weak count owns the control block.
/// All strong holders collectively own a single weak unit, which is what
/// the `weak == 1` test in [`Counted::release_strong`] checks for.
pub(crate) struct Counted<T: 'static> {
    head: RcuHead,
    strong: StickyCounter,
    weak: StickyCounter,
    strong_slot: Slot,
    weak_slot: Slot,
    domain: &'static RcuDomain,
    value: UnsafeCell<ManuallyDrop<T>>,
}

unsafe impl<T: Send + Sync> Send for Counted<T> {}
unsafe impl<T: Send + Sync> Sync for Counted<T> {}

impl<T: 'static> Counted<T> {
    fn new(domain: &'static RcuDomain, value: T) -> *mut Counted<T> {
        Box::into_raw(Box::new(Counted {
            head: RcuHead::new(),
            strong: StickyCounter::new(1),
            weak: StickyCounter::new(1),
            strong_slot: Slot::new(),
            weak_slot: Slot::new(),
            domain,
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        }))
    }

    fn retain_strong(&self, count: u32) -> bool {
        self.strong.increment(count)
    }

    fn retain_weak(&self, count: u32) -> bool {
        self.weak.increment(count)
    }

    /// Drops the value once the strong count latches.
    fn release_strong(&self, count: u32) -> EjectAction {
        if self.strong.decrement(count) {
            // Last strong reference: the value dies here, the control
            // block only if no weak references are left.
            unsafe { self.dispose() };

            if self.weak.load() == 1 {
                EjectAction::Destroy
            } else {
                EjectAction::Delay
            }
        } else {
            EjectAction::None
        }
    }

    /// True when the control block itself must be deleted.
    fn release_weak(&self, count: u32) -> bool {
        self.weak.decrement(count)
    }

    unsafe fn dispose(&self) {
        unsafe { ManuallyDrop::drop(&mut *self.value.get()) };
    }

    fn defer_release_strong(&self, count: u32) {
        if self.strong_slot.prepare(count) {
            let head = core::ptr::addr_of!(self.strong_slot.head) as *mut RcuHead;
            self.domain.retire(head, eject_strong::<T>);
        }
    }

    fn defer_release_weak(&self, count: u32) {
        if self.weak_slot.prepare(count) {
            let head = core::ptr::addr_of!(self.weak_slot.head) as *mut RcuHead;
            self.domain.retire(head, eject_weak::<T>);
        }
    }
}

/// Recovers the control block from one of its embedded heads.
unsafe fn counted_from_head<T: 'static>(head: *mut RcuHead, offset: usize) -> *mut Counted<T> {
    unsafe { (head as *mut u8).sub(offset) as *mut Counted<T> }
}

unsafe fn eject_strong<T: 'static>(domain: &'static RcuDomain, head: *mut RcuHead) {
    let offset = offset_of!(Counted<T>, strong_slot) + offset_of!(Slot, head);
    let counted = unsafe { counted_from_head::<T>(head, offset) };

    unsafe {
        let count = (*counted).strong_slot.take();
        if count == 0 {
            return;
        }

        match (*counted).release_strong(count) {
            EjectAction::None => {}
            EjectAction::Destroy => drop(Box::from_raw(counted)),
            EjectAction::Delay => {
                // Weak references remain: drop the strong holders' shared
                // weak unit after the next quiescent period.
                let head = core::ptr::addr_of!((*counted).head) as *mut RcuHead;
                domain.retire(head, eject_delayed::<T>);
            }
        }
    }
}

unsafe fn eject_delayed<T: 'static>(_domain: &'static RcuDomain, head: *mut RcuHead) {
    let offset = offset_of!(Counted<T>, head);
    let counted = unsafe { counted_from_head::<T>(head, offset) };

    unsafe {
        if (*counted).release_weak(1) {
            drop(Box::from_raw(counted));
        }
    }
}

unsafe fn eject_weak<T: 'static>(_domain: &'static RcuDomain, head: *mut RcuHead) {
    let offset = offset_of!(Counted<T>, weak_slot) + offset_of!(Slot, head);
    let counted = unsafe { counted_from_head::<T>(head, offset) };

    unsafe {
        let count = (*counted).weak_slot.take();
        if count == 0 {
            return;
        }

        if (*counted).release_weak(count) {
            drop(Box::from_raw(counted));
        }
    }
}

// ── Shared ──────────────────────────────────────────────────────

/// A strong reference to a domain-managed value.
///
/// Behaves like `Arc<T>` except that every decrement is deferred through
/// the object's retire slots, so dropping the last handle destroys the
/// value only after the next quiescent period.
pub struct Shared<T: 'static> {
    control: NonNull<Counted<T>>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T: 'static> Shared<T> {
    /// Allocates a new counted value in `domain`.
    pub fn new(domain: &'static RcuDomain, value: T) -> Self {
        let control = Counted::new(domain, value);
        Self {
            // Box::into_raw never returns null.
            control: unsafe { NonNull::new_unchecked(control) },
        }
    }

    /// Creates a weak reference to the same value.
    pub fn downgrade(&self) -> Weak<T> {
        let retained = self.counted().retain_weak(1);
        debug_assert!(retained, "weak count latched while strong refs exist");
        Weak {
            control: self.control,
        }
    }

    /// Identity comparison: do both handles refer to the same object?
    pub fn ptr_eq(&self, other: &Shared<T>) -> bool {
        self.control == other.control
    }

    /// A stable address identifying the referenced value, valid while any
    /// strong or weak handle exists. Useful as a map key.
    pub fn as_ptr(&self) -> *const T {
        // ManuallyDrop is transparent over T.
        self.counted().value.get() as *const T
    }

    fn counted(&self) -> &Counted<T> {
        unsafe { self.control.as_ref() }
    }

    fn into_raw(self) -> *mut Counted<T> {
        let control = self.control.as_ptr();
        core::mem::forget(self);
        control
    }

    /// Rebuilds a handle from a raw control pointer that already owns one
    /// strong reference.
    unsafe fn from_raw(control: *mut Counted<T>) -> Self {
        Self {
            control: unsafe { NonNull::new_unchecked(control) },
        }
    }
}

impl<T: 'static> Clone for Shared<T> {
    fn clone(&self) -> Self {
        let retained = self.counted().retain_strong(1);
        debug_assert!(retained, "strong count latched under a live handle");
        Self {
            control: self.control,
        }
    }
}

impl<T: 'static> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.counted().value.get() }
    }
}

impl<T: 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        self.counted().defer_release_strong(1);
    }
}

// ── Weak ────────────────────────────────────────────────────────

/// A weak reference: keeps the control block alive, not the value.
pub struct Weak<T: 'static> {
    control: NonNull<Counted<T>>,
}

unsafe impl<T: Send + Sync> Send for Weak<T> {}
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T: 'static> Weak<T> {
    /// Attempts to promote to a strong reference.
    ///
    /// Fails iff the strong counter has latched, i.e. the value has been
    /// (or is being) destroyed.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        if self.counted().retain_strong(1) {
            Some(Shared {
                control: self.control,
            })
        } else {
            None
        }
    }

    pub fn ptr_eq(&self, other: &Weak<T>) -> bool {
        self.control == other.control
    }

    fn counted(&self) -> &Counted<T> {
        unsafe { self.control.as_ref() }
    }

    fn into_raw(self) -> *mut Counted<T> {
        let control = self.control.as_ptr();
        core::mem::forget(self);
        control
    }
}

impl<T: 'static> Clone for Weak<T> {
    fn clone(&self) -> Self {
        let retained = self.counted().retain_weak(1);
        debug_assert!(retained, "weak count latched under a live weak handle");
        Self {
            control: self.control,
        }
    }
}

impl<T: 'static> Drop for Weak<T> {
    fn drop(&mut self) {
        self.counted().defer_release_weak(1);
    }
}

impl<T: 'static> PartialOrd for Weak<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: 'static> Ord for Weak<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.control.as_ptr().cmp(&other.control.as_ptr())
    }
}

impl<T: 'static> PartialEq for Weak<T> {
    fn eq(&self, other: &Self) -> bool {
        self.control == other.control
    }
}

impl<T: 'static> Eq for Weak<T> {}

// ── Atomic cells ────────────────────────────────────────────────

/// An atomically swappable strong reference, usable for lock-free
/// publication of new versions of a structure.
pub struct AtomicShared<T: 'static> {
    ptr: AtomicPtr<Counted<T>>,
    _marker: PhantomData<Shared<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

impl<T: 'static> AtomicShared<T> {
    /// An empty cell.
    pub const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// A cell holding `value`.
    pub fn new(value: Shared<T>) -> Self {
        Self {
            ptr: AtomicPtr::new(value.into_raw()),
            _marker: PhantomData,
        }
    }

    /// Publishes `value`, deferring the release of whatever was held.
    pub fn store(&self, value: Option<Shared<T>>) {
        let fresh = value.map_or(core::ptr::null_mut(), Shared::into_raw);
        let old = self.ptr.swap(fresh, Ordering::SeqCst);
        if !old.is_null() {
            unsafe { (*old).defer_release_strong(1) };
        }
    }

    /// Takes a strong reference on the current value.
    ///
    /// Returns `None` for an empty cell or when the resident object is
    /// already being torn down.
    pub fn load(&self) -> Option<Shared<T>> {
        let current = self.ptr.load(Ordering::SeqCst);
        if current.is_null() {
            return None;
        }

        unsafe {
            if (*current).retain_strong(1) {
                Some(Shared::from_raw(current))
            } else {
                None
            }
        }
    }

    /// Swaps `desired` in iff the cell still holds `expected`.
    ///
    /// On success the cell's reference to the old object is deferred for
    /// release and a fresh reference is taken on the new one; the caller's
    /// handles are untouched.  On failure `expected` is reloaded from the
    /// cell.
    pub fn compare_exchange(
        &self,
        expected: &mut Option<Shared<T>>,
        desired: &Option<Shared<T>>,
    ) -> bool {
        let expected_ptr = expected
            .as_ref()
            .map_or(core::ptr::null_mut(), |s| s.control.as_ptr());
        let desired_ptr = desired
            .as_ref()
            .map_or(core::ptr::null_mut(), |s| s.control.as_ptr());

        match self
            .ptr
            .compare_exchange(expected_ptr, desired_ptr, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                if let Some(desired) = desired {
                    let retained = desired.counted().retain_strong(1);
                    debug_assert!(retained);
                }
                if !expected_ptr.is_null() {
                    unsafe { (*expected_ptr).defer_release_strong(1) };
                }
                true
            }
            Err(_) => {
                *expected = self.load();
                false
            }
        }
    }
}

impl<T: 'static> Drop for AtomicShared<T> {
    fn drop(&mut self) {
        let old = self.ptr.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !old.is_null() {
            unsafe { (*old).defer_release_strong(1) };
        }
    }
}

/// The weak analogue of [`AtomicShared`].
pub struct AtomicWeak<T: 'static> {
    ptr: AtomicPtr<Counted<T>>,
    _marker: PhantomData<Weak<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicWeak<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWeak<T> {}

impl<T: 'static> AtomicWeak<T> {
    pub const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn store(&self, value: Option<Weak<T>>) {
        let fresh = value.map_or(core::ptr::null_mut(), Weak::into_raw);
        let old = self.ptr.swap(fresh, Ordering::SeqCst);
        if !old.is_null() {
            unsafe { (*old).defer_release_weak(1) };
        }
    }

    pub fn load(&self) -> Option<Weak<T>> {
        let current = self.ptr.load(Ordering::SeqCst);
        if current.is_null() {
            return None;
        }

        unsafe {
            if (*current).retain_weak(1) {
                Some(Weak {
                    control: NonNull::new_unchecked(current),
                })
            } else {
                None
            }
        }
    }
}

impl<T: 'static> Drop for AtomicWeak<T> {
    fn drop(&mut self) {
        let old = self.ptr.swap(core::ptr::null_mut(), Ordering::SeqCst);
        if !old.is_null() {
            unsafe { (*old).defer_release_weak(1) };
        }
    }
}

// ── Intrusive weak back-pointer ─────────────────────────────────

/// Embedded weak self-reference, set when the owning [`Shared`] is built
/// with [`Shared::new_intrusive`].
///
/// Lets member functions hand out handles to themselves without any
/// external bookkeeping, the pattern used for cyclic structures where
/// children hold strong references and parents weak back-pointers.
pub struct IntrusiveBase<T: 'static> {
    weak: UnsafeCell<Option<Weak<T>>>,
}

unsafe impl<T: Send + Sync> Send for IntrusiveBase<T> {}
unsafe impl<T: Send + Sync> Sync for IntrusiveBase<T> {}

impl<T: 'static> IntrusiveBase<T> {
    pub const fn new() -> Self {
        Self {
            weak: UnsafeCell::new(None),
        }
    }

    /// A weak handle to the owning object.
    pub fn loan_weak(&self) -> Weak<T> {
        unsafe { (*self.weak.get()).as_ref() }
            .expect("object was not built with Shared::new_intrusive")
            .clone()
    }

    /// A strong handle to the owning object, unless it is being torn down.
    pub fn loan_shared(&self) -> Option<Shared<T>> {
        unsafe { (*self.weak.get()).as_ref() }
            .expect("object was not built with Shared::new_intrusive")
            .upgrade()
    }
}

impl<T: 'static> Default for IntrusiveBase<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by types embedding an [`IntrusiveBase`].
pub trait Intrusive: Sized + 'static {
    fn intrusive_base(&self) -> &IntrusiveBase<Self>;

    /// A weak handle to `self`.
    fn loan_weak(&self) -> Weak<Self> {
        self.intrusive_base().loan_weak()
    }

    /// A strong handle to `self`, unless teardown has begun.
    fn loan_shared(&self) -> Option<Shared<Self>> {
        self.intrusive_base().loan_shared()
    }
}

impl<T: Intrusive> Shared<T> {
    /// Allocates a counted value and wires its intrusive weak self-pointer
    /// before the handle is shared anywhere.
    pub fn new_intrusive(domain: &'static RcuDomain, value: T) -> Self {
        let shared = Shared::new(domain, value);
        let weak = shared.downgrade();
        unsafe {
            *shared.intrusive_base().weak.get() = Some(weak);
        }
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RcuDomain;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    fn domain() -> &'static RcuDomain {
        Box::leak(Box::new(RcuDomain::new()))
    }

    struct Tracked {
        drops: Arc<AtomicUsize>,
        tag: u32,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, StdOrdering::SeqCst);
        }
    }

    fn tracked(drops: &Arc<AtomicUsize>, tag: u32) -> Tracked {
        Tracked {
            drops: drops.clone(),
            tag,
        }
    }

    #[test]
    fn destruction_is_deferred_past_synchronize() {
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let shared = Shared::new(domain, tracked(&drops, 1));
        drop(shared);

        // The release sits in a retire slot until a quiescent period.
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);

        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn clones_share_one_destruction() {
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = Shared::new(domain, tracked(&drops, 1));
        let b = a.clone();
        assert!(a.ptr_eq(&b));

        drop(a);
        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);

        drop(b);
        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn weak_upgrade_tracks_strong_count() {
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let strong = Shared::new(domain, tracked(&drops, 7));
        let weak = strong.downgrade();

        let upgraded = weak.upgrade().expect("value is alive");
        assert_eq!(upgraded.tag, 7);

        drop(strong);
        drop(upgraded);
        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);

        // The value is gone; the upgrade must now fail, but the control
        // block is still alive for the weak handle.
        assert!(weak.upgrade().is_none());

        drop(weak);
        domain.synchronize();
    }

    #[test]
    fn atomic_store_defers_old_value() {
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let cell = AtomicShared::new(Shared::new(domain, tracked(&drops, 1)));
        let v1 = cell.load().expect("cell holds v1");
        assert_eq!(v1.tag, 1);

        cell.store(Some(Shared::new(domain, tracked(&drops, 2))));
        assert_eq!(cell.load().unwrap().tag, 2);

        // v1 is still referenced by our handle; dropping it and the cell's
        // deferred release both need a quiescent period.
        drop(v1);
        assert_eq!(drops.load(StdOrdering::SeqCst), 0);

        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn reader_blocks_reclamation() {
        // A version observed inside a critical section survives the
        // writer's synchronize; a second synchronize after the reader
        // exits reclaims it.
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let cell = AtomicShared::new(Shared::new(domain, tracked(&drops, 1)));

        let guard = domain.read_lock();
        let v1 = cell.load().expect("v1 visible");

        // Writer publishes v2 and drops every strong path to v1.
        cell.store(Some(Shared::new(domain, tracked(&drops, 2))));
        drop(v1);

        // The writer synchronizes from another thread while the reader is
        // still inside its section.
        let domain_ref = domain;
        let writer = std::thread::spawn(move || {
            domain_ref.synchronize();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(drops.load(StdOrdering::SeqCst), 0, "v1 died under a reader");

        drop(guard);
        writer.join().unwrap();

        domain.synchronize();
        assert_eq!(drops.load(StdOrdering::SeqCst), 1);
    }

    #[test]
    fn compare_exchange_swaps_and_reloads() {
        let domain = domain();
        let drops = Arc::new(AtomicUsize::new(0));

        let cell = AtomicShared::new(Shared::new(domain, tracked(&drops, 1)));

        let mut expected = cell.load();
        let desired = Some(Shared::new(domain, tracked(&drops, 2)));
        assert!(cell.compare_exchange(&mut expected, &desired));
        assert_eq!(cell.load().unwrap().tag, 2);

        // A stale expectation fails and is refreshed from the cell.
        let mut stale = expected;
        let other = Some(Shared::new(domain, tracked(&drops, 3)));
        assert!(!cell.compare_exchange(&mut stale, &other));
        assert_eq!(stale.as_ref().unwrap().tag, 2);
    }

    struct Node {
        base: IntrusiveBase<Node>,
        id: u32,
    }

    impl Intrusive for Node {
        fn intrusive_base(&self) -> &IntrusiveBase<Self> {
            &self.base
        }
    }

    #[test]
    fn intrusive_self_handles() {
        let domain = domain();

        let node = Shared::new_intrusive(
            domain,
            Node {
                base: IntrusiveBase::new(),
                id: 42,
            },
        );

        let other = node.loan_shared().expect("self upgrade while alive");
        assert_eq!(other.id, 42);
        assert!(node.ptr_eq(&other));

        let weak = node.loan_weak();
        drop(node);
        drop(other);
        domain.synchronize();
        assert!(weak.upgrade().is_none());
    }
}

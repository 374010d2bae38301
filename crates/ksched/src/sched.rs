//! Per-CPU schedules and the global balancer.
//!
//! The per-CPU half owns a bounded run queue of weak thread references and
//! the currently running thread; `reschedule` is the round-robin step. The
//! global half owns the CPU table, the sleep heap (keyed by wake instant),
//! one wait heap per awaited object (keyed by timeout), and the suspend
//! set.
//!
//! Thread-state transitions are all compare-and-swap; when a CAS observes
//! something unexpected the caller redirects (drop the thread, park it,
//! skip it) rather than spinning for ownership.

use core::cmp::Reverse;

use alloc::collections::{BTreeMap, BTreeSet, BinaryHeap};
use alloc::sync::Arc;
use alloc::vec::Vec;

use krcu::{Intrusive, Shared, Weak};
use spin::{Mutex, RwLock};

use crate::clock::Instant;
use crate::context::{IsrContext, RegisterSet};
use crate::queue::RunQueue;
use crate::thread::{Thread, ThreadState, WaitStatus};

/// CPU identifier, as reported by the bring-up code.
pub type CpuId = u32;

/// Errors surfaced by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Every CPU's run queue is full.
    OutOfMemory,
    /// No waiter queue exists for the signalled object.
    NotFound,
    /// The thread is terminal and cannot be suspended or resumed.
    Completed,
}

/// Identity of an awaited object: the stable address of an RCU-managed
/// value, obtained from [`ObjectKey::of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of<T: 'static>(object: &Shared<T>) -> Self {
        Self(object.as_ptr() as usize)
    }
}

// ── Per-CPU schedule ────────────────────────────────────────────

/// One CPU's share of the scheduler.
pub struct CpuLocalSchedule {
    queue: RunQueue,
    current: Mutex<Option<Shared<Thread>>>,
}

impl CpuLocalSchedule {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: RunQueue::new(capacity),
            current: Mutex::new(None),
        }
    }

    /// Number of queued tasks, for the balancer.
    pub fn tasks(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues a thread on this CPU.
    pub fn add_thread(&self, thread: &Shared<Thread>) -> Result<(), SchedError> {
        if self.queue.try_enqueue(thread.downgrade()) {
            Ok(())
        } else {
            Err(SchedError::OutOfMemory)
        }
    }

    pub fn current_thread(&self) -> Option<Shared<Thread>> {
        self.current.lock().clone()
    }

    /// Claims `thread` for execution: CAS `Queued → Running`.
    ///
    /// Observing a transient state redirects: suspended threads are parked
    /// in the global suspend set, waiting and terminal threads are
    /// dropped. A thread already `Running` is treated as claimed.
    fn start_thread(&self, global: &GlobalSchedule, thread: &Shared<Thread>) -> bool {
        let mut expected = ThreadState::Queued;
        while !thread.cmpxchg_state(&mut expected, ThreadState::Running) {
            match expected {
                ThreadState::Suspended => {
                    global.park_suspended(thread);
                    return false;
                }
                // The wait logic already put the thread on a wait queue.
                ThreadState::Waiting => return false,
                ThreadState::Finished | ThreadState::Orphaned => return false,
                ThreadState::Running => return true,
                ThreadState::Queued => unreachable!("state CAS is strong"),
            }
        }

        true
    }

    /// Returns the old running thread to `Queued`: true means it should be
    /// re-enqueued, false means drop it (it was parked or terminated).
    fn stop_thread(thread: &Shared<Thread>) -> bool {
        let mut expected = ThreadState::Running;
        while !thread.cmpxchg_state(&mut expected, ThreadState::Queued) {
            match expected {
                ThreadState::Running | ThreadState::Queued => return true,
                ThreadState::Suspended | ThreadState::Waiting => return false,
                ThreadState::Finished | ThreadState::Orphaned => return false,
            }
        }

        true
    }

    /// Round-robin step: picks the next runnable thread from the queue,
    /// re-queueing the incumbent if it is still runnable.
    ///
    /// Returns false when no thread can run, and the CPU idles.
    pub fn reschedule(&self, global: &GlobalSchedule) -> bool {
        while let Some(entry) = self.queue.try_dequeue() {
            let Some(thread) = entry.upgrade() else {
                // The thread died while queued.
                continue;
            };

            if !self.start_thread(global, &thread) {
                continue;
            }

            let mut current = self.current.lock();
            if let Some(old) = current.take() {
                if Self::stop_thread(&old) {
                    self.queue.try_enqueue(old.loan_weak());
                }
            }
            *current = Some(thread);
            return true;
        }

        // Queue drained: the incumbent continues if it is still runnable.
        let mut current = self.current.lock();
        let Some(old) = current.clone() else {
            return false;
        };

        if self.start_thread(global, &old) {
            return true;
        }

        if Self::stop_thread(&old) {
            self.queue.try_enqueue(old.loan_weak());
        }
        *current = None;
        false
    }

    /// Performs one preemption: saves the interrupted context into the
    /// outgoing thread and returns the incoming thread's context and
    /// kernel-stack base.
    ///
    /// `None` means no switch: the interrupted context resumes unchanged.
    pub fn schedule_next_context(
        &self,
        global: &GlobalSchedule,
        context: &IsrContext,
    ) -> Option<(IsrContext, u64)> {
        // Save before rescheduling: the moment the outgoing thread goes
        // back on the queue another CPU may claim it, and it must find the
        // fresh register image there.
        if let Some(old) = self.current_thread() {
            old.save_state(RegisterSet::from_isr(context));
        }

        if !self.reschedule(global) {
            return None;
        }

        let next = self.current_thread()?;
        let regs = next.load_state();
        Some((regs.to_isr(), next.kernel_stack_top()))
    }
}

// ── Global schedule ─────────────────────────────────────────────

#[derive(Clone)]
struct SleepEntry {
    wake: Instant,
    thread: Weak<Thread>,
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake
    }
}
impl Eq for SleepEntry {}
impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.wake.cmp(&other.wake)
    }
}

#[derive(Clone)]
struct WaitEntry {
    timeout: Instant,
    thread: Weak<Thread>,
}

impl PartialEq for WaitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timeout == other.timeout
    }
}
impl Eq for WaitEntry {}
impl PartialOrd for WaitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for WaitEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.timeout.cmp(&other.timeout)
    }
}

/// Sleep heap, per-object wait heaps, and the suspend set; one lock for
/// all three, in the spirit of the short single scheduler lock.
struct SchedInner {
    sleep: BinaryHeap<Reverse<SleepEntry>>,
    waits: BTreeMap<ObjectKey, BinaryHeap<Reverse<WaitEntry>>>,
    suspended: BTreeSet<Weak<Thread>>,
}

/// The machine-wide scheduler: per-CPU schedules plus the queues shared
/// between them.
pub struct GlobalSchedule {
    cpus: RwLock<BTreeMap<CpuId, Arc<CpuLocalSchedule>>>,
    inner: Mutex<SchedInner>,
}

impl GlobalSchedule {
    pub fn new() -> Self {
        Self {
            cpus: RwLock::new(BTreeMap::new()),
            inner: Mutex::new(SchedInner {
                sleep: BinaryHeap::new(),
                waits: BTreeMap::new(),
                suspended: BTreeSet::new(),
            }),
        }
    }

    /// Registers a CPU's schedule; runs once per CPU during bring-up.
    pub fn init_cpu(&self, cpu: CpuId, capacity: usize) {
        self.cpus
            .write()
            .insert(cpu, Arc::new(CpuLocalSchedule::new(capacity)));
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<Arc<CpuLocalSchedule>> {
        self.cpus.read().get(&cpu).cloned()
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.read().len()
    }

    /// Places a thread on the CPU with the fewest queued tasks, falling
    /// back linearly when that queue is full. Only when every queue is
    /// full does this fail.
    pub fn add_thread(&self, thread: &Shared<Thread>) -> Result<(), SchedError> {
        let cpus = self.cpus.read();

        let least = cpus
            .values()
            .min_by_key(|cpu| cpu.tasks())
            .ok_or(SchedError::OutOfMemory)?;
        if least.add_thread(thread).is_ok() {
            return Ok(());
        }

        for cpu in cpus.values() {
            if cpu.add_thread(thread).is_ok() {
                return Ok(());
            }
        }

        Err(SchedError::OutOfMemory)
    }

    /// Moves a thread out of scheduling: CAS `{Queued, Running, Waiting}
    /// → Suspended` and park it in the suspend set.
    pub fn suspend(&self, thread: &Shared<Thread>) -> Result<(), SchedError> {
        let mut state = ThreadState::Queued;
        loop {
            if thread.cmpxchg_state(&mut state, ThreadState::Suspended) {
                break;
            }

            match state {
                ThreadState::Suspended => break,
                ThreadState::Queued | ThreadState::Running | ThreadState::Waiting => continue,
                ThreadState::Finished | ThreadState::Orphaned => {
                    return Err(SchedError::Completed)
                }
            }
        }

        self.park_suspended(thread);
        Ok(())
    }

    /// The inverse: CAS `Suspended → Queued`, take the thread out of the
    /// suspend set, and put it back on a run queue.
    pub fn resume(&self, thread: &Shared<Thread>) -> Result<(), SchedError> {
        let mut state = ThreadState::Suspended;
        loop {
            if thread.cmpxchg_state(&mut state, ThreadState::Queued) {
                break;
            }

            match state {
                ThreadState::Suspended => break,
                // Already runnable somewhere.
                ThreadState::Queued | ThreadState::Running | ThreadState::Waiting => {
                    return Ok(())
                }
                ThreadState::Finished | ThreadState::Orphaned => {
                    return Err(SchedError::Completed)
                }
            }
        }

        let mut inner = self.inner.lock();
        self.unpark_locked(&mut inner, thread);
        Ok(())
    }

    /// Suspends the thread until `wake`, after which the next `tick`
    /// resumes it with status `Completed`.
    pub fn sleep(&self, thread: &Shared<Thread>, wake: Instant) -> Result<(), SchedError> {
        self.suspend(thread)?;

        self.inner.lock().sleep.push(Reverse(SleepEntry {
            wake,
            thread: thread.downgrade(),
        }));
        Ok(())
    }

    /// Parks the thread on `object`'s wait queue until the object is
    /// signalled or `timeout` passes.
    pub fn wait(
        &self,
        thread: &Shared<Thread>,
        object: ObjectKey,
        timeout: Instant,
    ) -> Result<(), SchedError> {
        self.suspend(thread)?;

        self.inner
            .lock()
            .waits
            .entry(object)
            .or_default()
            .push(Reverse(WaitEntry {
                timeout,
                thread: thread.downgrade(),
            }));
        Ok(())
    }

    /// Wakes every waiter of `object`: threads whose deadline has not yet
    /// passed get `Completed`, the rest `Timeout`.
    pub fn signal(&self, object: ObjectKey, now: Instant) -> Result<(), SchedError> {
        let mut inner = self.inner.lock();
        let Some(mut queue) = inner.waits.remove(&object) else {
            return Err(SchedError::NotFound);
        };

        while let Some(Reverse(entry)) = queue.pop() {
            if let Some(thread) = entry.thread.upgrade() {
                let status = if entry.timeout < now {
                    WaitStatus::Timeout
                } else {
                    WaitStatus::Completed
                };
                thread.set_signal_status(status);
                self.resume_locked(&mut inner, &thread);
            }
        }

        Ok(())
    }

    /// Periodic housekeeping: wakes expired sleepers (`Completed`) and
    /// expired waiters (`Timeout`), then garbage-collects terminal threads
    /// from the suspend set.
    pub fn tick(&self, now: Instant) {
        let mut inner = self.inner.lock();

        while let Some(Reverse(entry)) = inner.sleep.peek().cloned() {
            if entry.wake > now {
                break;
            }
            inner.sleep.pop();

            if let Some(thread) = entry.thread.upgrade() {
                thread.set_signal_status(WaitStatus::Completed);
                self.resume_locked(&mut inner, &thread);
            }
        }

        let keys: Vec<ObjectKey> = inner.waits.keys().copied().collect();
        for key in keys {
            let mut expired = Vec::new();
            let mut emptied = false;

            if let Some(queue) = inner.waits.get_mut(&key) {
                while let Some(Reverse(entry)) = queue.peek() {
                    if entry.timeout > now {
                        break;
                    }
                    expired.push(queue.pop().unwrap().0);
                }
                emptied = queue.is_empty();
            }
            if emptied {
                inner.waits.remove(&key);
            }

            for entry in expired {
                if let Some(thread) = entry.thread.upgrade() {
                    thread.set_signal_status(WaitStatus::Timeout);
                    self.resume_locked(&mut inner, &thread);
                }
            }
        }

        inner.suspended.retain(|weak| match weak.upgrade() {
            Some(thread) => !matches!(
                thread.state(),
                ThreadState::Queued | ThreadState::Finished | ThreadState::Orphaned
            ),
            None => false,
        });
    }

    /// Records a suspended thread. Called with the thread already CASed
    /// into `Suspended`.
    fn park_suspended(&self, thread: &Shared<Thread>) {
        self.inner.lock().suspended.insert(thread.downgrade());
    }

    /// Resumes a thread while already holding the inner lock: CAS it
    /// runnable and move it from the suspend set to a run queue.
    fn resume_locked(&self, inner: &mut SchedInner, thread: &Shared<Thread>) {
        let mut state = ThreadState::Suspended;
        loop {
            if thread.cmpxchg_state(&mut state, ThreadState::Queued) {
                break;
            }
            match state {
                ThreadState::Suspended => break,
                ThreadState::Queued | ThreadState::Running | ThreadState::Waiting => return,
                ThreadState::Finished | ThreadState::Orphaned => return,
            }
        }

        self.unpark_locked(inner, thread);
    }

    fn unpark_locked(&self, inner: &mut SchedInner, thread: &Shared<Thread>) {
        if inner.suspended.remove(&thread.downgrade()) {
            let _ = self.add_thread(thread);
        }
    }
}

impl Default for GlobalSchedule {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krcu::RcuDomain;

    fn domain() -> &'static RcuDomain {
        Box::leak(Box::new(RcuDomain::new()))
    }

    fn spawn(domain: &'static RcuDomain, name: &str) -> Shared<Thread> {
        Shared::new_intrusive(domain, Thread::new(name, RegisterSet::default()))
    }

    fn setup(cpus: u32) -> (&'static RcuDomain, GlobalSchedule) {
        let global = GlobalSchedule::new();
        for cpu in 0..cpus {
            global.init_cpu(cpu, 4);
        }
        (domain(), global)
    }

    #[test]
    fn reschedule_round_robin() {
        let (domain, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        let a = spawn(domain, "a");
        let b = spawn(domain, "b");
        global.add_thread(&a).unwrap();
        global.add_thread(&b).unwrap();

        assert!(cpu.reschedule(&global));
        assert!(cpu.current_thread().unwrap().ptr_eq(&a));
        assert_eq!(a.state(), ThreadState::Running);

        // Next step: a goes back to the queue, b runs.
        assert!(cpu.reschedule(&global));
        assert!(cpu.current_thread().unwrap().ptr_eq(&b));
        assert_eq!(a.state(), ThreadState::Queued);

        // And around again.
        assert!(cpu.reschedule(&global));
        assert!(cpu.current_thread().unwrap().ptr_eq(&a));
    }

    #[test]
    fn idle_when_empty() {
        let (_, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        assert!(!cpu.reschedule(&global));
        assert!(cpu.current_thread().is_none());
    }

    #[test]
    fn terminal_threads_are_dropped() {
        let (domain, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        let a = spawn(domain, "a");
        global.add_thread(&a).unwrap();
        assert!(cpu.reschedule(&global));

        a.set_terminal(ThreadState::Finished);

        // No other runnable thread and the current one is terminal.
        assert!(!cpu.reschedule(&global));
        assert!(cpu.current_thread().is_none());
    }

    #[test]
    fn schedule_next_context_switches_registers() {
        let (domain, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        let mut regs = RegisterSet::default();
        regs.rip = 0x1000;
        regs.rsp = 0x2000;
        let a = Shared::new_intrusive(domain, Thread::new("a", regs));
        global.add_thread(&a).unwrap();

        let boot_context = IsrContext::default();
        let (next, stack) = cpu.schedule_next_context(&global, &boot_context).unwrap();
        assert_eq!(next.rip, 0x1000);
        assert_eq!(next.rsp, 0x2000);
        assert_eq!(stack, a.kernel_stack_top());

        // With nothing else runnable, the interrupted context is kept.
        let mut running = IsrContext::default();
        running.rip = 0x1234;
        assert!(cpu.schedule_next_context(&global, &running).is_some());
    }

    #[test]
    fn balancer_prefers_least_loaded() {
        let (domain, global) = setup(2);

        let a = spawn(domain, "a");
        let b = spawn(domain, "b");
        global.add_thread(&a).unwrap();
        global.add_thread(&b).unwrap();

        // One task per CPU.
        assert_eq!(global.cpu(0).unwrap().tasks(), 1);
        assert_eq!(global.cpu(1).unwrap().tasks(), 1);
    }

    #[test]
    fn full_queues_fall_back_then_fail() {
        let (domain, global) = setup(2);

        // Capacity is 4 per CPU.
        let mut threads = Vec::new();
        for i in 0..8 {
            let t = spawn(domain, if i % 2 == 0 { "even" } else { "odd" });
            global.add_thread(&t).unwrap();
            threads.push(t);
        }

        let overflow = spawn(domain, "overflow");
        assert_eq!(global.add_thread(&overflow), Err(SchedError::OutOfMemory));
    }

    #[test]
    fn suspend_and_resume() {
        let (domain, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        let a = spawn(domain, "a");
        global.add_thread(&a).unwrap();

        global.suspend(&a).unwrap();
        assert_eq!(a.state(), ThreadState::Suspended);

        // A suspended thread is skipped by the scheduler.
        assert!(!cpu.reschedule(&global));

        global.resume(&a).unwrap();
        assert_eq!(a.state(), ThreadState::Queued);
        assert!(cpu.reschedule(&global));
        assert!(cpu.current_thread().unwrap().ptr_eq(&a));
    }

    #[test]
    fn sleep_wakes_at_instant() {
        let (domain, global) = setup(1);
        let cpu = global.cpu(0).unwrap();

        let a = spawn(domain, "a");
        global.add_thread(&a).unwrap();

        global.sleep(&a, 100).unwrap();
        assert_eq!(a.state(), ThreadState::Suspended);

        // Not yet.
        global.tick(99);
        assert_eq!(a.state(), ThreadState::Suspended);

        // Wake at or after the requested instant, with Completed status.
        global.tick(100);
        assert_eq!(a.state(), ThreadState::Queued);
        assert_eq!(a.signal_status(), WaitStatus::Completed);

        assert!(cpu.reschedule(&global));
        assert_eq!(a.state(), ThreadState::Running);
    }

    #[test]
    fn signal_separates_completed_from_timeout() {
        let (domain, global) = setup(1);

        let waiter = spawn(domain, "waiter");
        let late = spawn(domain, "late");
        global.add_thread(&waiter).unwrap();
        global.add_thread(&late).unwrap();

        let object = spawn(domain, "object");
        let key = ObjectKey::of(&object);

        global.wait(&waiter, key, 200).unwrap();
        global.wait(&late, key, 50).unwrap();

        // Signal at t=100: the deadline-200 waiter completes, the
        // deadline-50 waiter already timed out.
        global.signal(key, 100).unwrap();
        assert_eq!(waiter.signal_status(), WaitStatus::Completed);
        assert_eq!(late.signal_status(), WaitStatus::Timeout);
        assert_eq!(waiter.state(), ThreadState::Queued);
        assert_eq!(late.state(), ThreadState::Queued);

        // The queue is gone once signalled.
        assert_eq!(global.signal(key, 100), Err(SchedError::NotFound));
    }

    #[test]
    fn tick_expires_waiters() {
        let (domain, global) = setup(1);

        let a = spawn(domain, "a");
        global.add_thread(&a).unwrap();

        let object = spawn(domain, "object");
        let key = ObjectKey::of(&object);
        global.wait(&a, key, 10).unwrap();

        global.tick(11);
        assert_eq!(a.signal_status(), WaitStatus::Timeout);
        assert_eq!(a.state(), ThreadState::Queued);

        // The emptied queue was dropped.
        assert_eq!(global.signal(key, 11), Err(SchedError::NotFound));
    }

    #[test]
    fn tick_collects_terminal_suspended() {
        let (domain, global) = setup(1);

        let a = spawn(domain, "a");
        global.add_thread(&a).unwrap();
        global.suspend(&a).unwrap();

        a.set_terminal(ThreadState::Orphaned);
        global.tick(0);

        // Resuming a terminal thread reports completion.
        assert_eq!(global.resume(&a), Err(SchedError::Completed));
    }
}

// =============================================================================
// Basalt — Task Management
// =============================================================================
//
// Glue between the scheduler crate and the machine: the RCU domain and
// global schedule singletons, kernel-thread creation, the idle threads,
// and the preemption path the timer interrupt lands on.
// =============================================================================

use spin::Once;

use krcu::{RcuDomain, Shared};
use ksched::queue::DEFAULT_CAPACITY;
use ksched::{
    CpuId, GlobalSchedule, Instant, IsrContext, ObjectKey, RegisterSet, SchedError, Thread,
    ThreadState,
};

use crate::arch::gdt::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR};
use crate::arch::{cpu, local, smp};
use crate::sync::without_interrupts;
use crate::time;
use crate::util::events;

static DOMAIN: Once<RcuDomain> = Once::new();
static SCHEDULER: Once<GlobalSchedule> = Once::new();

/// Creates the domain and the global schedule. Once, on the BSP.
pub fn init() {
    DOMAIN.call_once(RcuDomain::new);
    SCHEDULER.call_once(GlobalSchedule::new);
}

/// The kernel's RCU domain.
pub fn domain() -> &'static RcuDomain {
    DOMAIN.get().expect("RCU domain not initialized")
}

/// The global schedule.
pub fn scheduler() -> &'static GlobalSchedule {
    SCHEDULER.get().expect("scheduler not initialized")
}

/// Registers a CPU with the scheduler and wires its per-CPU slot.
pub fn init_cpu(cpu_id: CpuId) {
    let scheduler = scheduler();
    scheduler.init_cpu(cpu_id, DEFAULT_CAPACITY);

    let schedule = scheduler.cpu(cpu_id).expect("cpu registered above");
    unsafe {
        local::set_schedule(cpu_id as usize, schedule);
    }
}

/// Builds a kernel thread that starts at `entry` on its own stack.
///
/// The thread is created `Queued` but not yet placed on any run queue.
pub fn create_kernel_thread(name: &str, entry: extern "C" fn() -> !) -> Shared<Thread> {
    let thread = Thread::new(name, RegisterSet::default());

    let regs = RegisterSet {
        rip: entry as usize as u64,
        rsp: thread.kernel_stack_top(),
        rflags: 0x202,
        cs: KERNEL_CODE_SELECTOR as u64,
        ss: KERNEL_DATA_SELECTOR as u64,
        ..RegisterSet::default()
    };
    thread.save_state(regs);

    Shared::new_intrusive(domain(), thread)
}

/// Creates a kernel thread and hands it to the balancer.
pub fn spawn(name: &str, entry: extern "C" fn() -> !) -> Result<Shared<Thread>, SchedError> {
    let thread = create_kernel_thread(name, entry);

    without_interrupts(|| scheduler().add_thread(&thread))?;

    events::schedule_task(events::ScheduleTask {
        thread_id: thread.id(),
        cpu: u32::MAX,
        tag: 0,
    });
    Ok(thread)
}

/// Pins one idle thread to every online CPU's run queue.
///
/// Idle threads never block and never exit, so every CPU always finds at
/// least one runnable thread.
pub fn spawn_idle_threads() {
    let scheduler = scheduler();

    for cpu_id in 0..smp::cpu_count() {
        let Some(schedule) = scheduler.cpu(cpu_id) else {
            continue;
        };

        let thread = create_kernel_thread("idle", idle_entry);
        schedule
            .add_thread(&thread)
            .expect("idle thread rejected by an empty queue");

        events::schedule_task(events::ScheduleTask {
            thread_id: thread.id(),
            cpu: cpu_id,
            tag: 0,
        });

        // Leak one strong reference: idle threads are permanent, and the
        // run queue only holds a weak one.
        core::mem::forget(thread);
    }
}

extern "C" fn idle_entry() -> ! {
    idle_loop()
}

/// Waits for work. The timer interrupt preempts out of the `hlt`.
pub fn idle_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
    }
}

/// Suspends `thread` until `wake`, through the sleep queue.
pub fn sleep(thread: &Shared<Thread>, wake: Instant) -> Result<(), SchedError> {
    without_interrupts(|| scheduler().sleep(thread, wake))
}

/// Parks `thread` on `object`'s wait queue until signalled or `timeout`.
pub fn wait(
    thread: &Shared<Thread>,
    object: ObjectKey,
    timeout: Instant,
) -> Result<(), SchedError> {
    without_interrupts(|| scheduler().wait(thread, object, timeout))
}

/// Wakes every waiter of `object`.
pub fn signal(object: ObjectKey) -> Result<(), SchedError> {
    without_interrupts(|| scheduler().signal(object, time::now()))
}

/// Marks the calling CPU's current thread terminal and gives up the CPU.
pub fn exit_current() -> ! {
    without_interrupts(|| {
        if let Some(schedule) = local::current().schedule() {
            if let Some(thread) = schedule.current_thread() {
                thread.set_terminal(ThreadState::Finished);
            }
        }
    });

    idle_loop()
}

/// The calling CPU's current thread, if the scheduler has dispatched one.
pub fn current_thread() -> Option<Shared<Thread>> {
    without_interrupts(|| local::current().schedule().and_then(|s| s.current_thread()))
}

/// Gives up the CPU by raising the scheduler interrupt.
///
/// A thread that just parked itself on a sleep or wait queue calls this to
/// hand control back instead of running out its slice.
pub fn yield_now() {
    unsafe {
        core::arch::asm!("int 0x20", options(nomem, nostack));
    }
}

// ── Boot exercise ───────────────────────────────────────────────
//
// Two short-lived threads that drive the sleep and wait paths once at
// boot, so a broken wake-up shows up on the serial log immediately.

static EXERCISE_OBJECT: Once<Shared<u64>> = Once::new();

fn exercise_key() -> ObjectKey {
    ObjectKey::of(EXERCISE_OBJECT.get().expect("exercise object missing"))
}

/// Spawns the boot exercise threads. Called after the idle threads exist.
pub fn spawn_boot_exercise() {
    EXERCISE_OBJECT.call_once(|| Shared::new(domain(), 0u64));

    spawn("exercise-waiter", waiter_entry).expect("spawning the waiter failed");
    spawn("exercise-sleeper", sleeper_entry).expect("spawning the sleeper failed");
}

/// Spins until the scheduler has handed this CPU a thread identity.
fn own_thread() -> Shared<Thread> {
    loop {
        if let Some(thread) = current_thread() {
            return thread;
        }
        core::hint::spin_loop();
    }
}

fn halt_until(ready: impl Fn() -> bool) {
    while !ready() {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
    }
}

extern "C" fn sleeper_entry() -> ! {
    let thread = own_thread();

    // Sleep 10 ms; the next tick past the deadline must wake us with
    // Completed status.
    thread.set_signal_status(ksched::WaitStatus::None);
    let wake = time::deadline_ms(10);
    sleep(&thread, wake).expect("sleep rejected");
    yield_now();
    halt_until(|| thread.signal_status() == ksched::WaitStatus::Completed);

    let now = time::now();
    assert!(now >= wake, "woke before the requested instant");
    log::info!("sleep exercise: woke on time");

    // Wake the waiter well before its deadline.
    signal(exercise_key()).expect("signal found no waiter");
    exit_current()
}

extern "C" fn waiter_entry() -> ! {
    let thread = own_thread();

    thread.set_signal_status(ksched::WaitStatus::None);
    let timeout = time::deadline_ms(1_000);
    wait(&thread, exercise_key(), timeout).expect("wait rejected");
    yield_now();
    halt_until(|| thread.signal_status() != ksched::WaitStatus::None);

    match thread.signal_status() {
        ksched::WaitStatus::Completed => log::info!("wait exercise: signalled in time"),
        status => panic!("wait exercise ended with {:?}", status),
    }
    exit_current()
}

/// The timer-interrupt half of the scheduler: runs the global tick on the
/// BSP, then asks the local schedule for a successor. When a switch
/// happens the FPU state follows the threads and the interrupted context
/// is replaced in place, so the interrupt return restores the next thread.
pub fn preempt(context: &mut IsrContext) {
    let Some(scheduler) = SCHEDULER.get() else {
        return;
    };

    let local = local::current();
    let Some(schedule) = local.schedule() else {
        return;
    };

    if local.core_id == 0 {
        if let Some(now) = time::try_now() {
            scheduler.tick(now);
        }
    }

    let old = schedule.current_thread();
    let Some((next, stack)) = schedule.schedule_next_context(scheduler, context) else {
        // Nobody else to run; the interrupted context resumes unchanged.
        return;
    };

    let new = schedule.current_thread();
    let switched = match (&old, &new) {
        (Some(old), Some(new)) => !old.ptr_eq(new),
        _ => true,
    };

    if switched {
        unsafe {
            if let Some(old) = &old {
                cpu::fxsave((*old.fpu_area()).as_mut_ptr());
            }
            if let Some(new) = &new {
                cpu::fxrstor((*new.fpu_area()).as_mut_ptr());
            }
        }
    }

    local.set_rsp0(stack);
    *context = next;
}

// =============================================================================
// Basalt — Clock and Tick Sources
// =============================================================================
//
// The PIT is the only timer with a known frequency, so it is both the
// early busy-wait reference and the calibration target for everything
// else: the APIC timer (which drives preemption) and the TSC (which, when
// invariant, becomes the system tick source). Calibration busy-loops
// against the PIT for 10 ms, ten times, and averages.
//
// The wall clock anchors the chosen tick source to one CMOS RTC reading
// taken at boot; `now()` projects the counter back onto the wall clock.
// =============================================================================

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use ksched::clock::{date_to_instant, DateTime};
use ksched::{Clock, ClockInfo, Instant, TickSourceKind};

use crate::arch::cpu;
use crate::sync::SpinLock;
use crate::traps;

/// Preemption time slice.
const TIME_SLICE_MS: u64 = 5;

/// Calibration: ten rounds of ten milliseconds against the PIT.
const TRAIN_ROUND_US: u64 = 10_000;
const TRAIN_ROUNDS: u64 = 10;

/// Accumulates PIT down-counter wraps into a monotonic count.
struct PitAccumulator {
    last: u16,
    total: u64,
}

/// One of the hardware counters behind the clock. The closed set is a
/// plain enum; adding a source means adding a variant.
pub enum TickSource {
    Pit(SpinLock<PitAccumulator>),
    /// Main-counter MMIO base and tick period in femtoseconds. Never
    /// built here: discovering the HPET needs the firmware tables, which
    /// are another subsystem's job.
    #[allow(dead_code)]
    Hpet { base: u64, period_fs: u64 },
    /// The calibrated local APIC timer; a per-CPU countdown rather than a
    /// clock, kept for completeness.
    #[allow(dead_code)]
    Apic { frequency: u64 },
    Tsc { frequency: u64 },
}

impl TickSource {
    pub fn kind(&self) -> TickSourceKind {
        match self {
            TickSource::Pit(_) => TickSourceKind::Pit,
            TickSource::Hpet { .. } => TickSourceKind::Hpet,
            TickSource::Apic { .. } => TickSourceKind::Apic,
            TickSource::Tsc { .. } => TickSourceKind::Tsc,
        }
    }

    pub fn frequency(&self) -> u64 {
        match self {
            TickSource::Pit(_) => khal::pit::BASE_FREQUENCY_HZ,
            TickSource::Hpet { period_fs, .. } => 1_000_000_000_000_000 / period_fs,
            TickSource::Apic { frequency } => *frequency,
            TickSource::Tsc { frequency } => *frequency,
        }
    }

    pub fn ticks(&self) -> u64 {
        match self {
            TickSource::Pit(accumulator) => {
                let mut accumulator = accumulator.lock();
                let current = khal::pit::read_count();
                // The counter runs down and wraps at 0x10000.
                let delta = accumulator.last.wrapping_sub(current);
                accumulator.last = current;
                accumulator.total += delta as u64;
                accumulator.total
            }
            TickSource::Hpet { base, .. } => unsafe {
                core::ptr::read_volatile((*base + 0xF0) as *const u64)
            },
            TickSource::Apic { .. } => (u32::MAX - khal::apic::current_count()) as u64,
            TickSource::Tsc { .. } => cpu::rdtsc(),
        }
    }
}

static TICK_SOURCE: Once<TickSource> = Once::new();
static CLOCK: Once<Clock> = Once::new();
static APIC_HZ: AtomicU64 = AtomicU64::new(0);

/// Busy-waits for `us` microseconds against the PIT.
///
/// Usable from the first moment the PIT is programmed; does not touch the
/// scheduler.
pub fn busy_sleep_us(us: u64) {
    let target = us * khal::pit::BASE_FREQUENCY_HZ / 1_000_000;
    let mut elapsed: u64 = 0;
    let mut last = khal::pit::read_count();

    while elapsed < target {
        core::hint::spin_loop();
        let current = khal::pit::read_count();
        elapsed += last.wrapping_sub(current) as u64;
        last = current;
    }
}

/// Measures the APIC timer frequency against the PIT.
fn train_apic_timer() -> u64 {
    let mut total: u64 = 0;

    for _ in 0..TRAIN_ROUNDS {
        khal::apic::start_calibration(khal::apic::TimerDivide::By1);
        let before = khal::apic::current_count();
        busy_sleep_us(TRAIN_ROUND_US);
        let after = khal::apic::current_count();
        total += (before - after) as u64;
    }

    // Ticks per round, scaled from 10 ms to one second.
    (total / TRAIN_ROUNDS) * (1_000_000 / TRAIN_ROUND_US)
}

/// Measures the invariant TSC frequency against the PIT.
fn train_invariant_tsc() -> u64 {
    let mut total: u64 = 0;

    for _ in 0..TRAIN_ROUNDS {
        let before = cpu::rdtsc();
        busy_sleep_us(TRAIN_ROUND_US);
        total += cpu::rdtsc() - before;
    }

    (total / TRAIN_ROUNDS) * (1_000_000 / TRAIN_ROUND_US)
}

/// Calibrates the timers and anchors the wall clock.
///
/// Runs once on the bootstrap processor, after the APIC is enabled and
/// before the scheduler needs deadlines.
pub fn init() {
    khal::pit::set_divisor(0);

    let apic_hz = train_apic_timer();
    APIC_HZ.store(apic_hz, Ordering::Release);
    log::info!("APIC timer: {} Hz", apic_hz);

    let source = if cpu::has_invariant_tsc() {
        let tsc_hz = train_invariant_tsc();
        log::info!("invariant TSC: {} Hz", tsc_hz);
        TickSource::Tsc { frequency: tsc_hz }
    } else {
        log::warn!("no invariant TSC; clock falls back to the PIT");
        let last = khal::pit::read_count();
        TickSource::Pit(SpinLock::new(PitAccumulator { last, total: 0 }))
    };

    let rtc = khal::cmos::read_date();
    let start = DateTime {
        year: rtc.year,
        month: rtc.month,
        day: rtc.day,
        hour: rtc.hour,
        minute: rtc.minute,
        second: rtc.second,
    };

    let start_ticks = source.ticks();
    let clock = Clock::new(source.kind(), source.frequency(), start, start_ticks);

    log::info!(
        "clock: {} at {} Hz, boot time {}",
        clock.display_name(),
        clock.frequency(),
        date_to_instant(start),
    );

    TICK_SOURCE.call_once(|| source);
    CLOCK.call_once(|| clock);
}

/// The current instant, if the clock is up.
pub fn try_now() -> Option<Instant> {
    let clock = CLOCK.get()?;
    let source = TICK_SOURCE.get()?;
    Some(clock.time(source.ticks()))
}

/// The current instant. Panics before `init`.
pub fn now() -> Instant {
    try_now().expect("clock queried before initialization")
}

/// An instant `millis` milliseconds from now.
pub fn deadline_ms(millis: i64) -> Instant {
    now() + millis * (ksched::clock::TICKS_PER_SECOND / 1_000)
}

/// Clock description for the stat surface.
pub fn stat() -> Option<ClockInfo> {
    CLOCK.get().map(Clock::stat)
}

/// Arms the calling core's periodic preemption interrupt: one timer IRQ
/// every `TIME_SLICE_MS` milliseconds.
pub fn start_preemption_timer() {
    let apic_hz = APIC_HZ.load(Ordering::Acquire);
    debug_assert!(apic_hz != 0, "preemption armed before calibration");

    let initial_count = (apic_hz * TIME_SLICE_MS / 1_000) as u32;
    khal::apic::start_timer(
        traps::TIMER_VECTOR,
        khal::apic::TimerDivide::By1,
        initial_count,
    );
}

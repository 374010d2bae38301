//! Wall-clock projection over a hardware tick counter.
//!
//! The kernel records one wall-clock date (from the battery-backed RTC)
//! and the tick count of its chosen source at the same moment; every later
//! `time` query projects the elapsed ticks back onto the wall clock using
//! the source's frequency. Instants count 100 ns units since the
//! Gregorian reform (1582-10-15), matching the resolution timeouts and
//! wake deadlines are expressed in.

use alloc::string::String;

/// A point in time: 100 ns units since 1582-10-15.
pub type Instant = i64;

/// 100 ns units per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// The hardware counters a clock can run on. The set is closed, so the
/// kernel dispatches over a plain enum rather than a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSourceKind {
    Pit,
    Hpet,
    Apic,
    Tsc,
}

impl TickSourceKind {
    pub fn display_name(self) -> &'static str {
        match self {
            TickSourceKind::Pit => "Programmable Interval Timer",
            TickSourceKind::Hpet => "High Precision Event Timer",
            TickSourceKind::Apic => "Local APIC Timer",
            TickSourceKind::Tsc => "Invariant TSC",
        }
    }
}

/// A calendar date and time, as read from the RTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Days from civil date to the 1970-01-01 epoch (Howard Hinnant's
/// `days_from_civil`), used to anchor dates without floating point.
fn days_from_civil(year: i32, month: u8, day: u8) -> i64 {
    let y = if month <= 2 { year - 1 } else { year } as i64;
    let m = month as i64;
    let d = day as i64;

    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;

    era * 146_097 + doe - 719_468
}

/// Days between the Gregorian reform and the Unix epoch.
const REFORM_TO_EPOCH_DAYS: i64 = 141_427;

/// Converts an RTC reading to an [`Instant`].
pub fn date_to_instant(date: DateTime) -> Instant {
    let days = days_from_civil(date.year, date.month, date.day) + REFORM_TO_EPOCH_DAYS;
    let seconds = days * 86_400
        + date.hour as i64 * 3_600
        + date.minute as i64 * 60
        + date.second as i64;

    seconds * TICKS_PER_SECOND
}

/// Clock description returned by [`Clock::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockInfo {
    pub frequency_hz: u64,
    pub boot_time: Instant,
    pub display_name: [u8; 32],
}

/// Projects a tick counter onto the wall clock.
pub struct Clock {
    kind: TickSourceKind,
    frequency: u64,
    start_date: Instant,
    start_ticks: u64,
}

impl Clock {
    /// Anchors the clock: `start` and `start_ticks` were observed at the
    /// same moment, and the source advances at `frequency` Hz.
    pub fn new(kind: TickSourceKind, frequency: u64, start: DateTime, start_ticks: u64) -> Self {
        debug_assert!(frequency > 0);
        Self {
            kind,
            frequency,
            start_date: date_to_instant(start),
            start_ticks,
        }
    }

    /// The wall-clock instant corresponding to a current tick reading.
    pub fn time(&self, ticks: u64) -> Instant {
        let elapsed = ticks.wrapping_sub(self.start_ticks);
        let nanos = (elapsed as u128 * 1_000_000_000) / self.frequency as u128;
        self.start_date + (nanos / 100) as Instant
    }

    /// A deadline `millis` milliseconds after the given tick reading.
    pub fn deadline_after_ms(&self, ticks: u64, millis: i64) -> Instant {
        self.time(ticks) + millis * (TICKS_PER_SECOND / 1_000)
    }

    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    pub fn kind(&self) -> TickSourceKind {
        self.kind
    }

    pub fn stat(&self) -> ClockInfo {
        let mut display_name = [0u8; 32];
        let name = self.kind.display_name().as_bytes();
        let len = name.len().min(display_name.len());
        display_name[..len].copy_from_slice(&name[..len]);

        ClockInfo {
            frequency_hz: self.frequency,
            boot_time: self.start_date,
            display_name,
        }
    }

    /// The display name as text, for log output.
    pub fn display_name(&self) -> String {
        String::from(self.kind.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_day_anchors() {
        // Known anchors for the civil-date algorithm.
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(1970, 1, 2), 1);
        assert_eq!(days_from_civil(1969, 12, 31), -1);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        // The Gregorian reform date sits exactly the epoch offset back.
        assert_eq!(days_from_civil(1582, 10, 15), -REFORM_TO_EPOCH_DAYS);
    }

    #[test]
    fn date_conversion_is_monotonic() {
        let earlier = DateTime {
            year: 2024,
            month: 6,
            day: 1,
            hour: 12,
            minute: 0,
            second: 0,
        };
        let later = DateTime {
            year: 2024,
            month: 6,
            day: 1,
            hour: 12,
            minute: 0,
            second: 1,
        };

        let delta = date_to_instant(later) - date_to_instant(earlier);
        assert_eq!(delta, TICKS_PER_SECOND);
    }

    #[test]
    fn projection_scales_with_frequency() {
        let start = DateTime {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let clock = Clock::new(TickSourceKind::Tsc, 1_000_000, start, 500);

        // One million ticks at 1 MHz is one second.
        let t0 = clock.time(500);
        let t1 = clock.time(1_000_500);
        assert_eq!(t1 - t0, TICKS_PER_SECOND);

        // Sub-second resolution holds too: 1000 ticks is a millisecond.
        let ms = clock.time(1_500) - t0;
        assert_eq!(ms, TICKS_PER_SECOND / 1_000);
    }

    #[test]
    fn deadline_math() {
        let start = DateTime {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let clock = Clock::new(TickSourceKind::Apic, 100_000_000, start, 0);

        let now = clock.time(0);
        assert_eq!(
            clock.deadline_after_ms(0, 10) - now,
            10 * TICKS_PER_SECOND / 1_000
        );
    }

    #[test]
    fn stat_reports_source() {
        let start = DateTime {
            year: 2024,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let clock = Clock::new(TickSourceKind::Pit, 1_193_182, start, 0);

        let info = clock.stat();
        assert_eq!(info.frequency_hz, 1_193_182);
        assert_eq!(info.boot_time, date_to_instant(start));
        assert!(info
            .display_name
            .starts_with(b"Programmable Interval Timer"));
    }
}

// =============================================================================
// Basalt — Kernel Logger
// =============================================================================
//
// Two output paths share the COM1 UART:
//
//   kprint!/kprintln!  : raw formatted output, usable from the first
//                        instruction of kmain, before anything is set up.
//   log::{info!, ...}  : the `log` facade, installed once during boot,
//                        with per-level ANSI colors.
//
// The UART lock is taken per call with interrupts masked, so a whole
// message is written atomically even when cores and interrupt handlers
// log at once; ordering between cores is whatever the lock decides.
// =============================================================================

use core::fmt;
use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record};

use crate::sync::without_interrupts;

/// Internal sink for the kprint macros. Not called directly.
#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments) {
    without_interrupts(|| {
        let mut serial = khal::serial::COM1.lock();
        let _ = serial.write_fmt(args);
    });
}

/// Prints formatted text to the serial console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::util::logger::_kprint(format_args!($($arg)*))
    };
}

/// Prints formatted text followed by a newline to the serial console.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

struct SerialLogger;

impl SerialLogger {
    fn color(level: Level) -> &'static str {
        match level {
            Level::Trace => "\x1b[90m",
            Level::Debug => "\x1b[36m",
            Level::Info => "\x1b[32m",
            Level::Warn => "\x1b[33m",
            Level::Error => "\x1b[31m",
        }
    }
}

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        without_interrupts(|| {
            let mut serial = khal::serial::COM1.lock();
            let _ = write!(
                serial,
                "{}[{:>5}]\x1b[0m {}\n",
                Self::color(record.level()),
                record.level(),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the serial logger. Called once, right after the UARTs are up.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(LevelFilter::Debug);
}

// =============================================================================
// Basalt — Bug Check
// =============================================================================
//
// The single unrecoverable-failure path. Invariant violations and panics
// land here: interrupts are cut, the site and message are logged together
// with the last stack frames, and the CPU halts. Nothing is ever caught.
// =============================================================================

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::kprintln;

/// Guards against a panic inside the panic path.
static IN_BUG_CHECK: AtomicBool = AtomicBool::new(false);

/// Most stack frames printed by the backtrace.
const MAX_FRAMES: usize = 16;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::sync::spinlock::disable_interrupts();

    if IN_BUG_CHECK.swap(true, Ordering::SeqCst) {
        halt();
    }

    kprintln!();
    kprintln!("==================== BUG CHECK ====================");
    if let Some(location) = info.location() {
        kprintln!("at {}:{}", location.file(), location.line());
    }
    kprintln!("{}", info.message());

    kprintln!("backtrace:");
    backtrace();
    kprintln!("===================================================");

    halt()
}

/// Walks the RBP chain and prints return addresses.
///
/// Frame pointers are only present where the compiler kept them, so the
/// walk stops at the first implausible pointer.
fn backtrace() {
    let mut rbp: u64;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
    }

    for index in 0..MAX_FRAMES {
        if rbp == 0 || rbp % 8 != 0 || rbp < 0xFFFF_8000_0000_0000 {
            break;
        }

        // SAFETY: the bounds check above keeps the reads inside the
        // higher half; a stale frame pointer at worst ends the walk.
        let (next, ret) = unsafe {
            let frame = rbp as *const u64;
            (*frame, *frame.add(1))
        };

        if ret < 0xFFFF_8000_0000_0000 {
            break;
        }

        kprintln!("  #{:02}: {:#018X}", index, ret);
        rbp = next;
    }
}

fn halt() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli; hlt", options(nomem, nostack));
        }
    }
}

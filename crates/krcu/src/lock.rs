//! The short lock around generation replacement.
//!
//! Both readers entering a critical section and deferred releases run
//! through this lock, and deferred releases happen wherever a handle is
//! dropped, interrupt handlers included. On bare metal the lock
//! therefore masks interrupts for its few-instruction hold, or a handler
//! interrupting a holder on the same CPU would spin forever. Hosted test
//! builds have no interrupts to mask and use the plain lock.

use spin::{Mutex, MutexGuard};

pub struct SwapLock {
    inner: Mutex<()>,
}

/// Restores the interrupt flag when dropped. Declared after the mutex
/// guard in [`SwapGuard`], so the lock is released before interrupts come
/// back on.
#[cfg(target_os = "none")]
struct IrqRestore {
    enable: bool,
}

#[cfg(target_os = "none")]
impl Drop for IrqRestore {
    fn drop(&mut self) {
        if self.enable {
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack));
            }
        }
    }
}

pub struct SwapGuard<'a> {
    _inner: MutexGuard<'a, ()>,
    #[cfg(target_os = "none")]
    _irq: IrqRestore,
}

impl SwapLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    #[cfg(target_os = "none")]
    pub fn lock(&self) -> SwapGuard<'_> {
        let rflags: u64;
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) rflags,
                options(nomem, preserves_flags)
            );
        }

        SwapGuard {
            _inner: self.inner.lock(),
            _irq: IrqRestore {
                enable: rflags & (1 << 9) != 0,
            },
        }
    }

    #[cfg(not(target_os = "none"))]
    pub fn lock(&self) -> SwapGuard<'_> {
        SwapGuard {
            _inner: self.inner.lock(),
        }
    }
}

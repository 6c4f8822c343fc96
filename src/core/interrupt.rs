//! Operator interrupt (SIGINT, SIGTERM) tracking.
//!
//! The handler only flips a flag. Long-running children poll it and are killed,
//! then the ordinary error path unwinds every guard (locks, services, partial files).

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the handler for SIGINT and SIGTERM (CI cancellation). Safe to call
/// more than once.
pub fn install_handler() {
    #[cfg(unix)]
    for signal in [libc::SIGINT, libc::SIGTERM] {
        unsafe {
            libc::signal(
                signal,
                on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }
    }
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Fail with `process.interrupted` if an interrupt has been received.
pub fn check(context: &str) -> Result<()> {
    if is_interrupted() {
        Err(Error::interrupted(context))
    } else {
        Ok(())
    }
}

/// Clear the flag so rollback subprocesses can run after an interrupted stage.
pub fn clear() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

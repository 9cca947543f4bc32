//! Signal handling and error-path teardown.
//!
//! The installed handler only records the signal number. Blocking waits poll
//! [`check_pending`] and unwind with [`ControlError::Interrupted`]; the
//! dispatch loop then restores default dispositions, tears the testbed down
//! and re-raises the signal so the process ends with the conventional status.

use std::{
    io::Write,
    sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

use anyhow::anyhow;
use tracing::debug;

use crate::{ControlError, ControlResult, Session, TestbedBackend};

pub const HANDLED_SIGNALS: [libc::c_int; 4] =
    [libc::SIGHUP, libc::SIGTERM, libc::SIGINT, libc::SIGPIPE];

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

fn record_signal(slot: &AtomicI32, signum: libc::c_int) {
    // Keep the first signal; a repeat before teardown must not mask it.
    let _ = slot.compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
}

extern "C" fn handle_signal(signum: libc::c_int) {
    record_signal(&PENDING_SIGNAL, signum);
}

/// Install the recording handler for every signal in [`HANDLED_SIGNALS`].
///
/// `SA_RESTART` stays unset: a blocked read must return
/// `EINTR` so the dispatch loop sees the pending signal.
pub fn install_handlers() -> anyhow::Result<()> {
    for signum in HANDLED_SIGNALS {
        // SAFETY: the handler only touches an atomic, which is async-signal-safe.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(anyhow!(
                "failed to install handler for signal {signum}: {}",
                std::io::Error::last_os_error()
            ));
        }
    }
    HANDLERS_INSTALLED.store(true, Ordering::SeqCst);
    debug!("installed handlers for signals {HANDLED_SIGNALS:?}");
    Ok(())
}

/// Reset handled signals to their default disposition, so a repeated signal
/// kills the process outright. No-op unless [`install_handlers`] ran.
pub fn restore_default_handlers() {
    if !HANDLERS_INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }
    for signum in HANDLED_SIGNALS {
        // SAFETY: resetting a disposition to SIG_DFL has no memory effects.
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
        }
    }
}

pub fn pending_signal() -> Option<i32> {
    match PENDING_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

pub fn take_pending_signal() -> Option<i32> {
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        signum => Some(signum),
    }
}

pub fn check_pending() -> ControlResult<()> {
    match pending_signal() {
        Some(signal) => Err(ControlError::Interrupted { signal }),
        None => Ok(()),
    }
}

/// Block `SIGPIPE` for the calling thread so writes into a closed pipe fail
/// with `EPIPE` instead of being mistaken for a driver-side broken pipe.
pub fn block_sigpipe_in_current_thread() {
    // SAFETY: manipulates only the calling thread's signal mask.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Deliver `signal` to ourselves with the default disposition in place.
pub fn reraise(signal: i32) {
    restore_default_handlers();
    // SAFETY: plain libc calls on our own process.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// Tear the testbed down on the way out of a failed session.
///
/// Never propagates: a structured failure is written as its message, anything
/// else as an unexpected cleanup error with the full chain, followed by a note
/// that the teardown itself was caused by another error.
pub fn teardown_after_error(
    session: &mut Session,
    backend: &mut dyn TestbedBackend,
    errors: &mut dyn Write,
) {
    restore_default_handlers();
    let failure = match session.teardown(backend) {
        Ok(()) => return,
        Err(error) => error,
    };
    match &failure {
        ControlError::Quit { message, .. } => {
            let _ = writeln!(errors, "{message}");
        }
        other => {
            let _ = writeln!(errors, "Unexpected cleanup error:\n{other:?}\n");
        }
    }
    let _ = writeln!(errors, "while cleaning up because of another error:");
}

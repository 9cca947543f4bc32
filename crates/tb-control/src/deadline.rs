//! Cancellable deadlines for blocking waits.
//!
//! A [`Deadline`] is a plain value: it is armed by construction and disarmed
//! by going out of scope, so nested scopes cannot clobber each other. Waits
//! are performed in short slices so that both expiry and a pending handled
//! signal are noticed promptly; a signal is never reported as a timeout.

use std::{
    process::{Child, ExitStatus},
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::debug;
use wait_timeout::ChildExt;

use crate::{signals, ControlError, ControlResult};

pub const WAIT_POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Self { expires_at: None }
    }

    /// Zero seconds means no deadline.
    pub fn after_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::none()
        } else {
            Self::after(Duration::from_secs(secs))
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + duration),
        }
    }

    /// Combine with a nested limit; the earlier expiry wins.
    pub fn narrow(self, inner: Deadline) -> Self {
        match (self.expires_at, inner.expires_at) {
            (Some(outer), Some(inner)) => Self {
                expires_at: Some(outer.min(inner)),
            },
            (Some(outer), None) => Self {
                expires_at: Some(outer),
            },
            (None, inner) => Self { expires_at: inner },
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.expires_at.is_none()
    }

    /// `None` when unbounded, `Some(Duration::ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    /// Fail with `Interrupted` for a pending signal, then `Timeout` on expiry.
    pub fn check(&self) -> ControlResult<()> {
        signals::check_pending()?;
        if self.is_expired() {
            return Err(ControlError::Timeout);
        }
        Ok(())
    }

    fn next_slice(&self) -> ControlResult<Duration> {
        match self.remaining() {
            None => Ok(WAIT_POLL_SLICE),
            Some(remaining) if remaining.is_zero() => Err(ControlError::Timeout),
            Some(remaining) => Ok(remaining.min(WAIT_POLL_SLICE)),
        }
    }

    /// Wait for `child` to exit. The caller owns the child and must kill and
    /// reap it when this returns an error.
    pub fn wait_child(&self, child: &mut Child) -> ControlResult<ExitStatus> {
        loop {
            signals::check_pending()?;
            let slice = self.next_slice()?;
            if let Some(status) = child
                .wait_timeout(slice)
                .context("failed while waiting for child process")?
            {
                return Ok(status);
            }
        }
    }

    /// Receive the next value from `receiver`, bounded like
    /// [`Deadline::wait_child`].
    pub fn recv<T>(&self, receiver: &Receiver<T>) -> ControlResult<T> {
        loop {
            signals::check_pending()?;
            let slice = self.next_slice()?;
            match receiver.recv_timeout(slice) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("channel closed before a value arrived").into())
                }
            }
        }
    }

    /// Sleep for `duration`, waking early on expiry or a pending signal.
    pub fn sleep(&self, duration: Duration) -> ControlResult<()> {
        let wake_at = Instant::now() + duration;
        loop {
            self.check()?;
            let left = wake_at.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            std::thread::sleep(left.min(self.next_slice()?));
        }
    }
}

/// Run `body` under a fresh deadline of `secs` seconds (zero: unbounded).
pub fn run_with_deadline<T>(
    secs: u64,
    body: impl FnOnce(Deadline) -> ControlResult<T>,
) -> ControlResult<T> {
    run_within(Deadline::none(), secs, body)
}

/// Like [`run_with_deadline`], but never extends the enclosing `outer` limit.
pub fn run_within<T>(
    outer: Deadline,
    secs: u64,
    body: impl FnOnce(Deadline) -> ControlResult<T>,
) -> ControlResult<T> {
    let deadline = outer.narrow(Deadline::after_secs(secs));
    let result = body(deadline);
    if matches!(result, Err(ControlError::Timeout)) {
        debug!("deadline of {secs}s expired");
    }
    result
}

/// Force-kill and reap `child`, ignoring failures from an already-exited one.
pub fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

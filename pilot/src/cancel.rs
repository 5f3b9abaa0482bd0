//! Cooperative cancellation shared by the CLI, the engine, and executors.
//!
//! The interrupt handler only calls [`CancelToken::cancel`]. Everything else
//! polls: the engine checks the token at every step, loop item, and round;
//! executors check it between output reads and terminate their subprocess
//! group when it fires; [`CancelToken::sleep`] wakes up immediately.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::PipelineError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every sleeper.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail with [`PipelineError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }

    /// Block for `duration` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        assert!(!token.sleep(Duration::from_millis(1)));
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        let err = token.check().expect_err("cancelled");
        assert!(crate::error::is_cancelled(&err));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        assert!(token.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().expect("join");
    }
}

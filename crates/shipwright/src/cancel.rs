//! Cooperative cancellation and the bounded build semaphore.
//!
//! A [`CancelToken`] carries an optional deadline and an explicit cancel
//! flag; child tokens chain to their parent so a per-build timeout can ride
//! on top of the overall run timeout. Cancellation is cooperative: blocking
//! waits re-check the token periodically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::ReleaseError;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    cause: Mutex<Option<String>>,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

/// Cancellation token tied to the configured timeout. Cloning is cheap and
/// all clones observe the same cancel flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// A token that never expires on its own.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout), None)
    }

    /// A child token: cancelled when the parent is, or when its own
    /// (tighter) timeout elapses.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self::build(timeout.map(|t| Instant::now() + t), Some(self.clone()))
    }

    fn build(deadline: Option<Instant>, parent: Option<CancelToken>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                cause: Mutex::new(None),
                deadline,
                parent,
            }),
        }
    }

    /// Explicitly cancel, recording a cause delivered with the error.
    pub fn cancel(&self, cause: &str) {
        {
            let mut slot = self.inner.cause.lock().expect("cause lock poisoned");
            if slot.is_none() {
                *slot = Some(cause.to_string());
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return true;
        }
        if let Some(parent) = &self.inner.parent {
            return parent.is_cancelled();
        }
        false
    }

    /// The cancellation cause, synthesizing "timeout" for deadline expiry.
    pub fn cause(&self) -> String {
        if let Some(cause) = self.inner.cause.lock().expect("cause lock poisoned").clone() {
            return cause;
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return "timeout exceeded".to_string();
        }
        if let Some(parent) = &self.inner.parent {
            return parent.cause();
        }
        "cancelled".to_string()
    }

    /// Suspension-point check: `Err(Cancelled)` once the token has tripped.
    pub fn checkpoint(&self) -> Result<(), ReleaseError> {
        if self.is_cancelled() {
            Err(ReleaseError::Cancelled(self.cause()))
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded counting semaphore capping concurrent builders. Waiters re-check
/// the cancellation token every poll interval and return `Cancelled` rather
/// than proceed.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

const ACQUIRE_POLL: Duration = Duration::from_millis(50);

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(&self, token: &CancelToken) -> Result<SemaphorePermit<'_>, ReleaseError> {
        let mut available = self.permits.lock().expect("semaphore lock poisoned");
        loop {
            token.checkpoint()?;
            if *available > 0 {
                *available -= 1;
                return Ok(SemaphorePermit { sem: self });
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(available, ACQUIRE_POLL)
                .expect("semaphore lock poisoned");
            available = guard;
        }
    }

    fn release(&self) {
        let mut available = self.permits.lock().expect("semaphore lock poisoned");
        *available += 1;
        self.cv.notify_one();
    }
}

/// RAII permit; releases its slot on drop.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

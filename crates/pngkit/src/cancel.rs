//! Cooperative cancellation for long-running quantization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable flag shared between the caller and a running compression.
///
/// Cancelling is sticky: once set, every clone reports cancelled.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Why a [`Watchdog`] asked the quantizer to stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

/// A cancel token paired with an optional deadline.
///
/// This is what the quantizer polls from its progress callback and between
/// pipeline stages.
#[derive(Clone, Debug)]
pub struct Watchdog {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl Watchdog {
    pub fn new(token: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    /// A watchdog that never fires.
    pub fn unbounded() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn check(&self) -> Option<StopReason> {
        if self.token.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.check().is_some()
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

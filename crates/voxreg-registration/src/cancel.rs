//! Cooperative cancellation for long-running estimation.
//!
//! Estimators check a [`CancellationToken`] between optimizer iterations,
//! between pyramid levels and while waiting on inference. A token is
//! cancelled when its own flag is set, its deadline has passed, or any
//! ancestor token is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RegistrationError, Result};

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancellationToken>,
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones share the same flag. Children observe their parent but cancelling
/// a child never affects the parent or its siblings.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A token that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline), None)
    }

    /// A token that expires `timeout` from now.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout), None)
    }

    fn build(deadline: Option<Instant>, parent: Option<CancellationToken>) -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    /// A child token that also observes this token.
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    /// A child token with its own deadline `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Instant::now().checked_add(timeout), Some(self.clone()))
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.state.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.state.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.state.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Earliest deadline along the ancestor chain.
    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.state.parent.as_ref().and_then(|p| p.deadline());
        match (self.state.deadline, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Time left before the earliest deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Cancelled)` if the token is cancelled.
    ///
    /// `stage` names where the check happened and ends up in the error message.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(RegistrationError::cancelled(format!("cancelled during {}", stage)))
        } else {
            Ok(())
        }
    }
}

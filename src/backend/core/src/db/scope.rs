//! Per-request cancellation and deadlines for store operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Result, StackerError};

/// Cancellation token plus optional deadline that bounds store operations.
///
/// A scope is cheap to clone; clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    /// A scope that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child scope: cancelled with its parent, or on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Bound the scope by `timeout` from now. An earlier deadline already set wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Guard that cancels the scope when dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Run `fut` within the scope.
    ///
    /// The future is dropped as soon as the scope is cancelled or its deadline
    /// passes. Writes run inside transactions, so a dropped write rolls back.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(StackerError::cancelled());
        }
        if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
            return Err(StackerError::deadline_exceeded());
        }

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| StackerError::deadline_exceeded())?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StackerError::cancelled()),
            res = bounded => res,
        }
    }
}

//! Login rate limiting.
//!
//! Login is the expensive call on an unauthenticated connection (store
//! lookup, hashing, macaroon verification), so the number of logins in
//! flight across the whole server is bounded by a counting semaphore.
//! Waiters are admitted in FIFO order.
//!
//! # Invariants
//!
//! - [INV-RL-001] At most `limit` [`LoginSlot`]s exist at any time.
//! - [INV-RL-002] A slot is released when dropped, whether the login
//!   succeeded, failed, or panicked.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ApiError;

/// Bounds concurrently in-flight logins.
#[derive(Debug, Clone)]
pub struct LoginRateLimiter {
    slots: Arc<Semaphore>,
    limit: usize,
}

/// A held login slot; releasing it admits the next waiter.
#[derive(Debug)]
pub struct LoginSlot {
    _permit: OwnedSemaphorePermit,
}

impl LoginRateLimiter {
    /// Creates a limiter admitting `limit` concurrent logins.
    ///
    /// A limit of zero is raised to one; configuration validation rejects it
    /// earlier.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Returns the configured limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] if `cancel` fires first (the
    /// connection is being torn down).
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<LoginSlot, ApiError> {
        if self.slots.available_permits() == 0 {
            debug!(limit = self.limit, "login slots exhausted, waiting");
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ApiError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .map(|permit| LoginSlot { _permit: permit })
                .map_err(|_| ApiError::Cancelled),
        }
    }
}

//! Bounded leasing of sandbox capacity.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool error.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("sandbox pool closed")]
    Closed,
}

/// A held sandbox slot. Dropping the lease returns the slot to the pool.
pub struct SandboxLease {
    _permit: OwnedSemaphorePermit,
}

/// Sandboxes are a leased, finite resource. Admission control consults
/// `available()` so new sessions are refused when no slot is free, rather
/// than oversubscribing the execution environment.
#[derive(Clone)]
pub struct SandboxPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SandboxPool {
    /// Create a pool with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Total slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a slot without waiting, or `None` when the pool is exhausted.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SandboxLease> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| SandboxLease { _permit: permit })
    }

    /// Wait for a slot.
    ///
    /// # Errors
    /// Returns `Closed` if the pool was shut down.
    pub async fn acquire(&self) -> Result<SandboxLease, PoolError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map(|permit| SandboxLease { _permit: permit })
            .map_err(|_| PoolError::Closed)
    }
}

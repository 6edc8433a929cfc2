//! Bound on concurrently served HTTP connections

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission control for the accept loop
///
/// Connections past the limit are refused, not queued.
#[derive(Debug, Clone)]
pub struct ConnectionLimit {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl ConnectionLimit {
    /// Create a limit of `limit` concurrent connections
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "connection limit must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Admit one connection, or `None` when the limit is reached
    pub fn try_admit(&self) -> Option<ConnectionPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.active.fetch_add(1, Ordering::Relaxed);

        Some(ConnectionPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Connections currently admitted
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Configured limit
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Held for the lifetime of one connection
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

//! Process-wide request concurrency cap
//!
//! The RequestLimiter bounds how many physical requests are in flight at once,
//! independent of retry depth or fan-out breadth. Excess requests wait in FIFO
//! order for a free slot.

use crate::fault::Fault;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size admission window shared by every clone
///
/// Starts with full capacity and never resets; dropping a [`RequestPermit`]
/// hands its slot to the oldest waiter.
#[derive(Clone, Debug)]
pub struct RequestLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// A held request slot, released on drop
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

impl RequestLimiter {
    /// Create a limiter admitting `max_in_flight` requests at once (minimum 1)
    ///
    /// # Examples
    ///
    /// ```
    /// use fanout_fetch::limiter::RequestLimiter;
    ///
    /// let limiter = RequestLimiter::new(10);
    /// assert_eq!(limiter.capacity(), 10);
    /// assert_eq!(limiter.in_flight(), 0);
    /// ```
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    ///
    /// `target` is only used to describe the failure if the limiter has been
    /// shut down.
    pub async fn acquire(&self, target: &str) -> Result<RequestPermit, Fault> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Fault::cancelled(target))?;
        Ok(RequestPermit { _permit: permit })
    }

    /// Maximum number of requests in flight
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all {capacity} bridge slots are in use")]
pub struct PoolExhausted {
    pub capacity: usize,
}

/// Fixed-size set of reservations for concurrent bridge processes.
///
/// Acquisition never waits: callers either get a slot immediately or an
/// error. A slot is returned when its [`PoolSlot`] is dropped.
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug)]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<PoolSlot, PoolExhausted> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(PoolSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => Err(PoolExhausted {
                capacity: self.capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    pub fn engaged(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }
}

//! Bounded hand-off queues between intake and its workers.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Permit};

use crate::admission::{Decision, Job};

/// Errors from offering to a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,

    #[error("queue closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for QueueError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        }
    }
}

/// Producer side of a bounded queue. Offers never wait.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

/// Queue of admitted jobs awaiting execution.
pub type JobQueue = BoundedQueue<Job>;

/// Queue of decisions awaiting the decision writer.
pub type DecisionQueue = BoundedQueue<Decision>;

/// Create a bounded queue and its receiving end.
pub fn bounded<T>(capacity: usize) -> (BoundedQueue<T>, mpsc::Receiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (BoundedQueue { tx, capacity }, rx)
}

impl<T> BoundedQueue<T> {
    /// Enqueue `item` if there is room.
    pub fn offer(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(QueueError::from)
    }

    /// Reserve one slot.
    pub fn reserve(&self) -> Result<Permit<'_, T>, QueueError> {
        self.tx.try_reserve().map_err(QueueError::from)
    }

    /// Reserve `n` slots or none at all.
    ///
    /// Permits already taken are released when an attempt fails.
    pub fn reserve_many(&self, n: usize) -> Result<Vec<Permit<'_, T>>, QueueError> {
        if self.remaining_capacity() < n {
            return Err(QueueError::Full);
        }
        let mut permits = Vec::with_capacity(n);
        for _ in 0..n {
            permits.push(self.reserve()?);
        }
        Ok(permits)
    }

    /// Slots currently free.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

//! # Signal Subscriber
//!
//! Channel side of a signal, for consumers that run on an async runtime
//! rather than inside the emitting thread.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The signal was dropped.
    #[error("signal closed")]
    Closed,

    /// Nothing buffered right now.
    #[error("no value available")]
    Empty,
}

pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Wait for the next value. Lagged values are skipped.
    pub async fn recv(&mut self) -> Result<T, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(v) => return Ok(v),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SubscriptionError::Closed)
                }
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<T, SubscriptionError> {
        loop {
            match self.receiver.try_recv() {
                Ok(v) => return Ok(v),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    debug!(skipped = n, "subscriber lagged");
                }
                Err(broadcast::error::TryRecvError::Empty) => {
                    return Err(SubscriptionError::Empty)
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(SubscriptionError::Closed)
                }
            }
        }
    }
}

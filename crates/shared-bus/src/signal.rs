//! # Signals
//!
//! A `Signal<T>` holds an ordered list of handlers plus any channel
//! subscribers. `emit` runs handlers on the calling thread in connection
//! order.

use crate::subscriber::Subscription;
use crate::DEFAULT_CHANNEL_CAPACITY;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Error returned by an observer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Logged and ignored.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Resource exhaustion inside the handler; propagated to the emitter.
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

type Handler<T> = Arc<dyn Fn(&T) -> Result<(), HandlerError> + Send + Sync>;

pub struct Signal<T> {
    name: &'static str,
    handlers: RwLock<Vec<Handler<T>>>,
    channel: broadcast::Sender<T>,
    emitted: AtomicU64,
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        let (channel, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
            channel,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a handler.
    pub fn connect<F>(&self, handler: F)
    where
        F: Fn(&T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Receive emitted values on a channel.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription::new(self.channel.subscribe())
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Deliver `value` to every handler and subscriber.
    ///
    /// Only `HandlerError::Fatal` is returned; all other failures are logged.
    pub fn emit(&self, value: &T) -> Result<(), HandlerError> {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        // snapshot so handlers may connect further handlers
        let handlers: Vec<Handler<T>> = self.handlers.read().clone();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(value))) {
                Ok(Ok(())) => {}
                Ok(Err(HandlerError::Fatal(msg))) => {
                    error!(signal = self.name, "fatal error in signal handler: {msg}");
                    return Err(HandlerError::Fatal(msg));
                }
                Ok(Err(HandlerError::Failed(msg))) => {
                    warn!(signal = self.name, "signal handler error: {msg}");
                }
                Err(_) => {
                    warn!(signal = self.name, "signal handler panicked");
                }
            }
        }
        if self.channel.receiver_count() > 0 {
            let _ = self.channel.send(value.clone());
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_run_in_order() {
        let signal = Signal::<u32>::new("test");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let seen = seen.clone();
            signal.connect(move |v| {
                seen.lock().push((tag, *v));
                Ok(())
            });
        }
        signal.emit(&7).unwrap();
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(signal.emitted(), 1);
    }

    #[test]
    fn test_failed_and_panicking_handlers_are_swallowed() {
        let signal = Signal::<u32>::new("test");
        let after = Arc::new(AtomicUsize::new(0));
        signal.connect(|_| Err(HandlerError::Failed("nope".into())));
        signal.connect(|_| panic!("observer bug"));
        let counter = after.clone();
        signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(signal.emit(&1).is_ok());
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fatal_handler_error_propagates() {
        let signal = Signal::<u32>::new("test");
        let after = Arc::new(AtomicUsize::new(0));
        signal.connect(|_| Err(HandlerError::Fatal("out of memory".into())));
        let counter = after.clone();
        signal.connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(
            signal.emit(&1),
            Err(HandlerError::Fatal("out of memory".into()))
        );
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_channel_subscriber_receives_values() {
        let signal = Signal::<u32>::new("test");
        let mut sub = signal.subscribe();
        signal.emit(&5).unwrap();
        assert_eq!(sub.recv().await.unwrap(), 5);
    }
}

//! # Thread-Pool Tasks
//!
//! Pure computations (merkle roots, key recovery, block-state construction,
//! block serialization) run on a named rayon pool. Each submission returns
//! a `TaskFuture` backed by a oneshot channel that the caller either blocks
//! on with `wait()` or awaits.

use crate::errors::TypeError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub struct NamedThreadPool {
    name: String,
    pool: rayon::ThreadPool,
}

impl NamedThreadPool {
    pub fn new(name: &str, size: usize) -> Result<Self, TypeError> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size.max(1))
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| TypeError::ThreadPool(e.to_string()))?;
        tracing::debug!(pool = name, threads = size.max(1), "thread pool started");
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the pool.
    pub fn post<T, F>(&self, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            // receiver gone means nobody is waiting
            let _ = tx.send(f());
        });
        TaskFuture { rx }
    }
}

impl std::fmt::Debug for NamedThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NamedThreadPool({})", self.name)
    }
}

/// Handle to a value produced on the pool.
#[derive(Debug)]
pub struct TaskFuture<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskFuture<T> {
    /// Already-resolved future.
    pub fn ready(value: T) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        TaskFuture { rx }
    }

    /// Block the calling thread until the task completes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T, TypeError> {
        self.rx.blocking_recv().map_err(|_| TypeError::TaskCancelled)
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T, TypeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| TypeError::TaskCancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_wait() {
        let pool = NamedThreadPool::new("test", 2).unwrap();
        let fut = pool.post(|| 6 * 7);
        assert_eq!(fut.wait().unwrap(), 42);
    }

    #[test]
    fn test_ready_future() {
        assert_eq!(TaskFuture::ready("x").wait().unwrap(), "x");
    }

    #[tokio::test]
    async fn test_task_future_can_be_awaited() {
        let pool = NamedThreadPool::new("async", 1).unwrap();
        let value = pool.post(|| String::from("done")).await.unwrap();
        assert_eq!(value, "done");
    }
}

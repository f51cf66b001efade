//! Scoped execution and interrupt handling.
//!
//! The [`Executor`] owns every background task an operation spawns and a set
//! of at-close callbacks. `close` drains the callbacks first — a callback may
//! still schedule follow-up work, which is why the drained flag only flips
//! afterwards — and then waits for all owned tasks to finish. The
//! [`InterruptGuard`] turns Ctrl-C into a process-wide cancellation token
//! that workers poll between I/O steps.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use tokio_util::sync::CancellationToken;

type CloseCallback = Box<dyn FnOnce(&Executor) + Send>;

/// An executor that owns spawned tasks and runs finalizers on close.
pub struct Executor {
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    on_close: Mutex<VecDeque<CloseCallback>>,
    drained: AtomicBool,
    closing: AtomicBool,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Creates a new executor.
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            on_close: Mutex::new(VecDeque::new()),
            drained: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    /// Spawns a task owned by this executor. After [`Executor::close`] has
    /// drained, scheduling silently becomes a no-op.
    pub fn schedule<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.drained.load(Ordering::SeqCst) {
            tracing::debug!("executor is drained, dropping scheduled task");
            return;
        }
        let handle = tokio::spawn(task);
        self.handles
            .lock()
            .expect("executor handle list is never poisoned")
            .push(handle);
    }

    /// Registers a callback to run when the executor closes. Callbacks run in
    /// registration order and may themselves call [`Executor::schedule`].
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce(&Executor) + Send + 'static,
    {
        self.on_close
            .lock()
            .expect("executor callback list is never poisoned")
            .push_back(Box::new(callback));
    }

    /// Runs the close callbacks, flips the drained flag and waits for every
    /// owned task. Calling `close` a second time is a no-op.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        // Drain callbacks one at a time so a callback that registers more
        // work (or more callbacks) is still honored. The lock is released
        // between invocations.
        loop {
            let callback = self
                .on_close
                .lock()
                .expect("executor callback list is never poisoned")
                .pop_front();
            let Some(callback) = callback else { break };
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(self)
            }));
            if result.is_err() {
                tracing::warn!("an executor close callback panicked; continuing");
            }
        }

        self.drained.store(true, Ordering::SeqCst);

        // Join every owned task, including tasks that callbacks scheduled.
        loop {
            let handle = self
                .handles
                .lock()
                .expect("executor handle list is never poisoned")
                .pop();
            let Some(handle) = handle else { break };
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("an executor task failed: {}", e);
                }
            }
        }
    }

    /// Whether the executor has been drained.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }
}

/// Installs a Ctrl-C handler for its lifetime and exposes the interrupt flag
/// as a [`CancellationToken`].
pub struct InterruptGuard {
    token: CancellationToken,
    listener: tokio::task::JoinHandle<()>,
}

impl InterruptGuard {
    /// Installs the signal handler.
    pub fn new() -> Self {
        let token = CancellationToken::new();
        let trip = token.clone();
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling");
                trip.cancel();
            }
        });
        Self { token, listener }
    }

    /// The process-wide interrupt flag.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether an interrupt has been received.
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{atomic::AtomicUsize, Arc};

    use super::*;

    #[tokio::test]
    async fn test_close_runs_callbacks_and_joins_tasks() {
        let executor = Arc::new(Executor::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        executor.schedule(async move {
            task_counter.fetch_add(1, Ordering::SeqCst);
        });

        let callback_counter = counter.clone();
        executor.on_close(move |_| {
            callback_counter.fetch_add(10, Ordering::SeqCst);
        });

        executor.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(executor.is_drained());
    }

    #[tokio::test]
    async fn test_close_callback_may_schedule() {
        let executor = Arc::new(Executor::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let callback_counter = counter.clone();
        executor.on_close(move |executor| {
            let inner = callback_counter.clone();
            executor.schedule(async move {
                inner.fetch_add(1, Ordering::SeqCst);
            });
        });

        executor.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedule_after_close_is_a_noop() {
        let executor = Executor::new();
        executor.close().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let inner = counter.clone();
        executor.schedule(async move {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        // Closing again is also fine (idempotent) and joins nothing.
        executor.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_swallowed() {
        let executor = Executor::new();
        executor.on_close(|_| panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = counter.clone();
        executor.on_close(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        executor.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

/// Run-wide cap on simultaneously executing evaluations.
///
/// Tasks admitted through `spawn` queue on a fair semaphore, so they start
/// in submission order and at most `limit` run at once. Every completion
/// wakes the capacity waiter so queued results can be drained while the
/// backlog clears.
pub struct EvalPool {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    completions: Arc<Notify>,
    limit: usize,
}

impl EvalPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            completions: Arc::new(Notify::new()),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Tasks submitted but still waiting for a permit.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently holding a permit.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Schedules `task` behind the concurrency cap and returns its handle.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let queued = QueuedGuard::new(Arc::clone(&self.queued));
        let running = Arc::clone(&self.running);
        let completions = Arc::clone(&self.completions);

        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("evaluation semaphore is never closed");
            drop(queued);
            let _active = ActiveGuard::new(running, completions);
            task.await
        })
    }

    /// Blocks until the submission backlog has cleared, invoking `on_drain`
    /// after every task completion so finished results reach the sink while
    /// waiting. Returns once no task is queued or nothing is running.
    pub async fn wait_for_capacity<F, Fut>(&self, mut on_drain: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            if !self.is_backlogged() {
                return Ok(());
            }

            let notified = self.completions.notified();
            if !self.is_backlogged() {
                return Ok(());
            }
            notified.await;

            on_drain().await?;
        }
    }

    fn is_backlogged(&self) -> bool {
        self.queued() > 0 && self.running() > 0
    }
}

struct QueuedGuard {
    queued: Arc<AtomicUsize>,
}

impl QueuedGuard {
    fn new(queued: Arc<AtomicUsize>) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self { queued }
    }
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActiveGuard {
    running: Arc<AtomicUsize>,
    completions: Arc<Notify>,
}

impl ActiveGuard {
    fn new(running: Arc<AtomicUsize>, completions: Arc<Notify>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self {
            running,
            completions,
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completions.notify_waiters();
    }
}

//! Fire-and-forget timed actions on a small bounded pool.
//!
//! Each scheduled action waits out its delay on its own timer, then takes a permit from a shared
//! semaphore before running, so at most `workers` actions execute at once regardless of how many
//! are pending. Every action gets a child [`CancellationToken`]; cancelling it (or shutting the
//! scheduler down) drops the action if it has not started yet.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default number of actions allowed to run concurrently.
pub const DEFAULT_WORKERS: usize = 5;

/// Bounded scheduler for delayed cleanup work (e.g. removing transient notices).
#[derive(Debug, Clone)]
pub struct DeferredScheduler {
    permits: Arc<Semaphore>,
    workers: usize,
    root: CancellationToken,
}

impl Default for DeferredScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl DeferredScheduler {
    /// `workers` is clamped to at least one.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self { permits: Arc::new(Semaphore::new(workers)), workers, root: CancellationToken::new() }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `action` once `delay` has elapsed. Must be called inside a tokio runtime.
    pub fn schedule<F, Fut>(&self, action: F, delay: Duration) -> DeferredHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let task_token = token.clone();
        let permits = self.permits.clone();

        let join = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            let _permit = tokio::select! {
                _ = task_token.cancelled() => return false,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return false,
                },
            };
            action().await;
            true
        });

        DeferredHandle { token, join }
    }

    /// Cancel every action that has not started yet. Running actions finish.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// Handle to one scheduled action.
#[derive(Debug)]
pub struct DeferredHandle {
    token: CancellationToken,
    join: JoinHandle<bool>,
}

impl DeferredHandle {
    /// Prevent the action from running if it has not started.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the task to settle. Returns true if the action ran.
    pub async fn wait(self) -> bool {
        self.join.await.unwrap_or(false)
    }
}

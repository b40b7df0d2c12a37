//! Sleeping abstraction for the poll loop.
//!
//! The poller waits in short ticks; swapping the sleeper lets tests run whole backoff schedules
//! without real delays and observe exactly how many ticks were taken.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

type SleepHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Test sleeper that records every requested tick and returns immediately.
///
/// An optional hook runs on each call with the zero-based call index, which lets a test flip a
/// shutdown flag part-way through a wait.
#[derive(Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    hook: Option<SleepHook>,
}

impl std::fmt::Debug for TrackingSleeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSleeper")
            .field("calls", &self.calls().len())
            .field("hook", &self.hook.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` with the call index every time `sleep` is invoked.
    pub fn on_sleep<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let index = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(duration);
            calls.len() - 1
        };
        if let Some(hook) = &self.hook {
            hook(index);
        }
        // Yield so other tasks (e.g. a test driving shutdown) get scheduled between ticks.
        Box::pin(tokio::task::yield_now())
    }
}

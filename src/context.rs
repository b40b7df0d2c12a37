//! The shared runtime context owned by the entry point.
//!
//! [`CoreContext`] bundles the limiter, the state store, the deferred scheduler, and the shutdown
//! flag. Handlers receive a clone; the poller and gate are built from it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ValidatedSettings;
use crate::deferred::{DeferredHandle, DeferredScheduler};
use crate::error::PersistError;
use crate::gate::{Gate, GateConfig, NoticeSink};
use crate::poller::{DestinationResolver, ItemSource, Notifier, Poller, PollerConfig};
use crate::rate_limit::{Decision, EventKind, FloodLimiter, SubjectId};
use crate::shutdown::ShutdownSignal;
use crate::state::{PersistedState, StateStore};

#[derive(Debug, Clone)]
pub struct CoreContext {
    limiter: FloodLimiter,
    state: Arc<StateStore>,
    scheduler: DeferredScheduler,
    shutdown: ShutdownSignal,
}

impl CoreContext {
    pub fn new(
        limiter: FloodLimiter,
        state: Arc<StateStore>,
        scheduler: DeferredScheduler,
    ) -> Self {
        Self { limiter, state, scheduler, shutdown: ShutdownSignal::new() }
    }

    /// Load state and build every component from validated settings.
    pub async fn open(settings: &ValidatedSettings) -> Self {
        let limiter = FloodLimiter::new(settings.rate_policies.clone())
            .with_duplicate_window(settings.duplicate_window);
        let state = Arc::new(StateStore::load(&settings.state_file).await);
        Self::new(limiter, state, DeferredScheduler::new(settings.deferred_workers))
    }

    pub fn limiter(&self) -> &FloodLimiter {
        &self.limiter
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn scheduler(&self) -> &DeferredScheduler {
        &self.scheduler
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn allow(&self, subject: SubjectId, kind: EventKind) -> Decision {
        self.limiter.allow(subject, kind)
    }

    pub fn is_duplicate(&self, subject: SubjectId, text: &str) -> bool {
        self.limiter.is_duplicate(subject, text)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        self.state.with_state(f)
    }

    /// Mutate, then persist.
    pub async fn commit<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> R {
        self.state.commit(f).await
    }

    pub fn schedule_deferred<F, Fut>(&self, action: F, delay: Duration) -> DeferredHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.scheduler.schedule(action, delay)
    }

    pub fn gate(&self, notices: Option<Arc<dyn NoticeSink>>, config: GateConfig) -> Gate {
        let limiter = Arc::new(self.limiter.clone());
        let gate =
            Gate::new(limiter, self.state.clone(), self.scheduler.clone()).with_config(config);
        match notices {
            Some(sink) => gate.with_notices(sink),
            None => gate,
        }
    }

    /// Build the poller bound to this context's state and shutdown flag.
    pub fn poller(
        &self,
        source: Arc<dyn ItemSource>,
        resolver: Arc<dyn DestinationResolver>,
        notifier: Arc<dyn Notifier>,
        config: PollerConfig,
    ) -> Poller {
        Poller::new(source, resolver, notifier, self.state.clone(), config)
            .with_shutdown(self.shutdown.clone())
    }

    /// Raise the shutdown flag, drop pending deferred actions, and write a final snapshot.
    pub async fn shutdown(&self) -> Result<(), PersistError> {
        tracing::info!("shutting down");
        self.shutdown.trigger();
        self.scheduler.shutdown();
        self.state.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[tokio::test]
    async fn open_shares_state_between_clones() {
        let dir = tempfile::tempdir().unwrap();
        let settings =
            Settings { state_file: dir.path().join("state.json"), ..Settings::default() };
        let ctx = CoreContext::open(&settings.validate().unwrap()).await;
        let other = ctx.clone();

        ctx.commit(|s| s.admin_ids.insert(77)).await;
        assert!(other.state().is_admin(77));
        assert!(other.with_state(|s| s.admin_ids.contains(&77)));

        assert!(!ctx.is_duplicate(1, "hi"));
        assert!(other.is_duplicate(1, "hi"));

        ctx.shutdown().await.unwrap();
        assert!(other.shutdown_signal().is_triggered());
        assert!(other.scheduler().is_shut_down());

        let reloaded = StateStore::load(dir.path().join("state.json")).await;
        assert!(reloaded.is_admin(77));
    }
}

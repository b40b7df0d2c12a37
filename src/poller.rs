//! Background poll loop with at-most-once dispatch bookkeeping.
//!
//! One [`Poller`] runs per process. Each cycle fetches every candidate item, skips the ones the
//! [`StateStore`] already records as sent, and hands the rest to a [`Notifier`]. An item is marked
//! sent (and the snapshot persisted) right after its dispatch attempt, whatever the outcome, so a
//! restart never notifies the same item twice. Items whose status is outside the dispatchable set
//! are marked sent without notification.
//!
//! Between cycles the poller sleeps the [`Backoff`] delay for its consecutive error count, in
//! short ticks so a [`ShutdownSignal`] is noticed quickly.
//!
//! ```text
//! Idle -> Fetching -> Diffing -> Dispatching -> Sleeping -> Fetching ...
//!                      (any state) --shutdown--> Stopped
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::{Backoff, DEFAULT_EXPONENT_CAP};
use crate::bindings::ChatId;
use crate::error::{ConfigError, SourceError};
use crate::shutdown::ShutdownSignal;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::state::StateStore;

/// How long [`PollerHandle::stop`] waits by default.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Statuses notified by default: "new" and "under review" in the source vocabulary.
pub const DEFAULT_DISPATCHABLE: [&str; 2] = ["Новая", "На проверке"];

/// One candidate returned by an [`ItemSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub status: String,
    /// Reference used to resolve the destination (e.g. an owner id).
    #[serde(default)]
    pub owner_ref: Option<String>,
    /// Reference used to fetch related details (e.g. an author id).
    #[serde(default)]
    pub related_ref: Option<String>,
    /// Source-specific fields, passed through to the notifier untouched.
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            owner_ref: None,
            related_ref: None,
            payload: Value::Null,
        }
    }

    pub fn with_owner(mut self, owner_ref: impl Into<String>) -> Self {
        self.owner_ref = Some(owner_ref.into());
        self
    }

    pub fn with_related(mut self, related_ref: impl Into<String>) -> Self {
        self.related_ref = Some(related_ref.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Where a notification goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub chat_id: ChatId,
}

impl Destination {
    pub fn chat(chat_id: ChatId) -> Self {
        Self { chat_id }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chat:{}", self.chat_id)
    }
}

/// Supplies the full candidate list each cycle.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<WorkItem>, SourceError>;
}

/// Maps item references to a destination and optional related details.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    /// `Ok(None)` means the owner has no destination yet; the item is retried next cycle.
    async fn resolve(&self, owner_ref: &str) -> Result<Option<Destination>, SourceError>;

    async fn related(&self, _related_ref: &str) -> Result<Option<Value>, SourceError> {
        Ok(None)
    }
}

/// Delivers one notification. Failures are logged; the item still counts as sent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dispatch(
        &self,
        destination: &Destination,
        item: &WorkItem,
        related: Option<&Value>,
    ) -> Result<(), SourceError>;
}

/// Observable poller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    Idle,
    Fetching,
    Diffing,
    Dispatching,
    Sleeping,
    Stopped,
}

/// Validated poll loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    backoff: Backoff,
    tick: Duration,
    dispatchable: BTreeSet<String>,
}

impl Default for PollerConfig {
    /// 20 s base, 300 s ceiling, exponent cap 5, 100 ms ticks.
    fn default() -> Self {
        Self {
            backoff: Backoff::exponential(Duration::from_secs(20))
                .with_max(Duration::from_secs(300))
                .unwrap_or_else(|_| Backoff::exponential(Duration::from_secs(20))),
            tick: Duration::from_millis(100),
            dispatchable: DEFAULT_DISPATCHABLE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PollerConfig {
    pub fn builder() -> PollerConfigBuilder {
        PollerConfigBuilder::default()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn dispatchable(&self) -> &BTreeSet<String> {
        &self.dispatchable
    }

    pub fn is_dispatchable(&self, status: &str) -> bool {
        self.dispatchable.contains(status)
    }
}

/// Builder for [`PollerConfig`]; `build` validates every field.
#[derive(Debug, Clone)]
pub struct PollerConfigBuilder {
    base: Duration,
    max: Duration,
    exponent_cap: u32,
    tick: Duration,
    dispatchable: BTreeSet<String>,
}

impl Default for PollerConfigBuilder {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(20),
            max: Duration::from_secs(300),
            exponent_cap: DEFAULT_EXPONENT_CAP,
            tick: Duration::from_millis(100),
            dispatchable: DEFAULT_DISPATCHABLE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl PollerConfigBuilder {
    pub fn base_interval(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn exponent_cap(mut self, cap: u32) -> Self {
        self.exponent_cap = cap;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Replace the dispatchable status set.
    pub fn dispatchable_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dispatchable = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<PollerConfig, ConfigError> {
        let backoff = Backoff::exponential(self.base)
            .with_max(self.max)?
            .with_exponent_cap(self.exponent_cap);
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.dispatchable.is_empty() {
            return Err(ConfigError::NoDispatchableStatus);
        }
        Ok(PollerConfig { backoff, tick: self.tick, dispatchable: self.dispatchable })
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    /// Items handed to the notifier (successfully or not).
    pub dispatched: usize,
    /// Items marked sent without notification.
    pub suppressed: usize,
    pub already_sent: usize,
    /// Items left for a later cycle (no destination yet).
    pub deferred: usize,
    pub notify_failures: usize,
    /// Shutdown was observed before every candidate was processed.
    pub interrupted: bool,
}

/// The poll loop. Build it, then [`Poller::spawn`] it or drive it with [`Poller::run`].
pub struct Poller {
    source: Arc<dyn ItemSource>,
    resolver: Arc<dyn DestinationResolver>,
    notifier: Arc<dyn Notifier>,
    state: Arc<StateStore>,
    config: PollerConfig,
    sleeper: Arc<dyn Sleeper>,
    shutdown: ShutdownSignal,
    status: watch::Sender<PollerState>,
    errors: u32,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("state", &*self.status.borrow())
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(
        source: Arc<dyn ItemSource>,
        resolver: Arc<dyn DestinationResolver>,
        notifier: Arc<dyn Notifier>,
        state: Arc<StateStore>,
        config: PollerConfig,
    ) -> Self {
        let (status, _) = watch::channel(PollerState::Idle);
        Self {
            source,
            resolver,
            notifier,
            state,
            config,
            sleeper: Arc::new(TokioSleeper),
            shutdown: ShutdownSignal::new(),
            status,
            errors: 0,
        }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Observe an existing shutdown flag instead of a private one.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> PollerState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.status.subscribe()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.errors
    }

    /// Delay before the next cycle given the current error count.
    pub fn next_delay(&self) -> Duration {
        self.config.backoff.delay(self.errors)
    }

    fn set_state(&self, state: PollerState) {
        self.status.send_replace(state);
    }

    /// Run one fetch/diff/dispatch pass. Only a fetch failure is an error.
    pub async fn run_cycle(&self) -> Result<CycleReport, SourceError> {
        self.set_state(PollerState::Fetching);
        let items = self.source.fetch_all().await?;

        self.set_state(PollerState::Diffing);
        let sent = self.state.sent_snapshot();
        let mut report = CycleReport { fetched: items.len(), ..CycleReport::default() };
        let fresh: Vec<&WorkItem> = items
            .iter()
            .filter(|item| !item.id.is_empty())
            .filter(|item| {
                let known = sent.contains(&item.id);
                if known {
                    report.already_sent += 1;
                }
                !known
            })
            .collect();

        self.set_state(PollerState::Dispatching);
        for item in fresh {
            if self.shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }
            self.process(item, &mut report).await;
        }
        Ok(report)
    }

    async fn process(&self, item: &WorkItem, report: &mut CycleReport) {
        // The same id can appear twice in one fetch.
        if self.state.is_sent(&item.id) {
            report.already_sent += 1;
            return;
        }

        if !self.config.is_dispatchable(&item.status) {
            tracing::debug!(
                item_id = %item.id,
                status = %item.status,
                "status not dispatchable; suppressed"
            );
            self.state.mark_sent(&item.id).await;
            report.suppressed += 1;
            return;
        }

        let destination = match item.owner_ref.as_deref() {
            Some(owner) => match self.resolver.resolve(owner).await {
                Ok(destination) => destination,
                Err(err) => {
                    tracing::warn!(
                        item_id = %item.id,
                        owner,
                        error = %err,
                        "destination lookup failed"
                    );
                    None
                }
            },
            None => None,
        };
        let Some(destination) = destination else {
            tracing::debug!(item_id = %item.id, "no destination yet; retrying next cycle");
            report.deferred += 1;
            return;
        };

        let related = match item.related_ref.as_deref() {
            Some(related_ref) => self.resolver.related(related_ref).await.unwrap_or_else(|err| {
                tracing::warn!(
                    item_id = %item.id,
                    related_ref,
                    error = %err,
                    "related lookup failed"
                );
                None
            }),
            None => None,
        };

        match self.notifier.dispatch(&destination, item, related.as_ref()).await {
            Ok(()) => {
                tracing::info!(item_id = %item.id, %destination, "notification dispatched");
            }
            Err(err) => {
                report.notify_failures += 1;
                tracing::warn!(
                    item_id = %item.id,
                    %destination,
                    error = %err,
                    "notification failed"
                );
            }
        }
        report.dispatched += 1;
        self.state.mark_sent(&item.id).await;
    }

    /// Run one cycle, update the error count, and return the delay before the next one.
    pub async fn poll_once(&mut self) -> Duration {
        match self.run_cycle().await {
            Ok(report) => {
                self.errors = 0;
                tracing::info!(
                    fetched = report.fetched,
                    dispatched = report.dispatched,
                    suppressed = report.suppressed,
                    deferred = report.deferred,
                    failed = report.notify_failures,
                    "poll cycle complete"
                );
            }
            Err(err) => {
                self.errors = self.errors.saturating_add(1);
                tracing::warn!(errors = self.errors, error = %err, "poll cycle failed");
            }
        }
        self.next_delay()
    }

    /// Sleep for `total` in ticks. Returns true if shutdown was observed.
    pub async fn wait(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.shutdown.is_triggered() {
                return true;
            }
            let step = remaining.min(self.config.tick);
            self.sleeper.sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        self.shutdown.is_triggered()
    }

    /// Loop until shutdown.
    pub async fn run(mut self) {
        tracing::info!(
            base = ?self.config.backoff.base(),
            max = ?self.config.backoff.max(),
            "poller started"
        );
        while !self.shutdown.is_triggered() {
            let delay = self.poll_once().await;
            self.set_state(PollerState::Sleeping);
            if self.wait(delay).await {
                break;
            }
        }
        self.set_state(PollerState::Stopped);
        tracing::info!("poller stopped");
    }

    /// Run on a background task.
    pub fn spawn(self) -> PollerHandle {
        let shutdown = self.shutdown.clone();
        let state = self.subscribe();
        let join = tokio::spawn(self.run());
        PollerHandle { shutdown, state, join }
    }
}

/// Lifecycle handle for a spawned [`Poller`].
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: ShutdownSignal,
    state: watch::Receiver<PollerState>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.clone()
    }

    /// Ask the loop to stop without waiting.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Signal shutdown and wait up to `timeout`. Returns true if the task finished cleanly.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.trigger();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "poller task failed");
                false
            }
            Err(_) => {
                tracing::warn!(?timeout, "poller did not stop in time");
                false
            }
        }
    }
}

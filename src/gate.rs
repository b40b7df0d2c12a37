//! Admission gate for inbound interactive events.
//!
//! Every event passes through [`Gate::check`] before a business handler sees it:
//!
//! 1. Events without an identifiable subject are forwarded unrestricted.
//! 2. Free-text messages repeating the subject's previous text within the duplicate window are
//!    dropped with a short-lived warning.
//! 3. Every event then consumes one admission from the [`RateLimiter`]; a denial drops it with a
//!    countdown notice.
//! 4. Admitted events are forwarded, annotated with whether the subject holds admin rights.
//!
//! Notices go to an optional [`NoticeSink`] and are retracted later on the
//! [`DeferredScheduler`]. Notice failures are logged and never change the verdict.
//!
//! [`GateLayer`] wraps a tower service with the same logic.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

use crate::bindings::ChatId;
use crate::deferred::DeferredScheduler;
use crate::error::SourceError;
use crate::rate_limit::{Decision, EventKind, RateLimiter, SubjectId};
use crate::state::StateStore;

/// Identifier of a posted notice, as returned by the sink.
pub type NoticeId = i64;

/// What the gate needs to know about an inbound event.
pub trait GatedEvent {
    fn kind(&self) -> EventKind;

    /// `None` when the sender cannot be determined.
    fn subject(&self) -> Option<SubjectId>;

    /// Free text, checked for duplicates on [`EventKind::Message`] events.
    fn text(&self) -> Option<&str> {
        None
    }

    /// Chat to post notices into.
    fn chat(&self) -> Option<ChatId> {
        None
    }

    /// Id used to acknowledge an action event (e.g. a callback query).
    fn ack_id(&self) -> Option<&str> {
        None
    }
}

/// Outbound channel for transient notices.
#[async_trait]
pub trait NoticeSink: Send + Sync {
    async fn post(&self, chat: ChatId, text: &str) -> Result<NoticeId, SourceError>;

    async fn retract(&self, chat: ChatId, notice: NoticeId) -> Result<(), SourceError>;

    async fn acknowledge(&self, _ack_id: &str, _text: &str) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Admitted.
    Forward { subject: SubjectId, admin: bool },
    /// No subject could be extracted; admitted without checks.
    Unrestricted,
    /// Dropped as a repeat of the previous message.
    Duplicate,
    /// Dropped by the rate limiter.
    Throttled { retry_after_secs: u64 },
}

impl Verdict {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Verdict::Forward { .. } | Verdict::Unrestricted)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Verdict::Forward { admin: true, .. })
    }
}

/// Notice texts and lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub duplicate_text: String,
    pub duplicate_notice_ttl: Duration,
    /// `{retry}` is replaced with the retry-after seconds.
    pub throttle_template: String,
    /// Acknowledgement text for throttled action events; `{retry}` as above.
    pub ack_template: String,
    /// Throttle notices live `retry + 1` seconds, but no longer than this.
    pub throttle_notice_max_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            duplicate_text: "Repeated message. Please wait a moment.".into(),
            duplicate_notice_ttl: Duration::from_secs(3),
            throttle_template: "Too many requests. Retry in {retry} s.".into(),
            ack_template: "Too many requests. Wait {retry} s.".into(),
            throttle_notice_max_ttl: Duration::from_secs(6),
        }
    }
}

impl GateConfig {
    pub fn throttle_text(&self, retry_after_secs: u64) -> String {
        self.throttle_template.replace("{retry}", &retry_after_secs.to_string())
    }

    pub fn ack_text(&self, retry_after_secs: u64) -> String {
        self.ack_template.replace("{retry}", &retry_after_secs.to_string())
    }

    pub fn throttle_notice_ttl(&self, retry_after_secs: u64) -> Duration {
        Duration::from_secs(retry_after_secs.saturating_add(1)).min(self.throttle_notice_max_ttl)
    }
}

/// The interceptor. Cheap to clone.
#[derive(Clone)]
pub struct Gate {
    limiter: Arc<dyn RateLimiter>,
    state: Arc<StateStore>,
    notices: Option<Arc<dyn NoticeSink>>,
    scheduler: DeferredScheduler,
    config: GateConfig,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("notices", &self.notices.is_some())
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Gate {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        state: Arc<StateStore>,
        scheduler: DeferredScheduler,
    ) -> Self {
        Self { limiter, state, notices: None, scheduler, config: GateConfig::default() }
    }

    pub fn with_notices(mut self, sink: Arc<dyn NoticeSink>) -> Self {
        self.notices = Some(sink);
        self
    }

    pub fn with_config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide without side effects beyond limiter bookkeeping.
    pub fn evaluate<E: GatedEvent + ?Sized>(&self, event: &E) -> Verdict {
        let Some(subject) = event.subject() else {
            return Verdict::Unrestricted;
        };
        let kind = event.kind();

        if kind == EventKind::Message {
            if let Some(text) = event.text() {
                if self.limiter.is_duplicate(subject, text) {
                    return Verdict::Duplicate;
                }
            }
        }

        match self.limiter.allow(subject, kind) {
            Decision::Allowed => Verdict::Forward { subject, admin: self.state.is_admin(subject) },
            Decision::Denied { retry_after_secs, .. } => Verdict::Throttled { retry_after_secs },
        }
    }

    /// Decide, then deliver the matching notice.
    pub async fn check<E: GatedEvent + ?Sized>(&self, event: &E) -> Verdict {
        let verdict = self.evaluate(event);
        match verdict {
            Verdict::Duplicate => {
                let ttl = self.config.duplicate_notice_ttl;
                self.post_transient(event.chat(), &self.config.duplicate_text, ttl).await;
            }
            Verdict::Throttled { retry_after_secs } => {
                if let (Some(sink), Some(ack_id)) = (&self.notices, event.ack_id()) {
                    let text = self.config.ack_text(retry_after_secs);
                    if let Err(err) = sink.acknowledge(ack_id, &text).await {
                        tracing::debug!(error = %err, "throttle acknowledgement failed");
                    }
                }
                let text = self.config.throttle_text(retry_after_secs);
                let ttl = self.config.throttle_notice_ttl(retry_after_secs);
                self.post_transient(event.chat(), &text, ttl).await;
            }
            Verdict::Forward { .. } | Verdict::Unrestricted => {}
        }
        verdict
    }

    async fn post_transient(&self, chat: Option<ChatId>, text: &str, ttl: Duration) {
        let (Some(sink), Some(chat)) = (&self.notices, chat) else {
            return;
        };
        let notice = match sink.post(chat, text).await {
            Ok(notice) => notice,
            Err(err) => {
                tracing::debug!(chat, error = %err, "notice post failed");
                return;
            }
        };
        let sink = sink.clone();
        self.scheduler.schedule(
            move || async move {
                if let Err(err) = sink.retract(chat, notice).await {
                    tracing::debug!(chat, notice, error = %err, "notice retract failed");
                }
            },
            ttl,
        );
    }
}

/// Error returned by [`GateService`].
#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error("duplicate message dropped")]
    Duplicate,
    #[error("rate limited; retry in {retry_after_secs} s")]
    Throttled { retry_after_secs: u64 },
    #[error(transparent)]
    Inner(E),
}

/// Tower layer applying a [`Gate`] in front of a handler service.
#[derive(Clone, Debug)]
pub struct GateLayer {
    gate: Gate,
}

impl GateLayer {
    pub fn new(gate: Gate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, service: S) -> Self::Service {
        GateService { inner: service, gate: self.gate.clone() }
    }
}

/// Service produced by [`GateLayer`]. Admitted events reach `inner` unchanged.
#[derive(Clone, Debug)]
pub struct GateService<S> {
    inner: S,
    gate: Gate,
}

impl<S, E> Service<E> for GateService<S>
where
    S: Service<E> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    E: GatedEvent + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, event: E) -> Self::Future {
        let gate = self.gate.clone();
        // Keep the service that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match gate.check(&event).await {
                Verdict::Duplicate => Err(GateError::Duplicate),
                Verdict::Throttled { retry_after_secs } => {
                    Err(GateError::Throttled { retry_after_secs })
                }
                Verdict::Forward { .. } | Verdict::Unrestricted => {
                    inner.call(event).await.map_err(GateError::Inner)
                }
            }
        })
    }
}

//! Convenient re-exports for wiring a pollgate process.
pub use crate::{
    backoff::Backoff,
    config::{Settings, ValidatedSettings},
    context::CoreContext,
    deferred::{DeferredHandle, DeferredScheduler},
    error::{ConfigError, PersistError, SourceError},
    gate::{Gate, GateConfig, GateError, GateLayer, GatedEvent, NoticeSink, Verdict},
    poller::{
        Destination, DestinationResolver, ItemSource, Notifier, PollerConfig, PollerHandle,
        WorkItem,
    },
    rate_limit::{Decision, EventKind, FloodLimiter, RatePolicies, RatePolicy, WindowLimit},
    state::StateStore,
};

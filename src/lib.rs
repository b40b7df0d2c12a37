#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # pollgate
//!
//! Flood-controlled event gate and at-most-once work item notifier with durable state.
//!
//! ## Features
//!
//! - **Flood control**: two sliding windows plus a cooldown per subject and event kind
//! - **Duplicate suppression** for repeated free-text messages
//! - **Durable state** written atomically (temp file, fsync, rename) after every significant change
//! - **Background poller** with exponential backoff and cooperative shutdown
//! - **Tower layer** gating handler services
//!
//! ## Quick Start
//!
//! ```rust
//! use pollgate::{EventKind, FloodLimiter, RatePolicies};
//!
//! let limiter = FloodLimiter::new(RatePolicies::standard());
//! let decision = limiter.allow(42, EventKind::Message);
//! assert!(decision.is_allowed());
//! ```
//!
//! A full process loads [`Settings`], validates them, and opens a [`CoreContext`]:
//!
//! ```rust,no_run
//! use pollgate::{CoreContext, Settings};
//!
//! # async fn boot() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load("pollgate.json").await?.with_env_overrides();
//! let ctx = CoreContext::open(&settings.validate()?).await;
//! // build the gate and poller from `ctx`, run, then:
//! ctx.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bindings;
pub mod clock;
pub mod config;
pub mod context;
pub mod deferred;
pub mod error;
pub mod gate;
pub mod poller;
pub mod prelude;
pub mod rate_limit;
pub mod shutdown;
pub mod sleeper;
pub mod state;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use bindings::{chat_id_from_record, resolve_binding, BindingDirectory, ChatId};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{Settings, ValidatedSettings};
pub use context::CoreContext;
pub use deferred::{DeferredHandle, DeferredScheduler};
pub use error::{ConfigError, LoadError, PersistError, SourceError};
pub use gate::{Gate, GateConfig, GateError, GateLayer, GatedEvent, NoticeSink, Verdict};
pub use poller::{
    CycleReport, Destination, DestinationResolver, ItemSource, Notifier, Poller, PollerConfig,
    PollerHandle, PollerState, WorkItem,
};
pub use rate_limit::{Decision, EventKind, FloodLimiter, RateLimiter, RatePolicies, SubjectId};
pub use shutdown::ShutdownSignal;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use state::{BindingRecord, PersistedState, StateStore};

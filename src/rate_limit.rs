//! Flood control for inbound events.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: the trait the gate asks for admission and duplicate decisions.
//! - [`FloodLimiter`]: two sliding windows plus a cooldown per (subject, kind), and per-subject
//!   duplicate suppression.
//! - [`RatePolicies`]: the validated per-kind policy table.
//! - [`Decision`]: the result of an admission check.
//!
//! # Algorithm
//!
//! For each `(subject, kind)` the limiter keeps the instants of admitted events and a
//! `blocked_until` mark. A check first honours an active cooldown, then prunes instants older than
//! the long window and counts what falls inside the short and long windows. Reaching either limit
//! starts a cooldown; otherwise the event is recorded and admitted. Denied events are not recorded,
//! so a blocked subject does not extend its own window.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod limiter;
pub mod policy;
pub mod store;
pub use limiter::{FloodLimiter, DEFAULT_DUPLICATE_WINDOW};
pub use policy::{RatePolicies, RatePoliciesBuilder, RatePolicy, WindowLimit};

/// Identity an inbound event is attributed to.
pub type SubjectId = i64;

/// Category of inbound event; each kind has its own rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Free-text message. Subject to duplicate suppression.
    Message,
    /// Discrete action such as a button press.
    Action,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Message, EventKind::Action];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Action => "action",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which limit caused a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A cooldown from an earlier violation is still running.
    Cooldown,
    /// The short window is full; a new cooldown started.
    ShortWindow,
    /// The long window is full; a new cooldown started.
    LongWindow,
}

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The event may proceed.
    Allowed,
    /// The event is dropped.
    Denied {
        /// Whole seconds the subject should wait; always at least 1.
        retry_after_secs: u64,
        reason: DenyReason,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    /// Seconds until admission may succeed again; 0 when allowed.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Decision::Allowed => 0,
            Decision::Denied { retry_after_secs, .. } => *retry_after_secs,
        }
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs())
    }
}

/// Admission control consulted by the gate.
///
/// Implementations must be cheap and must not perform I/O: they run inline on the event path.
pub trait RateLimiter: Send + Sync {
    /// Check and, if admitted, record one event for `subject` of `kind`.
    fn allow(&self, subject: SubjectId, kind: EventKind) -> Decision;

    /// True when `content` repeats the subject's previous content within the duplicate window.
    fn is_duplicate(&self, subject: SubjectId, content: &str) -> bool;
}

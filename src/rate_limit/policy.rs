use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rate_limit::EventKind;

/// At most `count` events inside any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub count: u32,
    #[serde(rename = "window_secs", with = "secs")]
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(count: u32, window: Duration) -> Self {
        Self { count, window }
    }

    pub fn per_secs(count: u32, secs: u64) -> Self {
        Self::new(count, Duration::from_secs(secs))
    }
}

/// Rate policy for one event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub short: WindowLimit,
    pub long: WindowLimit,
    #[serde(rename = "cooldown_secs", with = "secs")]
    pub cooldown: Duration,
}

impl RatePolicy {
    pub fn new(short: WindowLimit, long: WindowLimit, cooldown: Duration) -> Self {
        Self { short, long, cooldown }
    }

    fn validate(&self, kind: EventKind) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPolicy { kind, reason: reason.into() };
        if self.short.count == 0 || self.long.count == 0 {
            return Err(invalid("window counts must be greater than zero"));
        }
        if self.short.window.is_zero() || self.long.window.is_zero() {
            return Err(invalid("window durations must be greater than zero"));
        }
        if self.short.window > self.long.window {
            return Err(invalid("short window must not exceed the long window"));
        }
        Ok(())
    }
}

/// Validated policy table with an entry for every [`EventKind`].
///
/// Construction is the only place a missing kind can be reported; lookups never fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicies {
    message: RatePolicy,
    action: RatePolicy,
}

impl RatePolicies {
    pub fn builder() -> RatePoliciesBuilder {
        RatePoliciesBuilder::default()
    }

    /// Messages: 5 per 10 s, 20 per minute, 30 s cooldown.
    /// Actions: 10 per 10 s, 60 per minute, 20 s cooldown.
    pub fn standard() -> Self {
        Self {
            message: RatePolicy::new(
                WindowLimit::per_secs(5, 10),
                WindowLimit::per_secs(20, 60),
                Duration::from_secs(30),
            ),
            action: RatePolicy::new(
                WindowLimit::per_secs(10, 10),
                WindowLimit::per_secs(60, 60),
                Duration::from_secs(20),
            ),
        }
    }

    pub fn get(&self, kind: EventKind) -> &RatePolicy {
        match kind {
            EventKind::Message => &self.message,
            EventKind::Action => &self.action,
        }
    }
}

impl Default for RatePolicies {
    fn default() -> Self {
        Self::standard()
    }
}

/// Collects per-kind policies and validates them into [`RatePolicies`].
#[derive(Debug, Clone, Default)]
pub struct RatePoliciesBuilder {
    entries: HashMap<EventKind, RatePolicy>,
}

impl RatePoliciesBuilder {
    pub fn policy(mut self, kind: EventKind, policy: RatePolicy) -> Self {
        self.entries.insert(kind, policy);
        self
    }

    /// Fails with [`ConfigError::MissingPolicy`] if any kind has no entry.
    pub fn build(mut self) -> Result<RatePolicies, ConfigError> {
        for kind in EventKind::ALL {
            match self.entries.get(&kind) {
                Some(policy) => policy.validate(kind)?,
                None => return Err(ConfigError::MissingPolicy(kind)),
            }
        }
        let mut take =
            |kind: EventKind| self.entries.remove(&kind).ok_or(ConfigError::MissingPolicy(kind));
        Ok(RatePolicies { message: take(EventKind::Message)?, action: take(EventKind::Action)? })
    }
}

impl From<RatePolicies> for RatePoliciesBuilder {
    fn from(policies: RatePolicies) -> Self {
        Self::default()
            .policy(EventKind::Message, policies.message)
            .policy(EventKind::Action, policies.action)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

//! File-based settings with defaults and a `STATE_FILE` override.
//!
//! [`Settings`] mirrors the JSON document on disk; every field is optional. [`Settings::validate`]
//! turns it into runtime types or reports the first [`ConfigError`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deferred::DEFAULT_WORKERS;
use crate::error::ConfigError;
use crate::gate::GateConfig;
use crate::poller::{PollerConfig, DEFAULT_DISPATCHABLE};
use crate::rate_limit::{EventKind, RatePolicies, RatePolicy, DEFAULT_DUPLICATE_WINDOW};

/// Environment variable overriding [`Settings::state_file`].
pub const STATE_FILE_ENV: &str = "STATE_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub state_file: PathBuf,
    pub poll: PollSettings,
    /// One entry per event kind; a partial table is rejected by `validate`.
    pub rate_limits: HashMap<EventKind, RatePolicy>,
    pub duplicate_window_ms: u64,
    pub deferred_workers: usize,
    pub notices: NoticeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let standard = RatePolicies::standard();
        Self {
            state_file: PathBuf::from("state.json"),
            poll: PollSettings::default(),
            rate_limits: EventKind::ALL.iter().map(|&k| (k, *standard.get(k))).collect(),
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW.as_millis() as u64,
            deferred_workers: DEFAULT_WORKERS,
            notices: NoticeSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub base_interval_secs: u64,
    pub max_interval_secs: u64,
    pub exponent_cap: u32,
    pub tick_ms: u64,
    pub dispatchable_statuses: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 20,
            max_interval_secs: 300,
            exponent_cap: 5,
            tick_ms: 100,
            dispatchable_statuses: DEFAULT_DISPATCHABLE.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeSettings {
    pub duplicate_text: String,
    pub duplicate_notice_secs: u64,
    pub throttle_template: String,
    pub ack_template: String,
    pub throttle_notice_max_secs: u64,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self {
            duplicate_text: gate.duplicate_text,
            duplicate_notice_secs: gate.duplicate_notice_ttl.as_secs(),
            throttle_template: gate.throttle_template,
            ack_template: gate.ack_template,
            throttle_notice_max_secs: gate.throttle_notice_max_ttl.as_secs(),
        }
    }
}

/// Runtime configuration produced by [`Settings::validate`].
#[derive(Debug, Clone)]
pub struct ValidatedSettings {
    pub state_file: PathBuf,
    pub rate_policies: RatePolicies,
    pub duplicate_window: Duration,
    pub poller: PollerConfig,
    pub gate: GateConfig,
    pub deferred_workers: usize,
}

impl Settings {
    /// Read settings from `path`. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let unreadable =
            |reason: String| ConfigError::Unreadable { path: path.to_path_buf(), reason };
        match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| unreadable(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file; using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(unreadable(e.to_string())),
        }
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(STATE_FILE_ENV).filter(|p| !p.trim().is_empty()) {
            self.state_file = PathBuf::from(path);
        }
        self
    }

    pub fn validate(&self) -> Result<ValidatedSettings, ConfigError> {
        let rate_policies = self
            .rate_limits
            .iter()
            .fold(RatePolicies::builder(), |b, (&kind, &policy)| b.policy(kind, policy))
            .build()?;

        let duplicate_window = Duration::from_millis(self.duplicate_window_ms);
        if duplicate_window.is_zero() {
            return Err(ConfigError::ZeroDuplicateWindow(duplicate_window));
        }
        if self.deferred_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        let poller = PollerConfig::builder()
            .base_interval(Duration::from_secs(self.poll.base_interval_secs))
            .max_interval(Duration::from_secs(self.poll.max_interval_secs))
            .exponent_cap(self.poll.exponent_cap)
            .tick(Duration::from_millis(self.poll.tick_ms))
            .dispatchable_statuses(self.poll.dispatchable_statuses.iter().cloned())
            .build()?;

        let gate = GateConfig {
            duplicate_text: self.notices.duplicate_text.clone(),
            duplicate_notice_ttl: Duration::from_secs(self.notices.duplicate_notice_secs),
            throttle_template: self.notices.throttle_template.clone(),
            ack_template: self.notices.ack_template.clone(),
            throttle_notice_max_ttl: Duration::from_secs(self.notices.throttle_notice_max_secs),
        };

        Ok(ValidatedSettings {
            state_file: self.state_file.clone(),
            rate_policies,
            duplicate_window,
            poller,
            gate,
            deferred_workers: self.deferred_workers,
        })
    }
}

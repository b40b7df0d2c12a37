use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::store::LimiterState;
use crate::rate_limit::{Decision, EventKind, RateLimiter, RatePolicies, SubjectId};

/// Window used by [`FloodLimiter::is_duplicate`] unless overridden.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(2);

/// Multi-tier sliding-window limiter with per-subject duplicate suppression.
///
/// One mutex guards every window and duplicate record, so overlapping checks for the same subject
/// are serialized. The lock is held only for a prune-and-count pass, never across I/O.
///
/// ```
/// use pollgate::clock::ManualClock;
/// use pollgate::rate_limit::{EventKind, FloodLimiter, RatePolicies};
///
/// let limiter = FloodLimiter::new(RatePolicies::standard()).with_clock(ManualClock::new());
/// for _ in 0..5 {
///     assert!(limiter.allow(1, EventKind::Message).is_allowed());
/// }
/// assert!(!limiter.allow(1, EventKind::Message).is_allowed());
/// ```
#[derive(Debug, Clone)]
pub struct FloodLimiter {
    policies: Arc<RatePolicies>,
    state: Arc<Mutex<LimiterState>>,
    duplicate_window: Duration,
    clock: Arc<dyn Clock>,
}

impl FloodLimiter {
    /// Build a limiter from a validated policy table.
    pub fn new(policies: RatePolicies) -> Self {
        Self {
            policies: Arc::new(policies),
            state: Arc::new(Mutex::new(LimiterState::default())),
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn policies(&self) -> &RatePolicies {
        &self.policies
    }

    /// Admit or deny one event of `kind` from `subject`.
    pub fn allow(&self, subject: SubjectId, kind: EventKind) -> Decision {
        let policy = self.policies.get(kind);
        let now = self.clock.now_millis();
        let decision = self.lock().admit(subject, kind, now, policy);
        if let Decision::Denied { retry_after_secs, reason } = decision {
            tracing::debug!(subject, %kind, retry_after_secs, ?reason, "rate limit denied");
        }
        decision
    }

    /// Duplicate check against the configured window.
    pub fn is_duplicate(&self, subject: SubjectId, content: &str) -> bool {
        self.is_duplicate_within(subject, content, self.duplicate_window)
    }

    /// True when `content` hashes the same as the subject's last content seen less than `window`
    /// ago. A hit leaves the record untouched; a miss replaces it. Empty content never matches.
    pub fn is_duplicate_within(&self, subject: SubjectId, content: &str, window: Duration) -> bool {
        if content.is_empty() {
            return false;
        }
        let hash = content_hash(content);
        let now = self.clock.now_millis();
        let duplicate = self.lock().check_duplicate(subject, hash, now, window);
        if duplicate {
            tracing::debug!(subject, "duplicate content suppressed");
        }
        duplicate
    }

    /// Number of (subject, kind) windows currently tracked.
    pub fn tracked_windows(&self) -> usize {
        self.lock().tracked_windows()
    }

    /// Cooldown end for a subject/kind, in clock milliseconds, if a window exists.
    pub fn blocked_until(&self, subject: SubjectId, kind: EventKind) -> Option<u64> {
        self.lock().window(subject, kind).map(|w| w.blocked_until())
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter for FloodLimiter {
    fn allow(&self, subject: SubjectId, kind: EventKind) -> Decision {
        FloodLimiter::allow(self, subject, kind)
    }

    fn is_duplicate(&self, subject: SubjectId, content: &str) -> bool {
        FloodLimiter::is_duplicate(self, subject, content)
    }
}

/// Non-cryptographic content fingerprint. Collisions are tolerated: the worst case is one
/// suppressed message.
fn content_hash(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::DenyReason;

    fn limiter() -> (FloodLimiter, ManualClock) {
        let clock = ManualClock::new();
        (FloodLimiter::new(RatePolicies::standard()).with_clock(clock.clone()), clock)
    }

    #[test]
    fn kinds_have_independent_windows() {
        let (limiter, _clock) = limiter();
        for _ in 0..5 {
            assert!(limiter.allow(1, EventKind::Message).is_allowed());
        }
        assert!(!limiter.allow(1, EventKind::Message).is_allowed());
        assert!(limiter.allow(1, EventKind::Action).is_allowed());
        assert_eq!(limiter.tracked_windows(), 2);
    }

    #[test]
    fn subjects_have_independent_windows() {
        let (limiter, _clock) = limiter();
        for _ in 0..5 {
            limiter.allow(1, EventKind::Message);
        }
        assert!(!limiter.allow(1, EventKind::Message).is_allowed());
        assert!(limiter.allow(2, EventKind::Message).is_allowed());
    }

    #[test]
    fn retry_after_counts_down_during_cooldown() {
        let (limiter, clock) = limiter();
        for _ in 0..10 {
            limiter.allow(9, EventKind::Action);
        }
        let first = limiter.allow(9, EventKind::Action);
        assert_eq!(
            first,
            Decision::Denied { retry_after_secs: 21, reason: DenyReason::ShortWindow }
        );
        clock.advance(Duration::from_secs(15));
        assert_eq!(limiter.allow(9, EventKind::Action).retry_after_secs(), 6);
        assert_eq!(limiter.blocked_until(9, EventKind::Action), Some(20_000));
    }

    #[test]
    fn empty_content_is_never_duplicate() {
        let (limiter, _clock) = limiter();
        assert!(!limiter.is_duplicate(3, ""));
        assert!(!limiter.is_duplicate(3, ""));
    }

    #[test]
    fn different_content_replaces_record() {
        let (limiter, _clock) = limiter();
        assert!(!limiter.is_duplicate(3, "a"));
        assert!(!limiter.is_duplicate(3, "b"));
        assert!(!limiter.is_duplicate(3, "a"));
        assert!(limiter.is_duplicate(3, "a"));
    }

    #[test]
    fn custom_duplicate_window() {
        let (limiter, clock) = limiter();
        let limiter = limiter.with_duplicate_window(Duration::from_secs(10));
        assert!(!limiter.is_duplicate(3, "hello"));
        clock.advance(Duration::from_secs(5));
        assert!(limiter.is_duplicate(3, "hello"));
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.is_duplicate(3, "hello"));
    }
}

//! In-memory limiter state: one window per (subject, kind), one duplicate record per subject.
//!
//! Everything here is plain data manipulated under the limiter's lock. Instants are milliseconds
//! from the limiter's [`Clock`](crate::clock::Clock).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::rate_limit::{Decision, DenyReason, EventKind, RatePolicy, SubjectId};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Whole seconds until `until`, rounded so a denial always reports at least 1.
fn retry_after_secs(now: u64, until: u64) -> u64 {
    until.saturating_sub(now) / 1000 + 1
}

/// Sliding window for one (subject, kind) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateWindow {
    /// Admitted event instants, oldest first.
    timestamps: VecDeque<u64>,
    blocked_until: u64,
}

impl RateWindow {
    pub fn blocked_until(&self) -> u64 {
        self.blocked_until
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Check the policy at `now`, recording the event if admitted.
    pub fn admit(&mut self, now: u64, policy: &RatePolicy) -> Decision {
        if now < self.blocked_until {
            return Decision::Denied {
                retry_after_secs: retry_after_secs(now, self.blocked_until),
                reason: DenyReason::Cooldown,
            };
        }

        let long_window = millis(policy.long.window);
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_sub(oldest) > long_window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        let short_window = millis(policy.short.window);
        let in_short = self
            .timestamps
            .iter()
            .rev()
            .take_while(|&&t| now.saturating_sub(t) <= short_window)
            .count();
        let in_long = self.timestamps.len();

        let reason = if in_short >= policy.short.count as usize {
            Some(DenyReason::ShortWindow)
        } else if in_long >= policy.long.count as usize {
            Some(DenyReason::LongWindow)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                // Only reachable when not blocked, so this never moves an active block backwards.
                self.blocked_until = now.saturating_add(millis(policy.cooldown));
                Decision::Denied {
                    retry_after_secs: retry_after_secs(now, self.blocked_until),
                    reason,
                }
            }
            None => {
                self.timestamps.push_back(now);
                Decision::Allowed
            }
        }
    }
}

/// Last content seen from a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateRecord {
    pub hash: u64,
    pub seen_at: u64,
}

/// All limiter state guarded by one lock.
#[derive(Debug, Default)]
pub struct LimiterState {
    windows: HashMap<(SubjectId, EventKind), RateWindow>,
    duplicates: HashMap<SubjectId, DuplicateRecord>,
}

impl LimiterState {
    pub fn admit(
        &mut self,
        subject: SubjectId,
        kind: EventKind,
        now: u64,
        policy: &RatePolicy,
    ) -> Decision {
        self.windows.entry((subject, kind)).or_default().admit(now, policy)
    }

    /// Returns true if `hash` repeats within `window`; otherwise records it.
    pub fn check_duplicate(
        &mut self,
        subject: SubjectId,
        hash: u64,
        now: u64,
        window: Duration,
    ) -> bool {
        if let Some(prev) = self.duplicates.get(&subject) {
            if prev.hash == hash && now.saturating_sub(prev.seen_at) < millis(window) {
                return true;
            }
        }
        self.duplicates.insert(subject, DuplicateRecord { hash, seen_at: now });
        false
    }

    pub fn window(&self, subject: SubjectId, kind: EventKind) -> Option<&RateWindow> {
        self.windows.get(&(subject, kind))
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

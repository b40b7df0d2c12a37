use std::sync::Arc;
use std::time::Duration;

use pollgate::rate_limit::{DenyReason, RatePolicy, WindowLimit};
use pollgate::{Decision, EventKind, FloodLimiter, ManualClock, RateLimiter, RatePolicies};

fn limiter() -> (FloodLimiter, ManualClock) {
    let clock = ManualClock::new();
    (FloodLimiter::new(RatePolicies::standard()).with_clock(clock.clone()), clock)
}

#[test]
fn exceeding_short_window_denies_with_retry_after() {
    let (limiter, _clock) = limiter();
    for _ in 0..5 {
        assert!(limiter.allow(1, EventKind::Message).is_allowed());
    }
    let denied = limiter.allow(1, EventKind::Message);
    assert!(!denied.is_allowed());
    assert!(denied.retry_after_secs() > 0);
}

#[test]
fn stays_denied_until_cooldown_ends_then_admits() {
    let (limiter, clock) = limiter();
    for _ in 0..6 {
        limiter.allow(1, EventKind::Message);
    }
    let until = limiter.blocked_until(1, EventKind::Message).unwrap();
    assert_eq!(until, 30_000);

    clock.set_millis(until - 1);
    let d = limiter.allow(1, EventKind::Message);
    assert_eq!(d, Decision::Denied { retry_after_secs: 1, reason: DenyReason::Cooldown });

    clock.set_millis(until);
    assert!(limiter.allow(1, EventKind::Message).is_allowed());
}

#[test]
fn long_window_limits_steady_senders() {
    let (limiter, clock) = limiter();
    // Four messages every 10 s stays under the short limit but fills the long one.
    let mut admitted = 0;
    for round in 0..6 {
        for _ in 0..4 {
            if limiter.allow(2, EventKind::Message).is_allowed() {
                admitted += 1;
            }
        }
        if round < 5 {
            clock.advance(Duration::from_millis(10_001));
        }
    }
    assert_eq!(admitted, 20);
    assert!(matches!(
        limiter.allow(2, EventKind::Message),
        Decision::Denied { reason: DenyReason::Cooldown, .. }
    ));
}

#[test]
fn duplicate_detection_respects_window() {
    let (limiter, clock) = limiter();
    assert!(!limiter.is_duplicate(5, "X"));
    assert!(limiter.is_duplicate(5, "X"));
    clock.advance(Duration::from_secs(2));
    assert!(!limiter.is_duplicate(5, "X"));
    assert!(!limiter.is_duplicate(6, "X"));
}

#[test]
fn custom_policies_apply_per_kind() {
    let tight = RatePolicy::new(
        WindowLimit::per_secs(1, 5),
        WindowLimit::per_secs(2, 60),
        Duration::from_secs(3),
    );
    let policies = RatePolicies::builder()
        .policy(EventKind::Message, tight)
        .policy(EventKind::Action, *RatePolicies::standard().get(EventKind::Action))
        .build()
        .unwrap();
    let clock = ManualClock::new();
    let limiter = FloodLimiter::new(policies).with_clock(clock.clone());

    assert!(limiter.allow(1, EventKind::Message).is_allowed());
    assert_eq!(limiter.allow(1, EventKind::Message).retry_after_secs(), 4);
    assert!(limiter.allow(1, EventKind::Action).is_allowed());
}

#[test]
fn concurrent_checks_admit_exactly_the_limit() {
    let clock = ManualClock::new();
    let limiter: Arc<dyn RateLimiter> =
        Arc::new(FloodLimiter::new(RatePolicies::standard()).with_clock(clock));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || {
                (0..10).filter(|_| limiter.allow(9, EventKind::Action).is_allowed()).count()
            })
        })
        .collect();
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 10);
}

//! Per-resource request throttling with escalating penalties.
//!
//! Every check is a read-modify-write of one [`RateLimitRecord`] performed as
//! a compare-and-swap against a [`CounterStore`], so concurrent handlers (or
//! processes sharing the store) never undercount.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use super::repos::{CounterStore, RepoError};

/// How long one check may keep losing compare-and-swap races.
const CAS_BUDGET: Duration = Duration::from_secs(2);
const CAS_BACKOFF_BASE: Duration = Duration::from_millis(1);
const CAS_BACKOFF_MAX: Duration = Duration::from_millis(32);

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Every update lost its race until the budget ran out. The key is hot.
    #[error("counter `{key}` stayed contended after {attempts} attempts")]
    Contended { key: String, attempts: u32 },
    /// The counter store itself failed.
    #[error(transparent)]
    Store(#[from] RepoError),
}

/// Counter state of one resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub window_start_ms: i64,
    pub count: u32,
    pub penalty: u32,
    pub ban_until_ms: Option<i64>,
}

impl RateLimitRecord {
    fn fresh(now_ms: i64) -> Self {
        Self {
            window_start_ms: now_ms,
            count: 0,
            penalty: 1,
            ban_until_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Throttled { retry_after: Duration, banned: bool },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u32,
    /// Ceiling for the penalty multiplier; throttling at the ceiling bans the key.
    pub max_penalty: u32,
    pub ban: Duration,
}

impl RateLimitPolicy {
    fn effective_max(&self, penalty: u32) -> u32 {
        (self.max_requests / penalty.max(1)).max(1)
    }

    fn ttl(&self) -> Duration {
        self.window.saturating_mul(self.max_penalty.max(1)) + self.ban
    }

    /// Pure transition for one request arriving at `now_ms`.
    pub fn apply(
        &self,
        current: Option<RateLimitRecord>,
        now_ms: i64,
    ) -> (RateLimitRecord, RateLimitDecision) {
        let window_ms = duration_ms(self.window);
        let mut record = current.unwrap_or_else(|| RateLimitRecord::fresh(now_ms));

        if let Some(until) = record.ban_until_ms {
            if now_ms < until {
                let decision = RateLimitDecision::Throttled {
                    retry_after: ms_duration(until - now_ms),
                    banned: true,
                };
                return (record, decision);
            }
            record = RateLimitRecord::fresh(now_ms);
        }

        if now_ms - record.window_start_ms >= window_ms {
            let exceeded = record.count > self.effective_max(record.penalty);
            if !exceeded {
                record.penalty = (record.penalty / 2).max(1);
            }
            record.window_start_ms = now_ms;
            record.count = 0;
        }

        record.count = record.count.saturating_add(1);
        let max = self.effective_max(record.penalty);
        if record.count <= max {
            let remaining = max - record.count;
            return (record, RateLimitDecision::Allowed { remaining });
        }

        if record.penalty >= self.max_penalty {
            return self.ban(now_ms);
        }

        record.penalty = record.penalty.saturating_mul(2).min(self.max_penalty);
        let window_end = record.window_start_ms + window_ms;
        let decision = RateLimitDecision::Throttled {
            retry_after: ms_duration(window_end - now_ms),
            banned: false,
        };
        (record, decision)
    }

    /// Escalate a key after a failure that did not come from throttling.
    pub fn penalize(&self, current: Option<RateLimitRecord>, now_ms: i64) -> RateLimitRecord {
        let mut record = current.unwrap_or_else(|| RateLimitRecord::fresh(now_ms));
        if record.ban_until_ms.is_some_and(|until| now_ms < until) {
            return record;
        }
        if record.penalty >= self.max_penalty {
            return self.ban(now_ms).0;
        }
        record.ban_until_ms = None;
        record.penalty = record.penalty.saturating_mul(2).min(self.max_penalty);
        record
    }

    fn ban(&self, now_ms: i64) -> (RateLimitRecord, RateLimitDecision) {
        let ban_ms = duration_ms(self.ban);
        let record = RateLimitRecord {
            window_start_ms: now_ms,
            count: 0,
            penalty: 1,
            ban_until_ms: Some(now_ms + ban_ms),
        };
        let decision = RateLimitDecision::Throttled {
            retry_after: self.ban,
            banned: true,
        };
        (record, decision)
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    pub async fn check(&self, key: &str) -> Result<RateLimitDecision, RateLimitError> {
        self.check_at(key, OffsetDateTime::now_utc()).await
    }

    pub async fn check_at(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now_ms = unix_ms(now);
        self.update(key, "rate_limit::check", |current| {
            self.policy.apply(current, now_ms)
        })
        .await
    }

    pub async fn penalize(&self, key: &str) -> Result<(), RateLimitError> {
        self.penalize_at(key, OffsetDateTime::now_utc()).await
    }

    pub async fn penalize_at(&self, key: &str, now: OffsetDateTime) -> Result<(), RateLimitError> {
        let now_ms = unix_ms(now);
        self.update(key, "rate_limit::penalize", |current| {
            (self.policy.penalize(current, now_ms), ())
        })
        .await
    }

    async fn update<T>(
        &self,
        key: &str,
        op: &'static str,
        transition: impl Fn(Option<RateLimitRecord>) -> (RateLimitRecord, T),
    ) -> Result<T, RateLimitError> {
        let ttl = self.policy.ttl();
        let deadline = Instant::now() + CAS_BUDGET;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let current = self.store.get(key).await?;
            let (expected, record) = match current {
                Some(versioned) => (Some(versioned.version), Some(versioned.value)),
                None => (None, None),
            };
            let (next, outcome) = transition(record);
            if self
                .store
                .compare_and_put(key, expected, &next, ttl)
                .await?
            {
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                return Err(RateLimitError::Contended {
                    key: key.to_string(),
                    attempts: attempt,
                });
            }
            debug!(
                target = "application::rate_limit",
                op,
                key,
                attempt,
                "Counter update lost a compare-and-swap race; retrying"
            );
            tokio::time::sleep(cas_backoff(attempt)).await;
        }
    }
}

/// Jittered exponential backoff between lost races.
fn cas_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = CAS_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(CAS_BACKOFF_MAX);
    let ceiling_us = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(rand::random_range(0..=ceiling_us))
}

pub fn render_key(document_id: &str) -> String {
    format!("render:{document_id}")
}

fn unix_ms(now: OffsetDateTime) -> i64 {
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn ms_duration(ms: i64) -> Duration {
    Duration::from_millis(ms.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::counters::MemoryCounterStore;

    fn policy(max_requests: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            window: Duration::from_secs(60),
            max_requests,
            max_penalty: 4,
            ban: Duration::from_secs(600),
        }
    }

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), policy(max_requests))
    }

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + seconds).expect("timestamp")
    }

    #[tokio::test]
    async fn throttles_request_over_the_window_max() {
        let limiter = limiter(3);
        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("render:doc", at(0)).await.expect("check");
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    remaining: expected_remaining
                }
            );
        }

        let decision = limiter.check_at("render:doc", at(10)).await.expect("check");
        assert_eq!(
            decision,
            RateLimitDecision::Throttled {
                retry_after: Duration::from_secs(50),
                banned: false,
            }
        );
    }

    #[tokio::test]
    async fn requests_succeed_again_after_window_elapses() {
        let limiter = limiter(2);
        assert!(limiter.check_at("k", at(0)).await.expect("check").is_allowed());
        assert!(limiter.check_at("k", at(1)).await.expect("check").is_allowed());
        assert!(!limiter.check_at("k", at(2)).await.expect("check").is_allowed());

        assert!(limiter.check_at("k", at(61)).await.expect("check").is_allowed());
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let limiter = limiter(1);
        assert!(limiter.check_at("a", at(0)).await.expect("check").is_allowed());
        assert!(limiter.check_at("b", at(0)).await.expect("check").is_allowed());
        assert!(!limiter.check_at("a", at(0)).await.expect("check").is_allowed());
    }

    #[test]
    fn repeated_throttling_escalates_into_a_ban() {
        let policy = policy(2);
        let mut record = None;
        let mut decisions = Vec::new();
        for _ in 0..5 {
            let (next, decision) = policy.apply(record.take(), 0);
            decisions.push(decision);
            record = Some(next);
        }

        assert!(decisions[0].is_allowed());
        assert!(decisions[1].is_allowed());
        assert_eq!(
            decisions[2],
            RateLimitDecision::Throttled {
                retry_after: Duration::from_secs(60),
                banned: false
            }
        );
        assert!(matches!(
            decisions[3],
            RateLimitDecision::Throttled { banned: false, .. }
        ));
        assert_eq!(
            decisions[4],
            RateLimitDecision::Throttled {
                retry_after: Duration::from_secs(600),
                banned: true
            }
        );

        let banned = record.expect("record");
        let (_, during_ban) = policy.apply(Some(banned.clone()), 120_000);
        assert_eq!(
            during_ban,
            RateLimitDecision::Throttled {
                retry_after: Duration::from_secs(480),
                banned: true
            }
        );

        let (after, decision) = policy.apply(Some(banned), 600_000);
        assert!(decision.is_allowed());
        assert_eq!(after.penalty, 1);
        assert_eq!(after.ban_until_ms, None);
    }

    #[test]
    fn penalty_shrinks_the_next_window_and_decays_when_clean() {
        let policy = policy(4);
        let mut record = None;
        for _ in 0..5 {
            record = Some(policy.apply(record.take(), 0).0);
        }
        let throttled = record.expect("record");
        assert_eq!(throttled.penalty, 2);

        // Next window allows max / penalty requests.
        let (second, first) = policy.apply(Some(throttled), 60_000);
        assert_eq!(first, RateLimitDecision::Allowed { remaining: 1 });
        let (second, decision) = policy.apply(Some(second), 60_001);
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 0 });

        // A window that stayed within its limit halves the penalty.
        let (third, decision) = policy.apply(Some(second), 120_000);
        assert_eq!(third.penalty, 1);
        assert_eq!(decision, RateLimitDecision::Allowed { remaining: 3 });
    }

    /// Adds a round trip to every store call so concurrent updates interleave.
    struct SlowCounters {
        inner: MemoryCounterStore,
        latency: Duration,
    }

    #[async_trait::async_trait]
    impl CounterStore for SlowCounters {
        async fn get(
            &self,
            key: &str,
        ) -> Result<Option<crate::application::repos::Versioned<RateLimitRecord>>, RepoError> {
            tokio::time::sleep(self.latency).await;
            self.inner.get(key).await
        }

        async fn compare_and_put(
            &self,
            key: &str,
            expected: Option<i64>,
            record: &RateLimitRecord,
            ttl: Duration,
        ) -> Result<bool, RepoError> {
            tokio::time::sleep(self.latency).await;
            self.inner.compare_and_put(key, expected, record, ttl).await
        }
    }

    /// Every compare-and-swap loses.
    struct AlwaysStale;

    #[async_trait::async_trait]
    impl CounterStore for AlwaysStale {
        async fn get(
            &self,
            _key: &str,
        ) -> Result<Option<crate::application::repos::Versioned<RateLimitRecord>>, RepoError> {
            Ok(None)
        }

        async fn compare_and_put(
            &self,
            _key: &str,
            _expected: Option<i64>,
            _record: &RateLimitRecord,
            _ttl: Duration,
        ) -> Result<bool, RepoError> {
            Ok(false)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_on_a_hot_key_never_undercount() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(SlowCounters {
                inner: MemoryCounterStore::new(),
                latency: Duration::from_millis(1),
            }),
            policy(10),
        ));

        let checks: Vec<_> = (0..64)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.check_at("render:doc_42", at(0)).await })
            })
            .collect();

        let mut allowed = 0;
        for check in checks {
            match check.await.expect("check task") {
                Ok(decision) if decision.is_allowed() => allowed += 1,
                Ok(_) | Err(RateLimitError::Contended { .. }) => {}
                Err(err) => panic!("unexpected store error: {err}"),
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn endless_contention_is_reported_as_contended() {
        let limiter = RateLimiter::new(Arc::new(AlwaysStale), policy(10));
        let err = limiter
            .check_at("render:doc_42", at(0))
            .await
            .expect_err("never commits");
        match err {
            RateLimitError::Contended { key, attempts } => {
                assert_eq!(key, "render:doc_42");
                assert!(attempts > 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cas_backoff_stays_under_the_ceiling() {
        for attempt in [1, 2, 6, 40] {
            assert!(cas_backoff(attempt) <= CAS_BACKOFF_MAX);
        }
        assert!(cas_backoff(1) <= CAS_BACKOFF_BASE);
    }

    #[test]
    fn penalize_bans_at_the_ceiling() {
        let policy = policy(10);
        let once = policy.penalize(None, 0);
        assert_eq!(once.penalty, 2);
        let twice = policy.penalize(Some(once), 0);
        assert_eq!(twice.penalty, 4);
        let banned = policy.penalize(Some(twice), 0);
        assert_eq!(banned.ban_until_ms, Some(600_000));
    }
}

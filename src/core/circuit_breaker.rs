//! Per-service circuit breakers.
//!
//! Each breaker is a handful of atomics, so the hot path never takes a lock.
//! Failure counting is best effort under concurrency (a racing failure may be
//! counted past the threshold). Admission out of OPEN is not: the right to run
//! the HALF_OPEN trial is claimed with a single compare-and-swap on the
//! `opened_at` timestamp, so exactly one request probes a recovering service.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use scc::HashMap;
use serde::Serialize;

use crate::{config::CircuitBreakerConfig, metrics::set_circuit_state};

const STATE_CLOSED: u8 = 0;
const STATE_HALF_OPEN: u8 = 1;
const STATE_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Point-in-time view of a breaker, for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Returned when a call is refused without touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    /// Reference point for `opened_at_ms`
    epoch: Instant,
    state: AtomicU8,
    failure_count: AtomicU32,
    /// Milliseconds since `epoch` when the circuit opened, or when the
    /// current HALF_OPEN trial was admitted
    opened_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            epoch: Instant::now(),
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            failure_count: self.failure_count(),
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn set_state(&self, state: u8) {
        let previous = self.state.swap(state, Ordering::AcqRel);
        if previous != state {
            tracing::info!(
                "Circuit breaker for {} moved from {} to {}",
                self.service,
                CircuitState::from_u8(previous),
                CircuitState::from_u8(state)
            );
            set_circuit_state(&self.service, f64::from(state));
        }
    }

    /// Ask permission to make a call now.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), CircuitOpen> {
        if self.state.load(Ordering::Acquire) == STATE_CLOSED {
            return Ok(());
        }

        // OPEN, or HALF_OPEN with a trial in flight. Either way the reset
        // timeout must have elapsed since `opened_at_ms` before one more
        // call may go through; a trial that never reported back is
        // superseded after the same timeout.
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let now_ms = self.millis_since_epoch(now);
        let reset_ms = self.reset_timeout.as_millis() as u64;
        if now_ms.saturating_sub(opened_at) < reset_ms {
            return Err(CircuitOpen);
        }

        match self.opened_at_ms.compare_exchange(
            opened_at,
            now_ms,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.set_state(STATE_HALF_OPEN);
                tracing::debug!("Circuit breaker for {} admitted a trial call", self.service);
                Ok(())
            }
            Err(_) => Err(CircuitOpen),
        }
    }

    /// The backend answered (with any status).
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            self.set_state(STATE_CLOSED);
        }
    }

    /// Give back a HALF_OPEN trial that never reached the backend, so the
    /// next call may try again immediately. No-op in any other state.
    pub fn release_trial(&self) {
        self.release_trial_at(Instant::now());
    }

    pub fn release_trial_at(&self, now: Instant) {
        if self.state.load(Ordering::Acquire) != STATE_HALF_OPEN {
            return;
        }
        let reset_ms = self.reset_timeout.as_millis() as u64;
        self.opened_at_ms.store(
            self.millis_since_epoch(now).saturating_sub(reset_ms),
            Ordering::Release,
        );
        self.set_state(STATE_OPEN);
        tracing::debug!(
            "Circuit breaker for {} released an unsent trial call",
            self.service
        );
    }

    /// The backend could not be reached.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let failures = self
            .failure_count
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                self.opened_at_ms
                    .store(self.millis_since_epoch(now), Ordering::Release);
                self.set_state(STATE_OPEN);
                tracing::warn!(
                    "Circuit breaker for {} re-opened after failed trial call",
                    self.service
                );
            }
            STATE_CLOSED if failures >= self.failure_threshold => {
                self.opened_at_ms
                    .store(self.millis_since_epoch(now), Ordering::Release);
                self.set_state(STATE_OPEN);
                tracing::warn!(
                    "Circuit breaker for {} opened after {} consecutive failures",
                    self.service,
                    failures
                );
            }
            _ => {}
        }
    }
}

/// All breakers of one gateway, created lazily on first use of a service name.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Breaker for `service`, created CLOSED if it does not exist yet.
    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.breakers.get_async(service).await {
            return entry.get().clone();
        }

        let entry = self
            .breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config)));
        entry.get().clone()
    }

    pub async fn snapshot(&self, service: &str) -> Option<CircuitSnapshot> {
        self.breakers
            .get_async(service)
            .await
            .map(|entry| entry.get().snapshot())
    }

    pub async fn snapshots(&self) -> BTreeMap<String, CircuitSnapshot> {
        let mut snapshots = BTreeMap::new();
        let snapshots_ref = &mut snapshots;
        self.breakers
            .retain_async(|service, breaker| {
                snapshots_ref.insert(service.clone(), breaker.snapshot());
                true
            })
            .await;
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("user-service", CircuitBreakerConfig::default())
    }

    fn fail_times(breaker: &CircuitBreaker, times: u32, now: Instant) {
        for _ in 0..times {
            assert!(breaker.try_acquire_at(now).is_ok());
            breaker.record_failure_at(now);
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker();
        let t = Instant::now();

        fail_times(&cb, 4, t);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 4);

        fail_times(&cb, 1, t);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire_at(t), Err(CircuitOpen));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker();
        let t = Instant::now();

        fail_times(&cb, 4, t);
        cb.record_success();
        fail_times(&cb, 4, t);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset_timeout_boundary() {
        let cb = breaker();
        let opened = Instant::now();
        fail_times(&cb, 5, opened);

        let reset = Duration::from_secs(60);
        let epsilon = Duration::from_millis(5);
        assert_eq!(cb.try_acquire_at(opened + reset - epsilon), Err(CircuitOpen));

        assert!(cb.try_acquire_at(opened + reset + epsilon).is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);

        // a fresh streak is needed to re-open
        let later = opened + reset + epsilon;
        fail_times(&cb, 4, later);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_times(&cb, 1, later);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = breaker();
        let opened = Instant::now();
        fail_times(&cb, 5, opened);

        let after = opened + Duration::from_secs(61);
        assert!(cb.try_acquire_at(after).is_ok());
        assert_eq!(cb.try_acquire_at(after), Err(CircuitOpen));
        assert_eq!(
            cb.try_acquire_at(after + Duration::from_secs(1)),
            Err(CircuitOpen)
        );
    }

    #[test]
    fn test_failed_trial_reopens_with_new_timestamp() {
        let cb = breaker();
        let opened = Instant::now();
        fail_times(&cb, 5, opened);

        let trial = opened + Duration::from_secs(61);
        assert!(cb.try_acquire_at(trial).is_ok());
        cb.record_failure_at(trial);
        assert_eq!(cb.state(), CircuitState::Open);

        assert_eq!(
            cb.try_acquire_at(trial + Duration::from_secs(59)),
            Err(CircuitOpen)
        );
        assert!(cb.try_acquire_at(trial + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_released_trial_can_be_retried_at_once() {
        let cb = breaker();
        let opened = Instant::now();
        fail_times(&cb, 5, opened);

        let trial = opened + Duration::from_secs(61);
        assert!(cb.try_acquire_at(trial).is_ok());
        assert_eq!(cb.try_acquire_at(trial), Err(CircuitOpen));

        cb.release_trial_at(trial);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire_at(trial).is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.release_trial_at(trial);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_stale_trial_is_superseded() {
        let cb = breaker();
        let opened = Instant::now();
        fail_times(&cb, 5, opened);

        let trial = opened + Duration::from_secs(61);
        assert!(cb.try_acquire_at(trial).is_ok());
        // the trial never reports back
        assert!(cb.try_acquire_at(trial + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_custom_threshold() {
        let cb = CircuitBreaker::new(
            "media-service",
            CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout_secs: 1,
            },
        );
        let t = Instant::now();
        fail_times(&cb, 2, t);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire_at(t + Duration::from_millis(1001)).is_ok());
    }

    #[tokio::test]
    async fn test_registry_creates_lazily_and_shares() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        assert!(registry.is_empty());
        assert!(registry.snapshot("user-service").await.is_none());

        let a = registry.breaker("user-service").await;
        let b = registry.breaker("user-service").await;
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure();
        registry.breaker("event-service").await;

        let snapshots = registry.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots["user-service"].failure_count, 1);
        assert_eq!(snapshots["event-service"].state, CircuitState::Closed);
    }

    #[test]
    fn test_snapshot_serializes_state_names() {
        let json = serde_json::to_value(CircuitSnapshot {
            state: CircuitState::HalfOpen,
            failure_count: 5,
        })
        .unwrap();
        assert_eq!(json["state"], "HALF_OPEN");
        assert_eq!(json["failureCount"], 5);
    }
}

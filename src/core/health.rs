//! Health probing primitives shared by the service registry.
//!
//! A probe is a single GET against `base_url + health_path`. Any answer below
//! 500 counts as healthy (the service is reachable and responding); 5xx,
//! refused connections and timeouts count as unhealthy. Probe failures are
//! classified and recorded, never returned as errors.
use std::{
    sync::RwLock,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    metrics::set_service_health_status,
    ports::http_client::{HttpClient, HttpClientError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl HealthCheckResult {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unknown,
            message: Some(message.into()),
            timestamp: Utc::now(),
            response_time_ms: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Map a probe error onto the message recorded for the service.
pub fn describe_probe_error(err: &HttpClientError) -> String {
    match err {
        HttpClientError::ConnectionRefused(_) => "connection refused".to_string(),
        HttpClientError::Unreachable(_) => "host unreachable".to_string(),
        HttpClientError::Timeout(_) => "health check timeout".to_string(),
        other => other.to_string(),
    }
}

/// Run a single probe against `url`.
pub async fn probe(client: &dyn HttpClient, url: &str, timeout: Duration) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = client.health_check(url, timeout).await;
    let response_time_ms = Some(started.elapsed().as_millis() as u64);

    match outcome {
        Ok(status) if status.as_u16() < 500 => HealthCheckResult {
            status: HealthStatus::Healthy,
            message: status.canonical_reason().map(str::to_string),
            timestamp: Utc::now(),
            response_time_ms,
        },
        Ok(status) => {
            tracing::warn!("Health probe {} answered {}", url, status);
            HealthCheckResult {
                status: HealthStatus::Unhealthy,
                message: Some(format!("backend returned {status}")),
                timestamp: Utc::now(),
                response_time_ms,
            }
        }
        Err(err) => {
            let message = describe_probe_error(&err);
            tracing::error!("Health probe {} failed: {}", url, message);
            HealthCheckResult {
                status: HealthStatus::Unhealthy,
                message: Some(message),
                timestamp: Utc::now(),
                response_time_ms,
            }
        }
    }
}

/// Last known health of one service, written by both the background timer
/// and on-demand probes (last write wins).
#[derive(Debug)]
pub struct ServiceHealth {
    service: String,
    last: RwLock<Option<HealthCheckResult>>,
}

impl ServiceHealth {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            last: RwLock::new(None),
        }
    }

    pub fn last_result(&self) -> Option<HealthCheckResult> {
        match self.last.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn record(&self, result: HealthCheckResult) {
        set_service_health_status(&self.service, result.is_healthy());
        match self.last.write() {
            Ok(mut guard) => *guard = Some(result),
            Err(poisoned) => *poisoned.into_inner() = Some(result),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.last_result().is_some_and(|r| r.is_healthy())
    }

    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        self.last_result().map(|r| r.timestamp)
    }

    /// Whether the last probe is older than `interval` (or never ran).
    pub fn is_stale(&self, interval: Duration, now: DateTime<Utc>) -> bool {
        match self.last_checked_at() {
            None => true,
            Some(checked_at) => {
                let max_age = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
                now - checked_at >= max_age
            }
        }
    }
}

/// Arena of per-service probe timers keyed by service name.
///
/// Stopping a timer always aborts the task before the map entry goes away, so
/// no timer can outlive its registration.
#[derive(Default)]
pub struct ProbeTasks {
    tasks: scc::HashMap<String, JoinHandle<()>>,
}

impl ProbeTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a timer for `service`, cancelling any previous one.
    pub async fn start(&self, service: &str, handle: JoinHandle<()>) {
        self.stop(service).await;
        if let Err((_, handle)) = self.tasks.insert_async(service.to_string(), handle).await {
            // Lost a race with a concurrent registration of the same name.
            handle.abort();
        }
    }

    pub async fn stop(&self, service: &str) -> bool {
        match self.tasks.remove_async(service).await {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        self.tasks
            .retain_async(|_, handle| {
                handle.abort();
                false
            })
            .await;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::{Request, Response, StatusCode};

    use super::*;
    use crate::ports::http_client::HttpClientResult;

    struct FixedProbe(HttpClientResult<StatusCode>);

    #[async_trait]
    impl HttpClient for FixedProbe {
        async fn send_request(
            &self,
            _req: Request<Bytes>,
            _timeout: Duration,
        ) -> HttpClientResult<Response<Bytes>> {
            Err(HttpClientError::InvalidRequest("not used".into()))
        }

        async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            self.0.clone()
        }
    }

    async fn run(outcome: HttpClientResult<StatusCode>) -> HealthCheckResult {
        probe(&FixedProbe(outcome), "http://svc/health", Duration::from_secs(1)).await
    }

    #[tokio::test]
    async fn test_any_status_below_500_is_healthy() {
        assert!(run(Ok(StatusCode::OK)).await.is_healthy());
        assert!(run(Ok(StatusCode::MOVED_PERMANENTLY)).await.is_healthy());
        assert!(run(Ok(StatusCode::NOT_FOUND)).await.is_healthy());
        assert!(!run(Ok(StatusCode::SERVICE_UNAVAILABLE)).await.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_errors_are_classified() {
        let refused = run(Err(HttpClientError::ConnectionRefused("os error 111".into()))).await;
        assert_eq!(refused.status, HealthStatus::Unhealthy);
        assert_eq!(refused.message.as_deref(), Some("connection refused"));

        let timeout = run(Err(HttpClientError::Timeout(Duration::from_secs(5)))).await;
        assert_eq!(timeout.message.as_deref(), Some("health check timeout"));

        let unreachable = run(Err(HttpClientError::Unreachable("dns error".into()))).await;
        assert_eq!(unreachable.message.as_deref(), Some("host unreachable"));

        let other = run(Err(HttpClientError::ConnectionError("reset".into()))).await;
        assert_eq!(other.message.as_deref(), Some("Connection error: reset"));
    }

    #[test]
    fn test_staleness() {
        let health = ServiceHealth::new("user-service");
        assert!(health.is_stale(Duration::from_secs(30), Utc::now()));

        health.record(HealthCheckResult {
            status: HealthStatus::Healthy,
            message: None,
            timestamp: Utc::now(),
            response_time_ms: Some(3),
        });
        assert!(health.is_healthy());
        assert!(!health.is_stale(Duration::from_secs(30), Utc::now()));
        assert!(health.is_stale(
            Duration::from_secs(30),
            Utc::now() + TimeDelta::seconds(31)
        ));
        assert!(health.is_stale(Duration::ZERO, Utc::now()));
    }

    #[tokio::test]
    async fn test_probe_tasks_abort_on_stop() {
        let tasks = ProbeTasks::new();
        let handle = tokio::spawn(std::future::pending::<()>());
        tasks.start("user-service", handle).await;
        assert_eq!(tasks.len(), 1);

        assert!(tasks.stop("user-service").await);
        assert!(!tasks.stop("user-service").await);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_probe_tasks_replace_previous_timer() {
        let tasks = ProbeTasks::new();
        tasks
            .start("media-service", tokio::spawn(std::future::pending::<()>()))
            .await;
        tasks
            .start("media-service", tokio::spawn(std::future::pending::<()>()))
            .await;
        tasks
            .start("event-service", tokio::spawn(std::future::pending::<()>()))
            .await;
        assert_eq!(tasks.len(), 2);

        tasks.stop_all().await;
        assert!(tasks.is_empty());
    }
}

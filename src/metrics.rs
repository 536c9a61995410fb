//! Lightweight metrics helpers for Waypoint.
//!
//! This module exposes a small set of convenience functions and an RAII timer
//! wrapping the `metrics` crate macros. It avoids embedding a concrete
//! exporter (the application can install any compatible recorder) while still
//! describing the dispatch-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `waypoint_forward_requests_total` (counter: service, method, outcome)
//! * `waypoint_forward_duration_seconds` (histogram: service, method)
//! * `waypoint_service_health_status` (gauge per service)
//! * `waypoint_circuit_state` (gauge per service: 0 closed, 1 half-open, 2 open)
//! * `waypoint_cache_requests_total` (counter: result = hit | miss)
//! * `waypoint_cache_invalidated_keys_total` (counter)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const WAYPOINT_FORWARD_REQUESTS_TOTAL: &str = "waypoint_forward_requests_total";
pub const WAYPOINT_FORWARD_DURATION_SECONDS: &str = "waypoint_forward_duration_seconds";
pub const WAYPOINT_SERVICE_HEALTH_STATUS: &str = "waypoint_service_health_status";
pub const WAYPOINT_CIRCUIT_STATE: &str = "waypoint_circuit_state";
pub const WAYPOINT_CACHE_REQUESTS_TOTAL: &str = "waypoint_cache_requests_total";
pub const WAYPOINT_CACHE_INVALIDATED_KEYS_TOTAL: &str = "waypoint_cache_invalidated_keys_total";

/// Storage for service health gauges
pub static SERVICE_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_counter!(
        WAYPOINT_FORWARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests forwarded to backend services."
    );
    describe_histogram!(
        WAYPOINT_FORWARD_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to backend services."
    );
    describe_gauge!(
        WAYPOINT_SERVICE_HEALTH_STATUS,
        "Health status of individual services (1 for healthy, 0 for unhealthy)"
    );
    describe_gauge!(
        WAYPOINT_CIRCUIT_STATE,
        "Circuit breaker state per service (0 closed, 1 half-open, 2 open)"
    );
    describe_counter!(
        WAYPOINT_CACHE_REQUESTS_TOTAL,
        Unit::Count,
        "Response cache lookups by result."
    );
    describe_counter!(
        WAYPOINT_CACHE_INVALIDATED_KEYS_TOTAL,
        Unit::Count,
        "Keys removed by pattern invalidation."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health status gauge for a service.
pub fn set_service_health_status(service: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = SERVICE_HEALTH_GAUGES.lock() {
        gauges.insert(service.to_string(), health_value);
    } else {
        tracing::error!("Failed to acquire lock for service health gauges");
        return;
    }

    gauge!(WAYPOINT_SERVICE_HEALTH_STATUS, "service" => service.to_string()).set(health_value);
}

/// Record the current circuit state for a service.
pub fn set_circuit_state(service: &str, state_value: f64) {
    gauge!(WAYPOINT_CIRCUIT_STATE, "service" => service.to_string()).set(state_value);
}

/// Increment the forwarded request counter with its outcome label.
pub fn increment_forward_total(service: &str, method: &str, outcome: &str) {
    counter!(
        WAYPOINT_FORWARD_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(WAYPOINT_CACHE_REQUESTS_TOTAL, "result" => result).increment(1);
}

pub fn add_invalidated_keys(count: u64) {
    counter!(WAYPOINT_CACHE_INVALIDATED_KEYS_TOTAL).increment(count);
}

/// RAII helper measuring forwarded request duration.
pub struct ForwardTimer {
    start: Instant,
    service: String,
    method: String,
}

impl ForwardTimer {
    pub fn new(service: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            service: service.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for ForwardTimer {
    fn drop(&mut self) {
        histogram!(
            WAYPOINT_FORWARD_DURATION_SECONDS,
            "service" => self.service.clone(),
            "method" => self.method.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Waypoint metrics descriptions");
    Lazy::force(&SERVICE_HEALTH_GAUGES);
    Ok(())
}

/// Collect a snapshot of gauge values used for ad‑hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = SERVICE_HEALTH_GAUGES.lock() {
        for (service, health) in gauges.iter() {
            metrics.insert(format!("service_health_{service}"), *health);
        }
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_service_health_status() {
        set_service_health_status("metrics-test-service", true);
        if let Ok(gauges) = SERVICE_HEALTH_GAUGES.lock() {
            assert_eq!(gauges.get("metrics-test-service"), Some(&1.0));
        }

        set_service_health_status("metrics-test-service", false);
        if let Ok(gauges) = SERVICE_HEALTH_GAUGES.lock() {
            assert_eq!(gauges.get("metrics-test-service"), Some(&0.0));
        }
    }

    #[test]
    fn test_forward_timer_records_on_drop() {
        let timer = ForwardTimer::new("user-service", "GET");
        drop(timer);
    }

    #[test]
    fn test_get_current_metrics() {
        init_metrics().unwrap();
        set_service_health_status("snapshot-service", true);
        let metrics = get_current_metrics();
        assert!(metrics.contains_key("service_health_snapshot-service"));
    }
}

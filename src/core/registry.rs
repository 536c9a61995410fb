//! Health-aware service discovery.
//!
//! The registry maps logical service names to base URLs and keeps one probe
//! timer per service. Timers own an `Arc` of their service entry (never the
//! registry), so unregistering a service is an abort plus a map removal.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use scc::HashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Mutex as TokioMutex, time::MissedTickBehavior};

use crate::{
    config::{GatewayConfig, HealthCheckConfig, ServiceConfig},
    core::{
        backend::BackendUrl,
        cache::ResponseCache,
        health::{HealthCheckResult, ProbeTasks, ServiceHealth, probe},
    },
    ports::http_client::HttpClient,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("Service {0} is not registered")]
    UnknownService(String),

    #[error("Service {0} is unhealthy")]
    ServiceUnhealthy(String),

    #[error("Invalid service definition for {service}: {reason}")]
    InvalidService { service: String, reason: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Public view of one registered backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    pub base_url: String,
    pub health_probe_path: String,
    pub is_healthy: bool,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub health_check_interval_seconds: u64,
}

#[derive(Debug)]
struct RegisteredService {
    name: String,
    base_url: BackendUrl,
    health_path: String,
    interval: Duration,
    health: ServiceHealth,
}

impl RegisteredService {
    fn health_url(&self) -> String {
        self.base_url.join(&self.health_path)
    }

    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            base_url: self.base_url.as_str().to_string(),
            health_probe_path: self.health_path.clone(),
            is_healthy: self.health.is_healthy(),
            last_health_check_at: self.health.last_checked_at(),
            health_check_interval_seconds: self.interval.as_secs(),
        }
    }
}

fn address_key(service: &str) -> String {
    format!("service:{service}")
}

pub struct ServiceRegistry {
    services: HashMap<String, Arc<RegisteredService>>,
    probes: ProbeTasks,
    /// Held across a whole (un)registration so the installed entry and its
    /// timer always belong together
    registrations: TokioMutex<()>,
    http_client: Arc<dyn HttpClient>,
    cache: ResponseCache,
    health_config: HealthCheckConfig,
}

impl ServiceRegistry {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        cache: ResponseCache,
        health_config: HealthCheckConfig,
    ) -> Self {
        Self {
            services: HashMap::new(),
            probes: ProbeTasks::new(),
            registrations: TokioMutex::new(()),
            http_client,
            cache,
            health_config,
        }
    }

    /// Build a registry and register (and start probing) every configured service.
    pub async fn from_config(
        config: &GatewayConfig,
        http_client: Arc<dyn HttpClient>,
        cache: ResponseCache,
    ) -> RegistryResult<Self> {
        let registry = Self::new(http_client, cache, config.health_check.clone());
        for service in &config.services {
            registry.register_service(service.clone()).await?;
        }
        tracing::info!(
            "Service registry initialized with {} services",
            registry.services.len()
        );
        Ok(registry)
    }

    /// Add or replace a service. Replacing stops the old probe timer and
    /// evicts the memoized address before the new entry becomes visible.
    pub async fn register_service(&self, config: ServiceConfig) -> RegistryResult<()> {
        let base_url = BackendUrl::new(&config.url).map_err(|e| RegistryError::InvalidService {
            service: config.name.clone(),
            reason: e.to_string(),
        })?;

        let entry = Arc::new(RegisteredService {
            health: ServiceHealth::new(config.name.clone()),
            name: config.name,
            base_url,
            health_path: config.health_path,
            interval: Duration::from_secs(config.health_check_interval_secs),
        });
        let name = entry.name.clone();

        let _registration = self.registrations.lock().await;
        if self.services.remove_async(&name).await.is_some() {
            self.probes.stop(&name).await;
            tracing::info!("Replacing registration of service {}", name);
        }
        self.cache.delete(&address_key(&name)).await;
        self.services.upsert_async(name.clone(), entry.clone()).await;

        tracing::info!(
            "Registered service {} at {}",
            name,
            entry.base_url.as_str()
        );
        self.start_probing(entry).await;
        Ok(())
    }

    /// Timer period for `service`; zero means health is re-checked on every
    /// healthy-address resolution instead.
    fn periodic_interval(&self, service: &RegisteredService) -> Duration {
        if self.health_config.enabled {
            service.interval
        } else {
            Duration::ZERO
        }
    }

    async fn start_probing(&self, service: Arc<RegisteredService>) {
        if self.periodic_interval(&service).is_zero() {
            tracing::debug!("Periodic health probing disabled for {}", service.name);
            return;
        }

        let client = self.http_client.clone();
        let timeout = self.health_config.timeout();
        let name = service.name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // the first tick completes immediately
                ticker.tick().await;
                let result = probe(client.as_ref(), &service.health_url(), timeout).await;
                tracing::debug!("Health of {}: {}", service.name, result.status);
                service.health.record(result);
            }
        });
        self.probes.start(&name, handle).await;
    }

    /// Remove a service, stop its probing and evict its memoized address.
    pub async fn unregister_service(&self, name: &str) -> bool {
        let _registration = self.registrations.lock().await;
        self.probes.stop(name).await;
        let removed = self.services.remove_async(name).await.is_some();
        self.cache.delete(&address_key(name)).await;
        if removed {
            tracing::info!("Unregistered service {}", name);
        }
        removed
    }

    async fn lookup(&self, name: &str) -> RegistryResult<Arc<RegisteredService>> {
        self.services
            .get_async(name)
            .await
            .map(|entry| entry.get().clone())
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.services.get_async(name).await.is_some()
    }

    /// Base URL for `name`, memoized in the cache store.
    pub async fn resolve_address(&self, name: &str) -> RegistryResult<String> {
        let key = address_key(name);
        if let Some(url) = self.cache.get::<String>(&key).await {
            return Ok(url);
        }

        let service = self.lookup(name).await?;
        let url = service.base_url.as_str().to_string();
        self.cache
            .set(&key, &url, Some(self.health_config.address_cache_ttl()))
            .await;
        Ok(url)
    }

    /// Base URL for `name`, only if its latest probe (re-run when stale) is healthy.
    pub async fn resolve_healthy_address(&self, name: &str) -> RegistryResult<String> {
        let service = self.lookup(name).await?;

        if service
            .health
            .is_stale(self.periodic_interval(&service), Utc::now())
        {
            tracing::debug!("Health of {} is stale, probing before dispatch", name);
            self.probe_service(&service).await;
        }

        if !service.health.is_healthy() {
            return Err(RegistryError::ServiceUnhealthy(name.to_string()));
        }

        self.resolve_address(name).await
    }

    async fn probe_service(&self, service: &RegisteredService) -> HealthCheckResult {
        let result = probe(
            self.http_client.as_ref(),
            &service.health_url(),
            self.health_config.timeout(),
        )
        .await;
        service.health.record(result.clone());
        result
    }

    /// Probe `name` right now. Unknown services report `unknown`.
    pub async fn check_service_health(&self, name: &str) -> HealthCheckResult {
        match self.lookup(name).await {
            Ok(service) => self.probe_service(&service).await,
            Err(e) => HealthCheckResult::unknown(e.to_string()),
        }
    }

    /// Drop the memoized address so the next resolution re-reads the descriptor.
    pub async fn refresh_address_cache(&self, name: &str) {
        self.cache.delete(&address_key(name)).await;
    }

    async fn entries(&self) -> Vec<Arc<RegisteredService>> {
        let mut entries = Vec::new();
        let entries_ref = &mut entries;
        self.services
            .retain_async(|_, service| {
                entries_ref.push(service.clone());
                true
            })
            .await;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn list_services(&self) -> Vec<ServiceDescriptor> {
        self.entries()
            .await
            .iter()
            .map(|service| service.descriptor())
            .collect()
    }

    /// Last probe result of every service, without probing.
    pub async fn aggregate_health(&self) -> BTreeMap<String, HealthCheckResult> {
        self.entries()
            .await
            .into_iter()
            .map(|service| {
                let result = service
                    .health
                    .last_result()
                    .unwrap_or_else(|| HealthCheckResult::unknown("No health check performed yet"));
                (service.name.clone(), result)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn active_probes(&self) -> usize {
        self.probes.len()
    }

    /// Cancel every probe timer.
    pub async fn shutdown(&self) {
        self.probes.stop_all().await;
        tracing::info!("Service registry stopped all health probes");
    }
}

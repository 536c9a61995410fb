//! Circuit-breaking request forwarder.
//!
//! `forward` resolves a healthy address, consults the service's breaker and
//! performs the call. Only network-layer failures count against the breaker;
//! a backend that answers with an error status is reachable, and its
//! response is handed back unchanged as [`DispatchError::Backend`].
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, header};
use serde::Serialize;
use tracing::Instrument;

use crate::{
    config::ProxyConfig,
    core::{circuit_breaker::CircuitBreakerRegistry, error::DispatchError, registry::ServiceRegistry},
    metrics::{ForwardTimer, increment_forward_total},
    ports::http_client::{HttpClient, HttpClientError},
};

/// One outbound call, relative to a service's base URL.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path (and query) appended to the service base URL
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: HeaderMap,
    /// Overrides the forwarder's default timeout
    pub timeout: Option<Duration>,
}

impl ForwardRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, DispatchError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| DispatchError::Internal(format!("Failed to encode request body: {e}")))?;
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct Forwarder {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    http_client: Arc<dyn HttpClient>,
    default_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        http_client: Arc<dyn HttpClient>,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            http_client,
            default_timeout: config.default_timeout(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Forward and return the body of a 2xx response.
    pub async fn forward(&self, service: &str, request: ForwardRequest) -> Result<Bytes, DispatchError> {
        self.send(service, request)
            .await
            .map(|response| response.into_body())
    }

    /// Forward and return the whole 2xx response (status and headers included).
    pub async fn send(
        &self,
        service: &str,
        request: ForwardRequest,
    ) -> Result<Response<Bytes>, DispatchError> {
        let span = tracing::info_span!(
            "forward",
            service = %service,
            method = %request.method,
            path = %request.path
        );
        let method = request.method.clone();
        let result = self.dispatch(service, request).instrument(span).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(DispatchError::Backend { .. }) => "backend_error",
            Err(DispatchError::ServiceUnavailable(_)) => "unavailable",
            Err(DispatchError::GatewayTimeout(_)) => "timeout",
            Err(DispatchError::BadGateway(_)) => "bad_gateway",
            Err(_) => "internal",
        };
        increment_forward_total(service, method.as_str(), outcome);
        result
    }

    async fn dispatch(
        &self,
        service: &str,
        request: ForwardRequest,
    ) -> Result<Response<Bytes>, DispatchError> {
        let _timer = ForwardTimer::new(service, request.method.as_str());

        let base_url = self.registry.resolve_healthy_address(service).await.map_err(|e| {
            tracing::warn!("Cannot dispatch to {}: {}", service, e);
            DispatchError::from(e)
        })?;

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let outbound = build_request(&base_url, request)?;

        let breaker = self.breakers.breaker(service).await;
        if breaker.try_acquire().is_err() {
            tracing::warn!("Circuit breaker is open for {}, failing fast", service);
            return Err(DispatchError::ServiceUnavailable(format!(
                "Circuit breaker is open for {service}"
            )));
        }

        tracing::debug!("Forwarding {} {}", outbound.method(), outbound.uri());

        match self.http_client.send_request(outbound, timeout).await {
            Ok(response) => {
                breaker.record_success();
                if response.status().is_success() {
                    Ok(response)
                } else {
                    let status = response.status();
                    tracing::debug!("{} answered {}", service, status);
                    Err(DispatchError::Backend {
                        status,
                        body: response.into_body(),
                    })
                }
            }
            Err(err) => {
                if err.is_network_failure() {
                    breaker.record_failure();
                } else {
                    // the request never left the gateway, so a trial call proved nothing
                    breaker.release_trial();
                }
                Err(classify_failure(service, err))
            }
        }
    }

    pub async fn get(&self, service: &str, path: &str) -> Result<Bytes, DispatchError> {
        self.forward(service, ForwardRequest::new(Method::GET, path))
            .await
    }

    pub async fn post(
        &self,
        service: &str,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, DispatchError> {
        self.forward(service, with_body(Method::POST, path, body))
            .await
    }

    pub async fn put(
        &self,
        service: &str,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, DispatchError> {
        self.forward(service, with_body(Method::PUT, path, body))
            .await
    }

    pub async fn patch(
        &self,
        service: &str,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Bytes, DispatchError> {
        self.forward(service, with_body(Method::PATCH, path, body))
            .await
    }

    pub async fn delete(&self, service: &str, path: &str) -> Result<Bytes, DispatchError> {
        self.forward(service, ForwardRequest::new(Method::DELETE, path))
            .await
    }
}

fn with_body(method: Method, path: &str, body: Option<Bytes>) -> ForwardRequest {
    let request = ForwardRequest::new(method, path);
    match body {
        Some(body) => request.body(body),
        None => request,
    }
}

fn build_request(base_url: &str, request: ForwardRequest) -> Result<Request<Bytes>, DispatchError> {
    let uri = if request.path.starts_with('/') {
        format!("{base_url}{}", request.path)
    } else {
        format!("{base_url}/{}", request.path)
    };

    let has_body = request.body.is_some();
    let mut builder = Request::builder().method(request.method).uri(&uri);
    if let Some(headers) = builder.headers_mut() {
        *headers = request.headers;
        if has_body && !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
    }

    builder
        .body(request.body.unwrap_or_default())
        .map_err(|e| DispatchError::Internal(format!("Failed to build request for {uri}: {e}")))
}

fn classify_failure(service: &str, err: HttpClientError) -> DispatchError {
    match err {
        HttpClientError::ConnectionRefused(detail) | HttpClientError::Unreachable(detail) => {
            tracing::error!("Cannot connect to {}: {}", service, detail);
            DispatchError::ServiceUnavailable(format!("Service {service} is unavailable"))
        }
        HttpClientError::Timeout(after) => {
            tracing::error!("Request to {} timed out after {:?}", service, after);
            DispatchError::GatewayTimeout(format!("Service {service} timed out"))
        }
        other => {
            tracing::error!("Request to {} failed: {}", service, other);
            DispatchError::Internal(format!("Request to {service} failed: {other}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use http::StatusCode;

    use super::*;
    use crate::{
        adapters::memory_store::MemoryCacheStore,
        config::{CacheConfig, CircuitBreakerConfig, HealthCheckConfig, ServiceConfig},
        core::{cache::ResponseCache, circuit_breaker::CircuitState},
        ports::http_client::HttpClientResult,
    };

    /// Backend whose health probes always pass and whose responses are scripted.
    struct ScriptedBackend {
        outcome: Mutex<HttpClientResult<(StatusCode, &'static str)>>,
        calls: AtomicUsize,
        last_request: Mutex<Option<Request<Bytes>>>,
    }

    impl ScriptedBackend {
        fn new(outcome: HttpClientResult<(StatusCode, &'static str)>) -> Arc<Self> {
            Arc::new(Self {
                outcome: Mutex::new(outcome),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn answer(&self, outcome: HttpClientResult<(StatusCode, &'static str)>) {
            *self.outcome.lock().unwrap() = outcome;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedBackend {
        async fn send_request(
            &self,
            req: Request<Bytes>,
            _timeout: Duration,
        ) -> HttpClientResult<Response<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(req);
            let (status, body) = self.outcome.lock().unwrap().clone()?;
            Ok(Response::builder()
                .status(status)
                .body(Bytes::from_static(body.as_bytes()))
                .unwrap())
        }

        async fn health_check(&self, _url: &str, _timeout: Duration) -> HttpClientResult<StatusCode> {
            Ok(StatusCode::OK)
        }
    }

    async fn forwarder_for(backend: Arc<ScriptedBackend>) -> Forwarder {
        let cache = ResponseCache::new(Arc::new(MemoryCacheStore::new()), &CacheConfig::default());
        let registry = ServiceRegistry::new(backend.clone(), cache, HealthCheckConfig::default());
        registry
            .register_service(ServiceConfig {
                health_check_interval_secs: 0,
                ..ServiceConfig::new("user-service", "http://users.internal:3001")
            })
            .await
            .unwrap();

        Forwarder::new(
            Arc::new(registry),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            backend,
            &ProxyConfig::default(),
        )
    }

    fn refused() -> HttpClientResult<(StatusCode, &'static str)> {
        Err(HttpClientError::ConnectionRefused("os error 111".into()))
    }

    #[tokio::test]
    async fn test_successful_forward_returns_body() {
        let backend = ScriptedBackend::new(Ok((StatusCode::OK, r#"{"id":1}"#)));
        let forwarder = forwarder_for(backend.clone()).await;

        let body = forwarder
            .post("user-service", "/users", Some(Bytes::from_static(b"{}")))
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"id":1}"#);

        let request = backend.last_request.lock().unwrap().take().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "http://users.internal:3001/users");
        assert_eq!(request.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_sixth_attempt_fails_fast_after_five_failures() {
        let backend = ScriptedBackend::new(refused());
        let forwarder = forwarder_for(backend.clone()).await;

        for _ in 0..5 {
            let err = forwarder.get("user-service", "/users").await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }
        assert_eq!(backend.calls(), 5);

        let err = forwarder.get("user-service", "/users").await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::ServiceUnavailable("Circuit breaker is open for user-service".into())
        );
        assert_eq!(backend.calls(), 5);

        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unbuildable_request_never_consults_the_breaker() {
        let backend = ScriptedBackend::new(refused());
        let forwarder = forwarder_for(backend.clone()).await;
        for _ in 0..5 {
            forwarder.get("user-service", "/users").await.unwrap_err();
        }

        let err = forwarder.get("user-service", "/bad path").await.unwrap_err();
        assert!(matches!(err, DispatchError::Internal(_)));
        assert_eq!(backend.calls(), 5);

        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 5);
    }

    #[tokio::test]
    async fn test_error_status_is_passed_through_without_counting() {
        let backend = ScriptedBackend::new(Ok((StatusCode::NOT_FOUND, r#"{"message":"no such user"}"#)));
        let forwarder = forwarder_for(backend.clone()).await;

        for _ in 0..10 {
            let err = forwarder.get("user-service", "/users/42").await.unwrap_err();
            assert_eq!(
                err,
                DispatchError::Backend {
                    status: StatusCode::NOT_FOUND,
                    body: Bytes::from_static(br#"{"message":"no such user"}"#),
                }
            );
        }
        assert_eq!(backend.calls(), 10);

        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let backend = ScriptedBackend::new(Err(HttpClientError::Timeout(Duration::from_secs(30))));
        let forwarder = forwarder_for(backend.clone()).await;

        let err = forwarder.get("user-service", "/slow").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);

        backend.answer(Err(HttpClientError::Unreachable(
            "GET http://users.internal:3001/users: client error (Connect) (dns error)".into(),
        )));
        let err = forwarder.get("user-service", "/users").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            err,
            DispatchError::ServiceUnavailable("Service user-service is unavailable".into())
        );

        backend.answer(Err(HttpClientError::ConnectionError("connection reset".into())));
        let err = forwarder.get("user-service", "/users").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        // all three count as network failures
        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.failure_count, 3);

        backend.answer(Err(HttpClientError::InvalidRequest("bad uri".into())));
        forwarder.get("user-service", "/users").await.unwrap_err();
        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.failure_count, 3);
    }

    #[tokio::test]
    async fn test_success_resets_breaker_counter() {
        let backend = ScriptedBackend::new(refused());
        let forwarder = forwarder_for(backend.clone()).await;

        for _ in 0..4 {
            forwarder.get("user-service", "/users").await.unwrap_err();
        }
        backend.answer(Ok((StatusCode::OK, "[]")));
        forwarder.get("user-service", "/users").await.unwrap();

        backend.answer(refused());
        for _ in 0..4 {
            forwarder.get("user-service", "/users").await.unwrap_err();
        }
        let snapshot = forwarder.breakers().snapshot("user-service").await.unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_service_is_bad_gateway_and_never_creates_breaker() {
        let backend = ScriptedBackend::new(Ok((StatusCode::OK, "")));
        let forwarder = forwarder_for(backend.clone()).await;

        let err = forwarder.get("ghost-service", "/").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(forwarder.breakers().snapshot("ghost-service").await.is_none());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_builder_and_json_body() {
        let backend = ScriptedBackend::new(Ok((StatusCode::CREATED, "{}")));
        let forwarder = forwarder_for(backend.clone()).await;

        let request = ForwardRequest::new(Method::PATCH, "aquariums/7")
            .json(&serde_json::json!({"volumeLiters": 120}))
            .unwrap()
            .header(
                header::AUTHORIZATION,
                HeaderValue::from_static("Bearer token"),
            )
            .timeout(Duration::from_secs(2));
        forwarder.forward("user-service", request).await.unwrap();

        let sent = backend.last_request.lock().unwrap().take().unwrap();
        assert_eq!(sent.uri(), "http://users.internal:3001/aquariums/7");
        assert_eq!(sent.headers()[header::AUTHORIZATION], "Bearer token");
        assert_eq!(&sent.body()[..], br#"{"volumeLiters":120}"#);
    }
}

//! HTTP surface of the gateway.
//!
//! * `GET /health`: liveness
//! * `GET /health/services`: last probe of every service (503 if any is not healthy)
//! * `GET /services`: descriptors with their circuit state
//! * `ANY /api/{service}/{*path}`: version negotiation, then dispatch. Reads go
//!   through the response cache, writes invalidate the service's cached reads.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    Extension, Json, Router,
    body::Body as AxumBody,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    adapters::middleware::{request_timing_middleware, version_negotiation_middleware},
    config::GatewayConfig,
    core::{
        CircuitSnapshot, DispatchError, ForwardRequest, Forwarder, ResponseCache,
        ServiceDescriptor, VersionContext, VersionNegotiator, VersionRequirement,
    },
    tracing_setup::create_request_span,
};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Shared state of the router.
#[derive(Clone)]
pub struct HttpHandler {
    forwarder: Arc<Forwarder>,
    cache: ResponseCache,
    negotiator: Arc<VersionNegotiator>,
    requirements: Arc<HashMap<String, VersionRequirement>>,
}

/// A cached 2xx backend response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: String,
}

impl CachedResponse {
    /// Only textual bodies are cached; `None` for anything else.
    fn from_response(response: &axum::http::Response<Bytes>) -> Option<Self> {
        let body = std::str::from_utf8(response.body()).ok()?.to_string();
        Some(Self {
            status: response.status().as_u16(),
            content_type: response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        })
    }

    fn into_response(self, cache_state: &'static str) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        if let Some(value) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(X_CACHE, HeaderValue::from_static(cache_state));
        response
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStatus {
    #[serde(flatten)]
    descriptor: ServiceDescriptor,
    circuit: Option<CircuitSnapshot>,
}

impl HttpHandler {
    pub fn new(
        forwarder: Arc<Forwarder>,
        cache: ResponseCache,
        negotiator: Arc<VersionNegotiator>,
    ) -> Self {
        Self {
            forwarder,
            cache,
            negotiator,
            requirements: Arc::default(),
        }
    }

    /// Restrict `/api/{service}` to the versions each service declares.
    pub fn with_version_requirements(mut self, config: &GatewayConfig) -> Self {
        let requirements = config
            .services
            .iter()
            .filter(|service| !service.versions.is_empty())
            .map(|service| {
                (
                    service.name.clone(),
                    VersionRequirement::new(service.versions.clone(), &config.versioning.prefix),
                )
            })
            .collect();
        self.requirements = Arc::new(requirements);
        self
    }

    /// Build the axum router serving the gateway.
    pub fn router(self) -> Router {
        let api = Router::new()
            .route("/api/{service}", any(proxy_root))
            .route("/api/{service}/{*path}", any(proxy))
            .route_layer(middleware::from_fn_with_state(
                self.negotiator.clone(),
                version_negotiation_middleware,
            ));

        Router::new()
            .route("/health", get(liveness))
            .route("/health/services", get(services_health))
            .route("/services", get(list_services))
            .merge(api)
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn services_health(State(state): State<HttpHandler>) -> Response {
    let health = state.forwarder.registry().aggregate_health().await;
    let all_healthy = health.values().all(|result| result.is_healthy());
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if all_healthy { "healthy" } else { "degraded" },
            "services": health,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

async fn list_services(State(state): State<HttpHandler>) -> Json<Vec<ServiceStatus>> {
    let descriptors = state.forwarder.registry().list_services().await;
    let mut circuits: BTreeMap<String, CircuitSnapshot> = state.forwarder.breakers().snapshots().await;

    Json(
        descriptors
            .into_iter()
            .map(|descriptor| ServiceStatus {
                circuit: circuits.remove(&descriptor.name),
                descriptor,
            })
            .collect(),
    )
}

async fn proxy_root(
    State(state): State<HttpHandler>,
    Path(service): Path<String>,
    Extension(version): Extension<VersionContext>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = create_request_span(method.as_str(), uri.path(), &service);
    dispatch(state, service, String::new(), version, method, uri, headers, body)
        .instrument(span)
        .await
}

async fn proxy(
    State(state): State<HttpHandler>,
    Path((service, path)): Path<(String, String)>,
    Extension(version): Extension<VersionContext>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = create_request_span(method.as_str(), uri.path(), &service);
    dispatch(state, service, path, version, method, uri, headers, body)
        .instrument(span)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: HttpHandler,
    service: String,
    path: String,
    version: VersionContext,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::Span::current();
    span.record("api.version", version.version());

    if let Some(requirement) = state.requirements.get(&service) {
        if let Err(err) = requirement.check(&version) {
            tracing::debug!("{} {} rejected for {}: {}", method, uri, service, err);
            return err.into_response();
        }
    }

    let target = match uri.query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };

    let mut request = ForwardRequest::new(method.clone(), target.clone())
        .headers(forwardable_headers(&headers));
    if let Ok(value) = HeaderValue::from_str(version.version()) {
        request = request.header(HeaderName::from_static("x-api-version"), value);
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let result = if method == Method::GET && is_cacheable(&headers) {
        let key = format!("{service}:v{}:{target}", version.version());
        cached_get(&state, &service, &key, request).await
    } else {
        span.record("cache", "BYPASS");
        let result = state
            .forwarder
            .send(&service, request)
            .await
            .map(into_axum_response);
        if result.is_ok() && method != Method::GET && method != Method::HEAD {
            state.cache.invalidate_pattern(&format!("{service}:*")).await;
        }
        result
    };

    result.unwrap_or_else(IntoResponse::into_response)
}

async fn cached_get(
    state: &HttpHandler,
    service: &str,
    key: &str,
    request: ForwardRequest,
) -> Result<Response, DispatchError> {
    let mut fetched = false;
    let mut uncacheable = None;
    let (fetched_flag, slot) = (&mut fetched, &mut uncacheable);
    let forwarder = state.forwarder.clone();

    let cached = state
        .cache
        .try_remember(key, None, move || async move {
            *fetched_flag = true;
            let response = forwarder.send(service, request).await?;
            match CachedResponse::from_response(&response) {
                Some(cached) => Ok::<_, DispatchError>(Some(cached)),
                None => {
                    *slot = Some(response);
                    Ok(None)
                }
            }
        })
        .await?;

    if let Some(response) = uncacheable {
        tracing::Span::current().record("cache", "UNCACHEABLE");
        return Ok(into_axum_response(response));
    }
    let cache_state = if fetched { "MISS" } else { "HIT" };
    tracing::Span::current().record("cache", cache_state);
    match cached {
        Some(cached) => Ok(cached.into_response(cache_state)),
        None => Err(DispatchError::Internal(format!(
            "Empty response for cached read of {key}"
        ))),
    }
}

/// Reads carrying credentials are never shared through the cache.
fn is_cacheable(headers: &HeaderMap) -> bool {
    !headers.contains_key(header::AUTHORIZATION) && !headers.contains_key(header::COOKIE)
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(name);
    }
    forwarded
}

fn into_axum_response(response: axum::http::Response<Bytes>) -> Response {
    let (mut parts, body) = response.into_parts();
    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }
    Response::from_parts(parts, AxumBody::from(body))
}

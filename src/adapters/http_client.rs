use std::{error::Error as StdError, io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Request, Response, StatusCode, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Adds a small set of default headers
/// * Buffers request and response bodies (the forwarder deals in `Bytes`)
/// * Applies the per-call timeout to the whole exchange, body included
/// * Tells refused connections apart from other network failures
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    probe_client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

fn https_connector() -> HttpsConnector<HttpConnector> {
    let mut http_connector = HttpConnector::new();
    http_connector.enforce_http(false);

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();

    if !native_certs.certs.is_empty() {
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
    }

    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector)
}

/// Walk the error's source chain looking for a refused TCP connect.
fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn classify(err: hyper_util::client::legacy::Error, target: &str) -> HttpClientError {
    if is_connection_refused(&err) {
        return HttpClientError::ConnectionRefused(format!("{target}: {err}"));
    }

    let detail = match err.source() {
        Some(source) => format!("{target}: {err} ({source})"),
        None => format!("{target}: {err}"),
    };
    // DNS and TCP connect failures surface as connect errors
    if err.is_connect() {
        HttpClientError::Unreachable(detail)
    } else {
        HttpClientError::ConnectionError(detail)
    }
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let client = Client::builder(TokioExecutor::new()).build(https_connector());
        let probe_client = Client::builder(TokioExecutor::new()).build(https_connector());

        tracing::info!("Created HTTP client for backend services");
        Ok(Self {
            client,
            probe_client,
        })
    }

    /// Inject a consistent set of headers if absent (User-Agent, Accept).
    fn add_common_headers(req: &mut Request<Bytes>) {
        let headers = req.headers_mut();
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(
                header::USER_AGENT,
                HeaderValue::from_static("Waypoint-Gateway/1.0"),
            );
        }
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<Bytes>,
        request_timeout: Duration,
    ) -> HttpClientResult<Response<Bytes>> {
        Self::add_common_headers(&mut req);

        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        }

        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let span = tracing::info_span!(
            "backend_request",
            backend.url = %backend_identifier,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let target = format!("{} {}", parts.method, parts.uri);
        tracing::debug!(parent: &span, "Sending request: {}", target);

        let outgoing = Request::from_parts(parts, Full::new(body));
        let exchange = async {
            let response = self
                .client
                .request(outgoing)
                .await
                .map_err(|e| classify(e, &target))?;
            let (mut parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| {
                    HttpClientError::ConnectionError(format!(
                        "{target}: failed to read response body: {e}"
                    ))
                })?
                .to_bytes();
            // the body is buffered, so the original framing no longer applies
            parts.headers.remove(header::TRANSFER_ENCODING);
            Ok::<_, HttpClientError>(Response::from_parts(parts, body))
        };

        match timeout(request_timeout, exchange).await {
            Ok(Ok(response)) => {
                span.record("http.status_code", response.status().as_u16());
                Ok(response)
            }
            Ok(Err(err)) => {
                span.record("http.status_code", 599u16);
                tracing::error!(parent: &span, "Error making request to backend {}: {}", backend_identifier, err);
                Err(err)
            }
            Err(_) => {
                span.record("http.status_code", 504u16);
                tracing::error!(parent: &span, "Request to {} timed out after {:?}", target, request_timeout);
                Err(HttpClientError::Timeout(request_timeout))
            }
        }
    }

    async fn health_check(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<StatusCode> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, "Waypoint-Gateway/1.0")
            .body(Empty::<Bytes>::new())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Health checking URL: {}", url);

        match timeout(probe_timeout, self.probe_client.request(request)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                // Consume the body to release the connection
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} answered {}", url, status);
                Ok(status)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Err(classify(err, url))
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(probe_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        let client = HttpClientAdapter::new();
        assert!(client.is_ok());
    }

    #[test]
    fn test_add_common_headers() {
        let mut req = Request::builder()
            .uri("https://example.com")
            .header(header::ACCEPT, "text/plain")
            .body(Bytes::new())
            .unwrap();

        HttpClientAdapter::add_common_headers(&mut req);

        let headers = req.headers();
        assert_eq!(headers[header::USER_AGENT], "Waypoint-Gateway/1.0");
        assert_eq!(headers[header::ACCEPT], "text/plain");
    }

    #[test]
    fn test_refused_detection_walks_source_chain() {
        #[derive(Debug)]
        struct Wrapper(io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "client error (Connect)")
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let refused = Wrapper(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(is_connection_refused(&refused));

        let reset = Wrapper(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!is_connection_refused(&reset));
    }

    #[tokio::test]
    async fn test_request_without_host_is_invalid() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder().uri("/relative").body(Bytes::new()).unwrap();
        let result = client.send_request(req, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(HttpClientError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // bind then drop to get a local port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClientAdapter::new().unwrap();
        let result = client
            .health_check(&format!("http://127.0.0.1:{port}/health"), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(HttpClientError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_unreachable() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("http://no-such-host.invalid/users")
            .body(Bytes::new())
            .unwrap();
        let result = client.send_request(req, Duration::from_secs(5)).await;
        assert!(
            matches!(result, Err(HttpClientError::Unreachable(_))),
            "unexpected result: {result:?}"
        );
    }
}

//! Gateway-level error kinds surfaced by the forwarder.
//!
//! Discovery, breaker and transport failures are folded into this small set
//! so handlers only distinguish "service down", "rejected by the service" and
//! "internal".
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::core::registry::RegistryError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// Discovery failed (unknown service or misconfiguration)
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// Circuit open, service unhealthy or connection refused
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    /// The backend answered with a non-2xx status; passed through verbatim
    #[error("Backend responded with {status}")]
    Backend { status: StatusCode, body: Bytes },

    #[error("Internal dispatch error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            DispatchError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Backend { status, .. } => *status,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::ServiceUnavailable(_) | DispatchError::GatewayTimeout(_)
        )
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ServiceUnhealthy(service) => {
                DispatchError::ServiceUnavailable(format!("Service {service} is unhealthy"))
            }
            other => DispatchError::BadGateway(other.to_string()),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::Backend { status, body } => {
                let mut response = (status, body).into_response();
                // the backend body is opaque; do not claim a text content type
                response.headers_mut().remove(http::header::CONTENT_TYPE);
                response
            }
            DispatchError::Internal(detail) => {
                tracing::error!("Internal dispatch error: {}", detail);
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (
                    status,
                    Json(json!({
                        "statusCode": status.as_u16(),
                        "message": "Internal server error",
                    })),
                )
                    .into_response()
            }
            other => {
                let status = other.status_code();
                let message = match other {
                    DispatchError::BadGateway(message)
                    | DispatchError::ServiceUnavailable(message)
                    | DispatchError::GatewayTimeout(message) => message,
                    other => other.to_string(),
                };
                (
                    status,
                    Json(json!({
                        "statusCode": status.as_u16(),
                        "message": message,
                    })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn test_registry_errors_map_to_gateway_kinds() {
        let unknown: DispatchError = RegistryError::UnknownService("ghost".into()).into();
        assert_eq!(unknown.status_code(), StatusCode::BAD_GATEWAY);

        let unhealthy: DispatchError = RegistryError::ServiceUnhealthy("user-service".into()).into();
        assert_eq!(unhealthy.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(unhealthy.is_transient());
    }

    #[tokio::test]
    async fn test_backend_error_passes_through() {
        let err = DispatchError::Backend {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: Bytes::from_static(b"{\"error\":\"ph out of range\"}"),
        };
        assert!(!err.is_transient());

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"error\":\"ph out of range\"}");
    }

    #[tokio::test]
    async fn test_gateway_errors_render_json() {
        let response = DispatchError::GatewayTimeout("user-service".into()).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["statusCode"], 504);
        assert_eq!(json["message"], "user-service");
    }

    #[tokio::test]
    async fn test_rendered_message_has_no_kind_prefix() {
        let response =
            DispatchError::ServiceUnavailable("Circuit breaker is open for user-service".into())
                .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["statusCode"], 503);
        assert_eq!(json["message"], "Circuit breaker is open for user-service");
    }

    #[tokio::test]
    async fn test_internal_errors_hide_detail() {
        let response = DispatchError::Internal("hyper exploded".into()).into_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Internal server error");
    }
}

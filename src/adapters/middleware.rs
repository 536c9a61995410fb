//! Axum middleware used by the gateway router.
//!
//! Version negotiation runs once per request: the resulting
//! [`VersionContext`] is stored in the request extensions for handlers and the
//! response is decorated with the version and deprecation headers.
use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Request, State},
    http::header::USER_AGENT,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::core::versioning::{VersionContext, VersionNegotiator, apply_version_headers};

/// Negotiate the API version, expose it to handlers and decorate the response.
pub async fn version_negotiation_middleware(
    State(negotiator): State<Arc<VersionNegotiator>>,
    mut req: Request,
    next: Next,
) -> Response {
    let context = match negotiator.negotiate_request(&req) {
        Ok(context) => context,
        Err(err) => {
            tracing::debug!("Version negotiation rejected {} {}: {}", req.method(), req.uri(), err);
            return err.into_response();
        }
    };

    if context.is_deprecated {
        tracing::warn!(
            version = %context.resolved_version,
            method = %req.method(),
            path = %req.uri().path(),
            user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-"),
            "Deprecated API version {} was used",
            context.resolved_version
        );
    }

    req.extensions_mut().insert(context.clone());
    let mut response = next.run(req).await;
    apply_version_headers(response.headers_mut(), &context);
    response
}

/// The negotiated version of a request, if the middleware ran.
pub fn version_context(req: &Request) -> Option<&VersionContext> {
    req.extensions().get::<VersionContext>()
}

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    tracing::debug!("Started processing {} {} {:?}", method, uri, version);

    let response = next.run(req).await;
    let duration = start.elapsed();

    tracing::info!(
        "Completed {} {} {:?} - {} in {:?}",
        method,
        uri,
        version,
        response.status(),
        duration
    );

    response
}

use crate::security::HeadersConfig;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

const PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");

/// Hardening headers added to every response
pub async fn security_headers_middleware(
    State(config): State<Arc<HeadersConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    if config.enabled {
        apply_security_headers(response.headers_mut(), &config);
    }
    response
}

pub fn apply_security_headers(headers: &mut HeaderMap, config: &HeadersConfig) {
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        PERMISSIONS_POLICY,
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    match HeaderValue::from_str(&config.content_security_policy) {
        Ok(value) => {
            headers.insert(header::CONTENT_SECURITY_POLICY, value);
        }
        Err(e) => warn!("Content-Security-Policy not applied: {}", e),
    }

    if config.hsts {
        let hsts = format!("max-age={}; includeSubDomains; preload", config.hsts_max_age);
        if let Ok(value) = HeaderValue::from_str(&hsts) {
            headers.insert(header::STRICT_TRANSPORT_SECURITY, value);
        }
    }
}

use crate::logging::{Logger, RequestExtras};
use crate::security::{
    excerpt, suspicious_user_agent, ClientIp, ClientIpResolver, CsrfGuard, RateLimiter,
    SecurityError, ThreatDetector, ThreatKind, ValidationConfig, ACTION_GENERAL,
};
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Global request screening run before any handler
pub struct Gatekeeper {
    config: ValidationConfig,
    resolver: Arc<ClientIpResolver>,
    rate_limiter: Arc<RateLimiter>,
    detector: Arc<ThreatDetector>,
    logger: Arc<Logger>,
}

impl Gatekeeper {
    pub fn new(
        config: ValidationConfig,
        resolver: Arc<ClientIpResolver>,
        rate_limiter: Arc<RateLimiter>,
        detector: Arc<ThreatDetector>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            config,
            resolver,
            rate_limiter,
            detector,
            logger,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run every check in order; the first failure wins
    async fn screen(&self, request: Request, extras: &RequestExtras) -> Result<Request, Response> {
        let ip = extras.ip.clone().unwrap_or_default();
        let url = extras.request_uri.clone().unwrap_or_default();

        match self.rate_limiter.check(ACTION_GENERAL, &ip).await {
            Ok(_) => {}
            Err(SecurityError::RateLimited { action, retry_after }) => {
                self.logger
                    .security_event(
                        "rate_limit_exceeded",
                        json!({ "action": action, "url": url }),
                        extras,
                    )
                    .await;
                return Err(reject(&SecurityError::RateLimited { action, retry_after }));
            }
            Err(e) => warn!("General rate limit unavailable, letting request through: {}", e),
        }

        if !self.resolver.is_allowed(&ip) {
            self.logger
                .security_event("ip_blocked", json!({ "ip": ip, "url": url }), extras)
                .await;
            return Err(reject(&SecurityError::IpBlocked { ip }));
        }

        let (parts, body) = request.into_parts();
        let limit = self.config.max_request_size;
        let declared = declared_length(&parts.headers);

        // Oversized bodies are not read; the size verdict waits until the scans ran
        let (body, oversize) = match declared {
            Some(size) if size > limit => (Bytes::new(), Some(size)),
            _ => match to_bytes(body, usize::try_from(limit).unwrap_or(usize::MAX)).await {
                Ok(bytes) => (bytes, None),
                Err(_) => (Bytes::new(), Some(declared.unwrap_or(limit + 1))),
            },
        };

        let query = parts
            .uri
            .query()
            .map(|q| form_pairs(q.as_bytes()))
            .unwrap_or_default();
        let form = if is_form(&parts.headers) {
            form_pairs(&body)
        } else {
            Vec::new()
        };
        let cookies = request_cookies(&parts.headers);

        if self.config.sql_injection_protection {
            let fields = query.iter().chain(&form).chain(&cookies);
            if let Some((field, value)) = self
                .detector
                .find(ThreatKind::SqlInjection, fields.map(|(k, v)| (k.as_str(), v.as_str())))
            {
                return Err(self
                    .threat(ThreatKind::SqlInjection, field, value, &url, extras)
                    .await);
            }
        }

        if self.config.xss_protection {
            let fields = query.iter().chain(&form);
            if let Some((field, value)) = self
                .detector
                .find(ThreatKind::Xss, fields.map(|(k, v)| (k.as_str(), v.as_str())))
            {
                return Err(self.threat(ThreatKind::Xss, field, value, &url, extras).await);
            }
        }

        if self.config.suspicious_user_agents {
            let user_agent = extras.user_agent.as_deref().unwrap_or_default();
            if user_agent.trim().is_empty() {
                self.logger
                    .security_event("empty_user_agent", json!({ "url": url }), extras)
                    .await;
            } else if let Some(signature) = suspicious_user_agent(user_agent) {
                debug!("User agent matched scanner signature '{}'", signature);
                self.logger
                    .security_event(
                        "suspicious_user_agent",
                        json!({ "user_agent": user_agent, "url": url }),
                        extras,
                    )
                    .await;
            }
        }

        if let Some(size) = oversize {
            self.logger
                .security_event(
                    "request_too_large",
                    json!({ "size": size, "max_size": limit, "url": url }),
                    extras,
                )
                .await;
            return Err(reject(&SecurityError::PayloadTooLarge { size, limit }));
        }

        Ok(Request::from_parts(parts, Body::from(body)))
    }

    async fn threat(
        &self,
        kind: ThreatKind,
        field: &str,
        value: &str,
        url: &str,
        extras: &RequestExtras,
    ) -> Response {
        self.logger
            .security_event(
                kind.event_name(),
                json!({ "field": field, "value": excerpt(value), "url": url }),
                extras,
            )
            .await;
        reject(&SecurityError::ThreatDetected {
            kind,
            field: field.to_string(),
        })
    }
}

/// Resolve the client, screen the request and attach [`ClientIp`] and [`RequestExtras`]
pub async fn gatekeeper_middleware(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    mut request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let ip = gatekeeper.resolver.resolve(request.headers(), remote);
    let extras = request_extras(&request, &ip);

    request.extensions_mut().insert(ClientIp(ip));
    request.extensions_mut().insert(extras.clone());

    match gatekeeper.screen(request, &extras).await {
        Ok(request) => next.run(request).await,
        Err(response) => response,
    }
}

/// Synchronizer-token check for state-changing form posts
pub struct CsrfGate {
    guard: Arc<CsrfGuard>,
    logger: Arc<Logger>,
    cookie_name: String,
    installed: bool,
    max_body: u64,
    /// Paths whose handlers verify the token themselves
    deferred: Vec<String>,
}

impl CsrfGate {
    pub fn new(
        guard: Arc<CsrfGuard>,
        logger: Arc<Logger>,
        cookie_name: impl Into<String>,
        installed: bool,
        max_body: u64,
    ) -> Self {
        Self {
            guard,
            logger,
            cookie_name: cookie_name.into(),
            installed,
            max_body,
            deferred: Vec::new(),
        }
    }

    /// Leave verification of `path` to its handler
    pub fn defer_to_handler(mut self, path: impl Into<String>) -> Self {
        self.deferred.push(path.into());
        self
    }

    fn skips(&self, method: &Method, path: &str) -> bool {
        method != Method::POST
            || self.guard.is_exempt(path, self.installed)
            || self.deferred.iter().any(|p| p == path)
    }
}

/// Reject POSTs without a live CSRF token from the form field or header
pub async fn csrf_middleware(
    State(gate): State<Arc<CsrfGate>>,
    request: Request,
    next: Next,
) -> Response {
    if gate.skips(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, usize::try_from(gate.max_body).unwrap_or(usize::MAX)).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return reject(&SecurityError::PayloadTooLarge {
                size: gate.max_body + 1,
                limit: gate.max_body,
            })
        }
    };

    let config = gate.guard.config();
    let candidate = parts
        .headers
        .get(config.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            is_form(&parts.headers)
                .then(|| form_pairs(&body))
                .and_then(|pairs| {
                    pairs
                        .into_iter()
                        .find(|(name, _)| *name == config.form_field)
                        .map(|(_, value)| value)
                })
        })
        .unwrap_or_default();

    let session_id = cookie_value(&parts.headers, &gate.cookie_name);
    let verified = match gate.guard.verify(session_id.as_deref(), &candidate).await {
        Ok(verified) => verified,
        Err(e) => {
            warn!("CSRF verification failed on storage error: {}", e);
            false
        }
    };

    if !verified {
        let extras = parts
            .extensions
            .get::<RequestExtras>()
            .cloned()
            .unwrap_or_default();
        gate.logger
            .security_event(
                "csrf_validation_failed",
                json!({ "url": parts.uri.to_string() }),
                &extras,
            )
            .await;
        return reject(&SecurityError::CsrfRejected);
    }

    next.run(Request::from_parts(parts, Body::from(body))).await
}

/// Short public message for a screening failure; details stay in the security log
pub fn rejection_message(error: &SecurityError) -> &'static str {
    match error {
        SecurityError::RateLimited { .. } => "Too Many Requests",
        SecurityError::IpBlocked { .. } => "Access Denied",
        SecurityError::ThreatDetected { .. } => "Invalid Request",
        SecurityError::PayloadTooLarge { .. } => "Request Too Large",
        SecurityError::CsrfRejected => "Invalid CSRF Token",
        other => other
            .status_code()
            .canonical_reason()
            .unwrap_or("Request Rejected"),
    }
}

/// `{"error": message}` carrying the status and `Retry-After` of `error`
pub fn reject(error: &SecurityError) -> Response {
    debug!("Request rejected: {}", error);
    let mut response = (
        error.status_code(),
        Json(json!({ "error": rejection_message(error) })),
    )
        .into_response();
    if let Some(seconds) = error.retry_after() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
    }
    response
}

/// Request details for log entries emitted while serving `request`
pub fn request_extras(request: &Request, ip: &str) -> RequestExtras {
    RequestExtras {
        ip: Some(ip.to_string()),
        user_agent: Some(
            request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        ),
        request_uri: Some(request.uri().to_string()),
        request_method: Some(request.method().to_string()),
        user_id: None,
        session_id: None,
        started_at: Some(Instant::now()),
    }
}

/// All `name=value` pairs from the `Cookie` headers
pub fn request_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    request_cookies(headers)
        .into_iter()
        .find(|(cookie, value)| cookie == name && !value.is_empty())
        .map(|(_, value)| value)
}

fn form_pairs(raw: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw).into_owned().collect()
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::logging::{Channel, LoggingConfig};
    use crate::security::{IpConfig, MemoryCounterStore, RateLimitConfig, RatePolicy};
    use axum::{http::StatusCode, middleware, routing::post, Router};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        logger: Arc<Logger>,
        router: Router,
        _dir: TempDir,
    }

    fn fixture(ip: IpConfig, rate_limiting: RateLimitConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let logger = Arc::new(Logger::new(LoggingConfig {
            log_dir: dir.path().to_path_buf(),
            ..LoggingConfig::default()
        }));
        let gatekeeper = Gatekeeper::new(
            ValidationConfig {
                max_request_size: 1024,
                ..ValidationConfig::default()
            },
            Arc::new(ClientIpResolver::new(&ip).unwrap()),
            Arc::new(RateLimiter::new(
                rate_limiting,
                Arc::new(MemoryCounterStore::new()),
                Arc::new(ManualClock::new(0)),
            )),
            Arc::new(ThreatDetector::new().unwrap()),
            logger.clone(),
        );
        let router = Router::new()
            .route(
                "/echo",
                post(|ClientIp(ip): ClientIp, body: String| async move { format!("{ip}:{body}") }),
            )
            .layer(middleware::from_fn_with_state(
                Arc::new(gatekeeper),
                gatekeeper_middleware,
            ));
        Fixture {
            logger,
            router,
            _dir: dir,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(IpConfig::default(), RateLimitConfig::default())
    }

    fn form(uri: &str, body: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("user-agent", "Mozilla/5.0")
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_clean_request_passes_with_body_intact() {
        let f = default_fixture();
        let response = f
            .router
            .clone()
            .oneshot(form("/echo?page=2", "name=Maria"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "203.0.113.7:name=Maria");
    }

    #[tokio::test]
    async fn test_sql_injection_in_query_is_rejected() {
        let f = default_fixture();
        let response = f
            .router
            .clone()
            .oneshot(form("/echo?id=1%20UNION%20SELECT%20password%20FROM%20users", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, r#"{"error":"Invalid Request"}"#);

        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "sql_injection_attempt");
        assert_eq!(logged[0].context["field"], "id");
    }

    #[tokio::test]
    async fn test_xss_in_form_is_rejected() {
        let f = default_fixture();
        let response = f
            .router
            .clone()
            .oneshot(form("/echo", "site=javascript%3Aalert(1)"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "xss_attempt");
        assert_eq!(logged[0].context["value"], "javascript:alert(1)");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let f = default_fixture();
        let response = f
            .router
            .clone()
            .oneshot(form("/echo", &"a=b&".repeat(400)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "request_too_large");
        assert_eq!(logged[0].context["max_size"], 1024);
    }

    #[tokio::test]
    async fn test_blocked_ip() {
        let f = fixture(
            IpConfig {
                blacklist: vec!["203.0.113.0/24".to_string()],
                ..IpConfig::default()
            },
            RateLimitConfig::default(),
        );
        let response = f.router.clone().oneshot(form("/echo", "")).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, r#"{"error":"Access Denied"}"#);
    }

    #[tokio::test]
    async fn test_general_rate_limit() {
        let f = fixture(
            IpConfig::default(),
            RateLimitConfig {
                general: RatePolicy::new(2, 3600),
                ..RateLimitConfig::default()
            },
        );

        for _ in 0..2 {
            let response = f.router.clone().oneshot(form("/echo", "")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = f.router.clone().oneshot(form("/echo", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "rate_limit_exceeded");
        assert_eq!(logged[0].context["action"], "general");
    }

    #[tokio::test]
    async fn test_scanner_user_agent_is_logged_not_blocked() {
        let f = default_fixture();
        let mut request = form("/echo", "");
        request
            .headers_mut()
            .insert("user-agent", HeaderValue::from_static("sqlmap/1.7"));
        let response = f.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "suspicious_user_agent");
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; SECURE_SESSION_ID=abc123; empty="),
        );
        assert_eq!(cookie_value(&headers, "SECURE_SESSION_ID").as_deref(), Some("abc123"));
        assert_eq!(cookie_value(&headers, "empty"), None);
        assert_eq!(request_cookies(&headers).len(), 3);
    }

    #[tokio::test]
    async fn test_rejections_follow_the_error() {
        let blocked = reject(&SecurityError::IpBlocked {
            ip: "192.0.2.1".to_string(),
        });
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);
        assert!(!blocked.headers().contains_key(header::RETRY_AFTER));
        let body = to_bytes(blocked.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // The address is not echoed back
        assert_eq!(body, json!({ "error": "Access Denied" }));

        let limited = reject(&SecurityError::RateLimited {
            action: ACTION_GENERAL.to_string(),
            retry_after: 0,
        });
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()[header::RETRY_AFTER], "1");

        let threat = SecurityError::ThreatDetected {
            kind: ThreatKind::Xss,
            field: "nome".to_string(),
        };
        assert_eq!(reject(&threat).status(), StatusCode::BAD_REQUEST);
        assert_eq!(rejection_message(&threat), "Invalid Request");
        assert_eq!(
            rejection_message(&SecurityError::PayloadTooLarge { size: 11, limit: 10 }),
            "Request Too Large"
        );
        assert_eq!(rejection_message(&SecurityError::CsrfRejected), "Invalid CSRF Token");
    }
}

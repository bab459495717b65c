pub mod auth_api;
pub mod response;
pub mod web_auth;

pub use response::*;

use axum::{
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::clock::SharedClock;
use crate::logging::{
    AuditChange, AuditStore, AuditTrail, Logger, MemoryAuditStore, RequestExtras,
};
use crate::security::{
    api_auth_middleware, csrf_middleware, gatekeeper_middleware, security_headers_middleware,
    ApiAuthGate, ClientIpResolver, CounterStore, CsrfGate, CsrfGuard, Gatekeeper,
    HeadersConfig, IdentityStore, LoginAttemptGuard, MemoryCounterStore, MemorySessionStore,
    Principal, RateLimiter, Result, SecurityConfig, SessionGuard, SessionStore, ThreatDetector,
    TokenCodec,
};

/// Storage the security pipeline runs on
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Backends {
    /// Process-local counters, sessions and audit records over the given identity store
    pub fn in_memory(identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            counters: Arc::new(MemoryCounterStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            identities,
            audit: Arc::new(MemoryAuditStore::new()),
        }
    }
}

/// Application state shared by the security middleware and handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SecurityConfig>,
    pub logger: Arc<Logger>,
    pub audit_trail: Arc<AuditTrail>,
    pub rate_limiter: Arc<RateLimiter>,
    pub login_guard: Arc<LoginAttemptGuard>,
    pub identities: Arc<dyn IdentityStore>,
    pub sessions: Arc<SessionGuard>,
    pub csrf: Arc<CsrfGuard>,
    pub tokens: Arc<TokenCodec>,
    pub gatekeeper: Arc<Gatekeeper>,
    pub csrf_gate: Arc<CsrfGate>,
    pub api_gate: Arc<ApiAuthGate>,
}

impl AppState {
    pub fn new(
        config: SecurityConfig,
        backends: Backends,
        logger: Arc<Logger>,
        clock: SharedClock,
        installed: bool,
    ) -> Result<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limiting.clone(),
            backends.counters.clone(),
            clock.clone(),
        ));
        let login_guard = Arc::new(LoginAttemptGuard::new(
            config.login.clone(),
            backends.counters,
            clock.clone(),
        ));
        let sessions = Arc::new(SessionGuard::new(
            config.session.clone(),
            backends.sessions.clone(),
            clock.clone(),
            logger.clone(),
        ));
        let csrf = Arc::new(CsrfGuard::new(
            config.csrf.clone(),
            backends.sessions,
            clock.clone(),
        ));
        let audit_trail = Arc::new(AuditTrail::new(backends.audit, clock.clone()));
        let tokens = Arc::new(TokenCodec::new(&config.auth, clock));

        let gatekeeper = Arc::new(Gatekeeper::new(
            config.validation.clone(),
            Arc::new(ClientIpResolver::new(&config.ip)?),
            rate_limiter.clone(),
            Arc::new(ThreatDetector::new()?),
            logger.clone(),
        ));
        let csrf_gate = Arc::new(
            CsrfGate::new(
                csrf.clone(),
                logger.clone(),
                config.session.cookie_name.clone(),
                installed,
                config.validation.max_request_size,
            )
            .defer_to_handler("/login"),
        );
        let api_gate = Arc::new(ApiAuthGate::new(
            rate_limiter.clone(),
            tokens.clone(),
            backends.identities.clone(),
            logger.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            logger,
            audit_trail,
            rate_limiter,
            login_guard,
            identities: backends.identities,
            sessions,
            csrf,
            tokens,
            gatekeeper,
            csrf_gate,
            api_gate,
        })
    }
}

/// Create the router with the full security pipeline in front of it
pub fn create_router(state: AppState) -> Router {
    let api_protected = Router::new()
        .route("/api/auth/logout", post(auth_api::logout))
        .route("/api/auth/me", get(auth_api::me))
        .route_layer(middleware::from_fn_with_state(
            state.api_gate.clone(),
            api_auth_middleware,
        ));

    let web_protected = Router::new()
        .route("/me", get(web_auth::me))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            web_auth::session_middleware,
        ));

    let headers: Arc<HeadersConfig> = Arc::new(state.config.headers.clone());

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/auth/login", post(auth_api::login))
        .route("/api/auth/refresh", post(auth_api::refresh))
        .route("/login", post(web_auth::login))
        .route("/logout", post(web_auth::logout))
        .route("/csrf-token", get(web_auth::csrf_token))
        .merge(api_protected)
        .merge(web_protected)
        .layer(middleware::from_fn_with_state(
            state.csrf_gate.clone(),
            csrf_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.gatekeeper.clone(),
            gatekeeper_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            headers,
            security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Stamp the account's last access and keep the change in the audit trail
pub(crate) async fn record_sign_in(
    state: &AppState,
    principal: &Principal,
    extras: &RequestExtras,
) {
    if let Err(e) = state.identities.record_login(principal.id).await {
        warn!("Failed to record last access for user {}: {}", principal.id, e);
        return;
    }

    state
        .audit_trail
        .record(
            AuditChange::new("login", "users")
                .record(principal.id)
                .by(principal.id)
                .before(json!({ "last_access": principal.last_access })),
            extras,
        )
        .await;
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "school-guard",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

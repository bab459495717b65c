use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Form,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{record_sign_in, ApiResponse, AppState};
use crate::logging::RequestExtras;
use crate::security::{
    cookie_value, dummy_verify, login_identifier, verify_password, ClientIp, PrincipalSummary,
    SecurityError, SessionState, ACTION_LOGIN,
};

/// Fields posted by the login form; `email` accepts an email or a username
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub senha: String,
    #[serde(default)]
    pub csrf_token: String,
}

/// Signed-in user attached by [`session_middleware`]
#[derive(Debug, Clone)]
pub struct SessionUser(pub PrincipalSummary);

fn extras_or_default(extras: Option<Extension<RequestExtras>>) -> RequestExtras {
    extras.map(|Extension(e)| e).unwrap_or_default()
}

/// Form login: lockout, rate limit, CSRF, credentials, account status
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    extras: Option<Extension<RequestExtras>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Result<Response, SecurityError> {
    let extras = extras_or_default(extras);
    let login = form.email.trim().to_string();
    let identifier = login_identifier(&login, &ip);

    match state.login_guard.ensure_may_attempt(&identifier).await {
        Ok(()) => {}
        Err(e @ SecurityError::LockedOut { .. }) => {
            state
                .logger
                .security_event(
                    "login_blocked_attempts",
                    json!({ "login": login, "ip": ip }),
                    &extras,
                )
                .await;
            return Err(e);
        }
        Err(e) => return Err(e),
    }

    if let Err(e) = state.rate_limiter.check(ACTION_LOGIN, &ip).await {
        if matches!(e, SecurityError::RateLimited { .. }) {
            state
                .logger
                .security_event(
                    "rate_limit_exceeded",
                    json!({ "action": ACTION_LOGIN, "url": "/login" }),
                    &extras,
                )
                .await;
        }
        return Err(e);
    }

    let cookie_name = &state.sessions.config().cookie_name;
    let session_id = cookie_value(&headers, cookie_name);
    if !state
        .csrf
        .verify(session_id.as_deref(), &form.csrf_token)
        .await?
    {
        state
            .logger
            .security_event("csrf_validation_failed", json!({ "url": "/login" }), &extras)
            .await;
        return Err(SecurityError::CsrfRejected);
    }

    if login.is_empty() || form.senha.is_empty() {
        return Err(SecurityError::ValidationError {
            message: "Email and password are required".to_string(),
        });
    }

    let principal = match state.identities.find_by_login(&login).await? {
        Some(principal) if verify_password(&form.senha, &principal.password_hash) => principal,
        found => {
            if found.is_none() {
                dummy_verify(&form.senha);
            }
            state.login_guard.record(&identifier, false).await?;
            state
                .logger
                .security_event("login_failed", json!({ "login": login, "ip": ip }), &extras)
                .await;
            return Err(SecurityError::InvalidCredentials);
        }
    };

    if !principal.is_active() {
        return Err(SecurityError::AccountInactive);
    }

    state.login_guard.record(&identifier, true).await?;

    let (anonymous_id, _) = state.sessions.start(session_id.as_deref()).await?;
    let new_id = state
        .sessions
        .authenticate(&anonymous_id, principal.summary(), &ip)
        .await?;

    record_sign_in(&state, &principal, &extras).await;

    state
        .logger
        .audit(
            "login_success",
            json!({ "user_id": principal.id, "username": principal.username }),
            &extras.with_user(principal.id).with_session(new_id.clone()),
        )
        .await;
    info!("User {} signed in", principal.id);

    Ok(redirect("/", Some(state.sessions.cookie(&new_id))))
}

/// Destroy the session and send the browser back to the login page
pub async fn logout(
    State(state): State<AppState>,
    extras: Option<Extension<RequestExtras>>,
    headers: HeaderMap,
) -> Result<Response, SecurityError> {
    let cookie_name = &state.sessions.config().cookie_name;
    if let Some(session_id) = cookie_value(&headers, cookie_name) {
        let user_id = state
            .sessions
            .store()
            .load(&session_id)
            .await?
            .and_then(|record| record.user_id());
        state.sessions.logout(&session_id).await?;

        if let Some(user_id) = user_id {
            state
                .logger
                .audit(
                    "logout",
                    json!({ "user_id": user_id }),
                    &extras_or_default(extras).with_user(user_id),
                )
                .await;
        }
    }

    Ok(redirect("/login", Some(state.sessions.expired_cookie())))
}

/// Current CSRF token, starting a session when the browser has none
pub async fn csrf_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, SecurityError> {
    let cookie_name = &state.sessions.config().cookie_name;
    let presented = cookie_value(&headers, cookie_name);
    let (session_id, _) = state.sessions.start(presented.as_deref()).await?;
    let token = state.csrf.mint(&session_id).await?;

    let mut response = ApiResponse::success(json!({ "csrf_token": token }), "CSRF token").into_response();
    set_cookie(&mut response, &state.sessions.cookie(&session_id));
    Ok(response)
}

/// Signed-in user's summary
pub async fn me(Extension(SessionUser(user)): Extension<SessionUser>) -> Response {
    ApiResponse::success(user, "Current user").into_response()
}

/// Require a live session; anything else goes back to `/login`
pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let ip = request
        .extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_default();
    let extras = request
        .extensions()
        .get::<RequestExtras>()
        .cloned()
        .unwrap_or_default();
    let presented = cookie_value(request.headers(), &state.sessions.config().cookie_name);

    let state_now = state
        .sessions
        .check(presented.as_deref(), &ip, &extras)
        .await?;

    match state_now {
        SessionState::Authenticated { session_id, record } => {
            let Some(login) = record.login else {
                return Ok(redirect("/login", None));
            };
            request.extensions_mut().insert(SessionUser(login.user));

            let mut response = next.run(request).await;
            if presented.as_deref() != Some(session_id.as_str()) {
                set_cookie(&mut response, &state.sessions.cookie(&session_id));
            }
            Ok(response)
        }
        SessionState::Anonymous => Ok(redirect("/login", None)),
        SessionState::Expired | SessionState::HijackSuspected => {
            Ok(redirect("/login", Some(state.sessions.expired_cookie())))
        }
    }
}

fn redirect(location: &'static str, cookie: Option<String>) -> Response {
    let mut response = (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, HeaderValue::from_static(location))],
    )
        .into_response();
    if let Some(cookie) = cookie {
        set_cookie(&mut response, &cookie);
    }
    response
}

fn set_cookie(response: &mut Response, cookie: &str) {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => warn!("Session cookie not set: {}", e),
    }
}

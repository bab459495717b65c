use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use validator::Validate;

use super::{error_response, record_sign_in, validation_response, ApiResponse, AppState};
use crate::logging::RequestExtras;
use crate::security::{
    claim_user_id, dummy_verify, is_refresh_token, login_identifier, verify_password, ClientIp,
    CurrentPrincipal, Principal, PrincipalSummary, SecurityError, ACTION_LOGIN,
};

#[derive(Debug, Deserialize, Validate)]
pub struct ApiLoginRequest {
    #[serde(default)]
    #[validate(length(
        min = 3,
        max = 50,
        message = "Username must be between 3 and 50 characters"
    ))]
    pub username: String,

    #[serde(default)]
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct LoginTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user: PrincipalSummary,
}

#[derive(Debug, Serialize)]
pub struct RefreshedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

fn extras_or_default(extras: Option<Extension<RequestExtras>>) -> RequestExtras {
    extras.map(|Extension(e)| e).unwrap_or_default()
}

/// Exchange a username and password for an access/refresh token pair
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    extras: Option<Extension<RequestExtras>>,
    payload: Result<Json<ApiLoginRequest>, JsonRejection>,
) -> Result<Response, SecurityError> {
    let extras = extras_or_default(extras);
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            debug!("Rejected login body: {}", rejection);
            return Ok(error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation failed",
                Some(json!({ "body": [rejection.body_text()] })),
            ));
        }
    };

    if let Err(errors) = request.validate() {
        return Ok(validation_response(&errors));
    }

    let username = request.username.trim().to_string();
    let identifier = login_identifier(&username, &ip);

    match state.login_guard.ensure_may_attempt(&identifier).await {
        Ok(()) => {}
        Err(e @ SecurityError::LockedOut { .. }) => {
            state
                .logger
                .security_event(
                    "login_blocked_attempts",
                    json!({ "login": username, "ip": ip }),
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
                    json!({ "action": ACTION_LOGIN, "url": "/api/auth/login" }),
                    &extras,
                )
                .await;
        }
        return Err(e);
    }

    let principal = match state.identities.find_by_username(&username).await? {
        Some(principal) if verify_password(&request.password, &principal.password_hash) => {
            principal
        }
        found => {
            if found.is_none() {
                dummy_verify(&request.password);
            }
            state.login_guard.record(&identifier, false).await?;
            state
                .logger
                .security_event(
                    "api_login_failed",
                    json!({ "username": username, "ip": ip }),
                    &extras,
                )
                .await;
            return Err(SecurityError::InvalidCredentials);
        }
    };

    if !principal.is_active() {
        return Err(SecurityError::AccountInactive);
    }

    state.login_guard.record(&identifier, true).await?;

    let access_token = state.tokens.issue_access_token(
        principal.id,
        &principal.username,
        principal.level_id,
    )?;
    let refresh_token = state.tokens.issue_refresh_token(principal.id)?;

    record_sign_in(&state, &principal, &extras).await;

    state
        .logger
        .security_event(
            "api_login_success",
            json!({ "user_id": principal.id, "username": username }),
            &extras.with_user(principal.id),
        )
        .await;

    Ok(ApiResponse::success(
        LoginTokens {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: state.tokens.access_ttl(),
            user: principal.summary(),
        },
        "Login successful",
    )
    .into_response())
}

/// New access token from a refresh token; the refresh token itself is not rotated
pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Response, SecurityError> {
    let token = match payload {
        Ok(Json(body)) if !body.refresh_token.is_empty() => body.refresh_token,
        _ => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "Refresh token is required",
                None,
            ))
        }
    };

    let claims = state.tokens.decode(&token)?;
    if !is_refresh_token(&claims) {
        return Err(SecurityError::InvalidToken {
            message: "Not a refresh token".to_string(),
        });
    }

    let user_id = claim_user_id(&claims).ok_or_else(|| SecurityError::InvalidToken {
        message: "Token carries no user id".to_string(),
    })?;
    let principal = match state.identities.find_by_id(user_id).await? {
        Some(principal) if principal.is_active() => principal,
        _ => {
            return Err(SecurityError::InvalidToken {
                message: "User not found or inactive".to_string(),
            })
        }
    };

    let access_token = state.tokens.issue_access_token(
        principal.id,
        &principal.username,
        principal.level_id,
    )?;

    Ok(ApiResponse::success(
        RefreshedToken {
            access_token,
            token_type: "Bearer",
            expires_in: state.tokens.access_ttl(),
        },
        "Token refreshed",
    )
    .into_response())
}

/// Tokens are stateless, so logout only records the event
pub async fn logout(
    State(state): State<AppState>,
    extras: Option<Extension<RequestExtras>>,
    CurrentPrincipal(principal): CurrentPrincipal,
) -> StatusCode {
    state
        .logger
        .security_event(
            "api_logout",
            json!({ "user_id": principal.id }),
            &extras_or_default(extras).with_user(principal.id),
        )
        .await;
    StatusCode::NO_CONTENT
}

pub async fn me(CurrentPrincipal(principal): CurrentPrincipal) -> Json<ApiResponse<Principal>> {
    Json(ApiResponse::success(principal, "Current user"))
}

use crate::logging::{Logger, RequestExtras};
use crate::security::{
    claim_user_id, is_refresh_token, request_extras, ClientIp, IdentityStore, Principal,
    RateLimiter, SecurityError, TokenCodec, ACTION_API_REQUEST, UNKNOWN_CLIENT,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bearer-token gate in front of the JSON API
pub struct ApiAuthGate {
    rate_limiter: Arc<RateLimiter>,
    tokens: Arc<TokenCodec>,
    identities: Arc<dyn IdentityStore>,
    logger: Arc<Logger>,
}

impl ApiAuthGate {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        tokens: Arc<TokenCodec>,
        identities: Arc<dyn IdentityStore>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            rate_limiter,
            tokens,
            identities,
            logger,
        }
    }

    /// Resolve the principal behind the request's bearer token
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, SecurityError> {
        let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() else {
            return Err(SecurityError::MissingCredentials);
        };

        let claims = self.tokens.decode(bearer.token())?;
        if is_refresh_token(&claims) {
            return Err(SecurityError::InvalidToken {
                message: "Refresh token used for API access".to_string(),
            });
        }

        let user_id = claim_user_id(&claims).ok_or_else(|| SecurityError::InvalidToken {
            message: "Token carries no user id".to_string(),
        })?;

        match self.identities.find_by_id(user_id).await? {
            Some(principal) if principal.is_active() => Ok(principal),
            Some(_) => {
                debug!("Token presented for inactive user {}", user_id);
                Err(SecurityError::InvalidToken {
                    message: "User not found or inactive".to_string(),
                })
            }
            None => Err(SecurityError::InvalidToken {
                message: "User not found or inactive".to_string(),
            }),
        }
    }
}

/// Rate limit, authenticate and attach the [`Principal`] to the request
pub async fn api_auth_middleware(
    State(gate): State<Arc<ApiAuthGate>>,
    mut request: Request,
    next: Next,
) -> Result<Response, SecurityError> {
    let ip = request
        .extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
    let extras = request
        .extensions()
        .get::<RequestExtras>()
        .cloned()
        .unwrap_or_else(|| request_extras(&request, &ip));
    let endpoint = request.uri().to_string();
    let method = request.method().to_string();

    match gate.rate_limiter.check(ACTION_API_REQUEST, &ip).await {
        Ok(_) => {}
        Err(e @ SecurityError::RateLimited { .. }) => {
            gate.logger
                .security_event(
                    "rate_limit_exceeded",
                    json!({ "action": ACTION_API_REQUEST, "url": endpoint }),
                    &extras,
                )
                .await;
            return Err(e);
        }
        Err(e) => warn!("API rate limit unavailable, letting request through: {}", e),
    }

    let principal = match gate.authenticate(request.headers()).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!("API authentication failed: {}", e);
            return Err(e);
        }
    };

    gate.logger
        .audit(
            "api_access",
            json!({
                "user_id": principal.id,
                "endpoint": endpoint,
                "method": method,
            }),
            &extras.clone().with_user(principal.id),
        )
        .await;

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Principal attached by [`api_auth_middleware`], if the request passed it
pub fn current_principal(request: &Request) -> Option<&Principal> {
    request.extensions().get::<Principal>()
}

/// Extractor for handlers behind [`api_auth_middleware`]
#[derive(Debug, Clone)]
pub struct CurrentPrincipal(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = SecurityError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentPrincipal)
            .ok_or(SecurityError::MissingCredentials)
    }
}

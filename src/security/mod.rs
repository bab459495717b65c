pub mod api_auth;
pub mod client_ip;
pub mod csrf;
pub mod gatekeeper;
pub mod headers;
pub mod identity;
pub mod login_guard;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod threat;
pub mod token;

pub use api_auth::*;
pub use client_ip::*;
pub use csrf::*;
pub use gatekeeper::*;
pub use self::headers::*;
pub use identity::*;
pub use login_guard::*;
pub use rate_limit::*;
pub use session::*;
pub use store::*;
pub use threat::*;
pub use token::*;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Placeholder secret shipped in sample configs; refused at startup
pub const PLACEHOLDER_JWT_SECRET: &str = "change-me-in-production";

/// Main security configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Token signing configuration
    pub auth: AuthConfig,

    /// Web session integrity configuration
    pub session: SessionConfig,

    /// CSRF token configuration
    pub csrf: CsrfConfig,

    /// Login lockout configuration
    pub login: LoginConfig,

    /// Rate limiting configuration
    pub rate_limiting: RateLimitConfig,

    /// Client address resolution and allow/deny lists
    pub ip: IpConfig,

    /// Request inspection configuration
    pub validation: ValidationConfig,

    /// Response hardening headers
    pub headers: HeadersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// `iss` claim stamped on every token (the application URL)
    pub issuer: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub timeout_seconds: i64,
    pub rotation_interval_seconds: i64,
    pub check_ip: bool,
    pub cookie_name: String,
    pub secure_cookie: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrfConfig {
    pub token_ttl_seconds: i64,
    pub form_field: String,
    pub header_name: String,
    /// Path prefixes whose POSTs skip CSRF verification
    pub exempt_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    pub max_attempts: u32,
    pub lockout_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window_seconds: i64,
}

impl RatePolicy {
    pub const fn new(max_requests: u32, window_seconds: i64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// Parse the `max/window` form used by the environment overrides
    pub fn parse(raw: &str) -> Option<Self> {
        let (max, window) = raw.trim().split_once('/')?;
        Some(Self::new(max.trim().parse().ok()?, window.trim().parse().ok()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub general: RatePolicy,
    pub login: RatePolicy,
    pub api: RatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// Allowed addresses or CIDR ranges; empty allows everyone
    pub whitelist: Vec<String>,
    /// Addresses or CIDR ranges that are always refused
    pub blacklist: Vec<String>,
    pub check_proxy_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub max_request_size: u64,
    pub sql_injection_protection: bool,
    pub xss_protection: bool,
    pub suspicious_user_agents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersConfig {
    pub enabled: bool,
    pub hsts: bool,
    pub hsts_max_age: u64,
    pub content_security_policy: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: PLACEHOLDER_JWT_SECRET.to_string(),
            issuer: "localhost".to_string(),
            access_ttl_seconds: 3600,    // 1 hour
            refresh_ttl_seconds: 604800, // 7 days
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            rotation_interval_seconds: 1800,
            check_ip: true,
            cookie_name: "SECURE_SESSION_ID".to_string(),
            secure_cookie: false,
        }
    }
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_ttl_seconds: 3600,
            form_field: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            exempt_prefixes: vec!["/api/".to_string()],
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_seconds: 900, // 15 minutes
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            general: RatePolicy::new(100, 3600),
            login: RatePolicy::new(5, 900),
            api: RatePolicy::new(1000, 3600),
        }
    }
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            check_proxy_headers: true,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_request_size: 10 * 1024 * 1024, // 10MB
            sql_injection_protection: true,
            xss_protection: true,
            suspicious_user_agents: true,
        }
    }
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: false,
            hsts_max_age: 31536000,
            content_security_policy: [
                "default-src 'self'",
                "script-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net",
                "style-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net",
                "img-src 'self' data: https:",
                "font-src 'self' https://cdn.jsdelivr.net",
                "connect-src 'self'",
                "frame-ancestors 'none'",
                "base-uri 'self'",
                "form-action 'self'",
            ]
            .join("; "),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Rate limit exceeded for {action}")]
    RateLimited { action: String, retry_after: i64 },

    #[error("CSRF token missing, expired or invalid")]
    CsrfRejected,

    #[error("Potential {kind} detected in field '{field}'")]
    ThreatDetected { kind: ThreatKind, field: String },

    #[error("Request of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("Access denied for {ip}")]
    IpBlocked { ip: String },

    #[error("Authentication required")]
    MissingCredentials,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    #[error("Account is inactive")]
    AccountInactive,

    #[error("Too many failed login attempts")]
    LockedOut { retry_after: i64 },

    #[error("Session expired")]
    SessionExpired,

    #[error("Session address mismatch")]
    SessionHijack,

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl SecurityError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SecurityError::RateLimited { .. } | SecurityError::LockedOut { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SecurityError::CsrfRejected
            | SecurityError::IpBlocked { .. }
            | SecurityError::AccountInactive => StatusCode::FORBIDDEN,
            SecurityError::ThreatDetected { .. } => StatusCode::BAD_REQUEST,
            SecurityError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SecurityError::MissingCredentials
            | SecurityError::InvalidCredentials
            | SecurityError::InvalidToken { .. }
            | SecurityError::SessionExpired
            | SecurityError::SessionHijack => StatusCode::UNAUTHORIZED,
            SecurityError::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SecurityError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SecurityError::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Seconds the client should wait before retrying, when applicable
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            SecurityError::RateLimited { retry_after, .. }
            | SecurityError::LockedOut { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SecurityError {
    fn from(e: sqlx::Error) -> Self {
        SecurityError::Storage {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_policy_parse() {
        assert_eq!(RatePolicy::parse("5/900"), Some(RatePolicy::new(5, 900)));
        assert_eq!(RatePolicy::parse(" 1000 / 3600 "), Some(RatePolicy::new(1000, 3600)));
        assert_eq!(RatePolicy::parse("5"), None);
        assert_eq!(RatePolicy::parse("x/900"), None);
    }

    #[test]
    fn test_security_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.auth.access_ttl_seconds, 3600);
        assert_eq!(config.auth.refresh_ttl_seconds, 604800);
        assert_eq!(config.session.timeout_seconds, 3600);
        assert_eq!(config.session.rotation_interval_seconds, 1800);
        assert_eq!(config.csrf.token_ttl_seconds, 3600);
        assert_eq!(config.login.max_attempts, 5);
        assert_eq!(config.login.lockout_seconds, 900);
        assert_eq!(config.rate_limiting.general, RatePolicy::new(100, 3600));
        assert_eq!(config.rate_limiting.login, RatePolicy::new(5, 900));
        assert_eq!(config.validation.max_request_size, 10 * 1024 * 1024);
        assert!(config.ip.whitelist.is_empty());
    }

    #[test]
    fn test_error_status_codes() {
        let limited = SecurityError::RateLimited {
            action: "login".to_string(),
            retry_after: 30,
        };
        assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.retry_after(), Some(30));
        assert_eq!(SecurityError::CsrfRejected.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            SecurityError::PayloadTooLarge { size: 11, limit: 10 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            SecurityError::InvalidToken {
                message: "expired".to_string()
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert!(SecurityError::SessionHijack.retry_after().is_none());
    }
}

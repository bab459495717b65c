use crate::security::SecurityError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::error;

/// JSON envelope shared by every API answer
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,
    pub timestamp: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<Value> {
    pub fn error(message: impl Into<String>, errors: Option<Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Error envelope with an explicit status
pub fn error_response(status: StatusCode, message: &str, errors: Option<Value>) -> Response {
    (status, ApiResponse::error(message, errors)).into_response()
}

/// 422 listing the failing fields and their messages
pub fn validation_response(errors: &validator::ValidationErrors) -> Response {
    let mut fields = Map::new();
    for (field, failures) in errors.field_errors() {
        let messages: Vec<Value> = failures
            .iter()
            .map(|failure| {
                Value::String(
                    failure
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("{field} is invalid")),
                )
            })
            .collect();
        fields.insert(field.to_string(), Value::Array(messages));
    }
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Validation failed",
        Some(Value::Object(fields)),
    )
}

/// Message shown to the client; details stay in the logs
pub fn public_message(err: &SecurityError) -> String {
    match err {
        SecurityError::RateLimited { .. } => "Too many requests".to_string(),
        SecurityError::CsrfRejected => "Invalid CSRF token".to_string(),
        SecurityError::ThreatDetected { .. } => "Invalid request".to_string(),
        SecurityError::PayloadTooLarge { .. } => "Request too large".to_string(),
        SecurityError::IpBlocked { .. } => "Access denied".to_string(),
        SecurityError::MissingCredentials => "Access token required".to_string(),
        SecurityError::InvalidCredentials => "Invalid credentials".to_string(),
        SecurityError::InvalidToken { .. } => "Invalid or expired token".to_string(),
        SecurityError::AccountInactive => "Inactive user".to_string(),
        SecurityError::LockedOut { retry_after } => format!(
            "Too many login attempts. Try again in {} minutes.",
            ((retry_after + 30) / 60).max(1)
        ),
        SecurityError::SessionExpired => "Session expired".to_string(),
        SecurityError::SessionHijack => "Session invalidated".to_string(),
        SecurityError::ValidationError { message } => message.clone(),
        SecurityError::Storage { .. } => "Service temporarily unavailable".to_string(),
        SecurityError::Configuration { .. } => "Internal server error".to_string(),
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            SecurityError::Storage { .. } | SecurityError::Configuration { .. }
        ) {
            error!("Request failed: {}", self);
        }

        let mut response = error_response(self.status_code(), &public_message(&self), None);
        if let Some(seconds) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
        }
        response
    }
}

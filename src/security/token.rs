use crate::clock::SharedClock;
use crate::security::{AuthConfig, Result, SecurityError};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Claim set carried by a token: caller claims plus `iat`, `exp` and `iss`
pub type Claims = Map<String, Value>;

pub const TOKEN_TYPE_CLAIM: &str = "type";
pub const REFRESH_TOKEN_TYPE: &str = "refresh";
pub const USER_ID_CLAIM: &str = "user_id";

/// Signs and verifies HS256 tokens.
///
/// Tokens are stateless: nothing is stored on issue and there is no revocation,
/// so a leaked token stays usable until its `exp`.
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: i64,
    refresh_ttl: i64,
    clock: SharedClock,
}

impl TokenCodec {
    pub fn new(config: &AuthConfig, clock: SharedClock) -> Self {
        // Expiry is checked against the injected clock below, and no claim is mandatory
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_ttl: config.access_ttl_seconds,
            refresh_ttl: config.refresh_ttl_seconds,
            clock,
        }
    }

    /// Sign `claims` with `iat = now`, `exp = now + ttl_seconds` and `iss` layered on top
    pub fn encode(&self, claims: &Claims, ttl_seconds: i64) -> Result<String> {
        let now = self.clock.now();

        let mut payload = claims.clone();
        payload.insert("iat".to_string(), json!(now));
        payload.insert("exp".to_string(), json!(now + ttl_seconds));
        payload.insert("iss".to_string(), json!(self.issuer));

        encode(&Header::new(Algorithm::HS256), &payload, &self.encoding_key).map_err(|e| {
            SecurityError::InvalidToken {
                message: format!("Failed to sign token: {e}"),
            }
        })
    }

    /// Verify the signature and expiry of `token` and return its claims
    pub fn decode(&self, token: &str) -> Result<Claims> {
        if token.split('.').count() != 3 {
            return Err(SecurityError::InvalidToken {
                message: "Malformed token".to_string(),
            });
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!("Token rejected: {}", e);
            SecurityError::InvalidToken {
                message: e.to_string(),
            }
        })?;

        let claims = data.claims;
        if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
            if exp < self.clock.now() {
                return Err(SecurityError::InvalidToken {
                    message: "Token expired".to_string(),
                });
            }
        }

        Ok(claims)
    }

    /// Access token for an authenticated principal
    pub fn issue_access_token(&self, user_id: i64, username: &str, level_id: i64) -> Result<String> {
        let mut claims = Claims::new();
        claims.insert(USER_ID_CLAIM.to_string(), json!(user_id));
        claims.insert("username".to_string(), json!(username));
        claims.insert("level_id".to_string(), json!(level_id));
        self.encode(&claims, self.access_ttl)
    }

    pub fn issue_refresh_token(&self, user_id: i64) -> Result<String> {
        let mut claims = Claims::new();
        claims.insert(USER_ID_CLAIM.to_string(), json!(user_id));
        claims.insert(TOKEN_TYPE_CLAIM.to_string(), json!(REFRESH_TOKEN_TYPE));
        self.encode(&claims, self.refresh_ttl)
    }

    pub fn access_ttl(&self) -> i64 {
        self.access_ttl
    }
}

pub fn is_refresh_token(claims: &Claims) -> bool {
    claims.get(TOKEN_TYPE_CLAIM).and_then(Value::as_str) == Some(REFRESH_TOKEN_TYPE)
}

pub fn claim_user_id(claims: &Claims) -> Option<i64> {
    match claims.get(USER_ID_CLAIM)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn codec(clock: &ManualClock) -> TokenCodec {
        let config = AuthConfig {
            jwt_secret: "unit-test-secret-with-at-least-32-bytes!".to_string(),
            issuer: "https://school.example".to_string(),
            ..AuthConfig::default()
        };
        TokenCodec::new(&config, Arc::new(clock.clone()))
    }

    #[test]
    fn test_encode_merges_standard_claims() {
        let clock = ManualClock::new(1_700_000_000);
        let codec = codec(&clock);

        let mut claims = Claims::new();
        claims.insert("user_id".to_string(), json!(7));
        claims.insert("iss".to_string(), json!("spoofed"));

        let token = codec.encode(&claims, 60).unwrap();
        let decoded = codec.decode(&token).unwrap();

        assert_eq!(decoded["user_id"], json!(7));
        assert_eq!(decoded["iat"], json!(1_700_000_000));
        assert_eq!(decoded["exp"], json!(1_700_000_060));
        assert_eq!(decoded["iss"], json!("https://school.example"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let clock = ManualClock::new(1_000);
        let codec = codec(&clock);
        let token = codec.issue_access_token(1, "admin", 1).unwrap();

        clock.advance(3600);
        assert!(codec.decode(&token).is_ok());

        clock.advance(1);
        assert!(matches!(
            codec.decode(&token),
            Err(SecurityError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_malformed_and_foreign_tokens() {
        let clock = ManualClock::new(1_000);
        let codec = codec(&clock);

        assert!(codec.decode("").is_err());
        assert!(codec.decode("a.b").is_err());
        assert!(codec.decode("a.b.c.d").is_err());

        let other = TokenCodec::new(
            &AuthConfig {
                jwt_secret: "another-secret-that-is-also-32-bytes-long".to_string(),
                ..AuthConfig::default()
            },
            Arc::new(clock.clone()),
        );
        let token = other.issue_access_token(1, "admin", 1).unwrap();
        assert!(codec.decode(&token).is_err());
    }

    #[test]
    fn test_refresh_token_shape() {
        let clock = ManualClock::new(1_000);
        let codec = codec(&clock);

        let refresh = codec.decode(&codec.issue_refresh_token(42).unwrap()).unwrap();
        assert!(is_refresh_token(&refresh));
        assert_eq!(claim_user_id(&refresh), Some(42));
        assert_eq!(refresh["exp"], json!(1_000 + 604_800));

        let access = codec.decode(&codec.issue_access_token(42, "ana", 2).unwrap()).unwrap();
        assert!(!is_refresh_token(&access));
        assert_eq!(access["level_id"], json!(2));
    }
}

use crate::clock::SharedClock;
use crate::security::{CounterStore, RateLimitConfig, RatePolicy, Result, SecurityError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Named actions with their own window
pub const ACTION_GENERAL: &str = "general";
pub const ACTION_LOGIN: &str = "login";
pub const ACTION_API_REQUEST: &str = "api_request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
    /// Seconds until the current window closes
    pub retry_after: i64,
}

/// Fixed-window rate limiter over a shared [`CounterStore`]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Configured policy for a named action
    pub fn policy(&self, action: &str) -> RatePolicy {
        match action {
            ACTION_LOGIN => self.config.login,
            ACTION_API_REQUEST => self.config.api,
            _ => self.config.general,
        }
    }

    /// Count one request by `client_identity` against `action`
    pub async fn allow(
        &self,
        action: &str,
        client_identity: &str,
        policy: RatePolicy,
    ) -> Result<RateDecision> {
        if !self.config.enabled {
            return Ok(RateDecision {
                allowed: true,
                count: 0,
                limit: policy.max_requests,
                retry_after: 0,
            });
        }

        let now = self.clock.now();
        let key = counter_key(action, client_identity);
        let hit = self
            .store
            .hit(&key, policy.max_requests, policy.window_seconds, now)
            .await?;

        let decision = RateDecision {
            allowed: hit.count <= policy.max_requests,
            count: hit.count,
            limit: policy.max_requests,
            retry_after: (hit.window_start + policy.window_seconds + 1 - now).max(1),
        };

        if decision.allowed {
            debug!("Rate limit check passed for {}: {}/{}", action, hit.count, policy.max_requests);
        } else {
            warn!("Rate limit exceeded for action: {}", action);
        }

        Ok(decision)
    }

    /// [`RateLimiter::allow`] with the configured policy, denial as an error
    pub async fn check(&self, action: &str, client_identity: &str) -> Result<RateDecision> {
        let decision = self
            .allow(action, client_identity, self.policy(action))
            .await?;

        if decision.allowed {
            Ok(decision)
        } else {
            Err(SecurityError::RateLimited {
                action: action.to_string(),
                retry_after: decision.retry_after,
            })
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// Store key for an action and a client identity; the identity is never stored in clear
pub fn counter_key(action: &str, client_identity: &str) -> String {
    let digest = Sha256::digest(client_identity.as_bytes());
    format!("rate_limit:{}:{}", action, hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::security::MemoryCounterStore;

    fn limiter(clock: &ManualClock) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_login_window_five_per_fifteen_minutes() {
        let clock = ManualClock::new(10_000);
        let limiter = limiter(&clock);
        let policy = RatePolicy::new(5, 900);

        for _ in 0..5 {
            assert!(limiter.allow("login", "10.0.0.1", policy).await.unwrap().allowed);
            clock.advance(10);
        }

        let sixth = limiter.allow("login", "10.0.0.1", policy).await.unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.retry_after, 10_000 + 900 + 1 - clock.now());

        // A different identity has its own window
        assert!(limiter.allow("login", "10.0.0.2", policy).await.unwrap().allowed);

        clock.set(10_000 + 901);
        assert!(limiter.allow("login", "10.0.0.1", policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_check_maps_denial_to_error() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock);

        for _ in 0..5 {
            limiter.check(ACTION_LOGIN, "ana").await.unwrap();
        }
        let err = limiter.check(ACTION_LOGIN, "ana").await.unwrap_err();
        assert!(matches!(err, SecurityError::RateLimited { retry_after: 901, .. }));
    }

    #[tokio::test]
    async fn test_disabled_limiter_allows_everything() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, Arc::new(MemoryCounterStore::new()), Arc::new(clock));

        for _ in 0..20 {
            limiter.check(ACTION_LOGIN, "x").await.unwrap();
        }
    }

    #[test]
    fn test_counter_key_hides_identity() {
        let key = counter_key("login", "10.0.0.1");
        assert!(key.starts_with("rate_limit:login:"));
        assert!(!key.contains("10.0.0.1"));
        assert_eq!(key.len(), "rate_limit:login:".len() + 64);
    }
}

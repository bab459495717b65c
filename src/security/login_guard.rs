use crate::clock::SharedClock;
use crate::security::{CounterStore, LoginConfig, Result, SecurityError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier for lockout bookkeeping, shared by the web form and the API login
pub fn login_identifier(login: &str, client_ip: &str) -> String {
    format!("{}|{}", login.trim().to_lowercase(), client_ip)
}

/// Failed-login counter with a timed lockout
pub struct LoginAttemptGuard {
    config: LoginConfig,
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
}

impl LoginAttemptGuard {
    pub fn new(config: LoginConfig, store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Whether `identifier` may try its credentials now
    pub async fn may_attempt(&self, identifier: &str) -> Result<bool> {
        Ok(self.lockout_remaining(identifier).await? == 0)
    }

    /// Seconds left on the lockout for `identifier`, 0 when not locked
    pub async fn lockout_remaining(&self, identifier: &str) -> Result<i64> {
        let key = attempt_key(identifier);
        let Some(record) = self.store.attempts(&key).await? else {
            return Ok(0);
        };

        let now = self.clock.now();
        if now - record.last_attempt > self.config.lockout_seconds {
            debug!("Lockout window elapsed, clearing attempts");
            self.store.clear_attempts(&key).await?;
            return Ok(0);
        }

        if record.failures < self.config.max_attempts {
            Ok(0)
        } else {
            Ok((record.last_attempt + self.config.lockout_seconds + 1 - now).max(1))
        }
    }

    /// [`LoginAttemptGuard::may_attempt`] with a lockout as an error
    pub async fn ensure_may_attempt(&self, identifier: &str) -> Result<()> {
        match self.lockout_remaining(identifier).await? {
            0 => Ok(()),
            retry_after => Err(SecurityError::LockedOut { retry_after }),
        }
    }

    /// Record the outcome of a credential check
    pub async fn record(&self, identifier: &str, success: bool) -> Result<()> {
        let key = attempt_key(identifier);
        if success {
            return self.store.clear_attempts(&key).await;
        }

        let record = self
            .store
            .record_failure(&key, self.clock.now(), self.config.lockout_seconds)
            .await?;

        if record.failures >= self.config.max_attempts {
            info!(
                "Login identifier locked after {} failed attempts",
                record.failures
            );
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

fn attempt_key(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    format!("login_attempts:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::MemoryCounterStore;

    fn guard(clock: &ManualClock) -> LoginAttemptGuard {
        LoginAttemptGuard::new(
            LoginConfig::default(),
            Arc::new(MemoryCounterStore::new()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures_and_reset_on_success() {
        let clock = ManualClock::new(50_000);
        let guard = guard(&clock);
        let id = login_identifier("Ana@Escola.edu", "203.0.113.9");

        for _ in 0..5 {
            assert!(guard.may_attempt(&id).await.unwrap());
            guard.record(&id, false).await.unwrap();
        }
        assert!(!guard.may_attempt(&id).await.unwrap());
        assert!(matches!(
            guard.ensure_may_attempt(&id).await,
            Err(SecurityError::LockedOut { retry_after: 901 })
        ));

        guard.record(&id, true).await.unwrap();
        assert!(guard.may_attempt(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lockout_expires() {
        let clock = ManualClock::new(0);
        let guard = guard(&clock);
        let id = login_identifier("ana", "203.0.113.9");

        for _ in 0..5 {
            guard.record(&id, false).await.unwrap();
        }
        clock.advance(900);
        assert!(!guard.may_attempt(&id).await.unwrap());

        clock.advance(1);
        assert!(guard.may_attempt(&id).await.unwrap());
        // Counter started over
        guard.record(&id, false).await.unwrap();
        assert!(guard.may_attempt(&id).await.unwrap());
    }

    #[test]
    fn test_identifier_normalises_login() {
        assert_eq!(
            login_identifier("  Ana@Escola.EDU ", "10.1.1.1"),
            "ana@escola.edu|10.1.1.1"
        );
    }
}

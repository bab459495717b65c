use crate::clock::SharedClock;
use crate::security::{CsrfConfig, CsrfToken, Result, SecurityError, SessionRecord, SessionStore};
use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Per-session synchronizer tokens for state-changing requests
pub struct CsrfGuard {
    config: CsrfConfig,
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
}

impl CsrfGuard {
    pub fn new(config: CsrfConfig, store: Arc<dyn SessionStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Token for the session, reusing the current one while it is younger than the TTL.
    /// The session must already exist; a missing one is never recreated.
    pub async fn mint(&self, session_id: &str) -> Result<String> {
        let now = self.clock.now();
        let ttl = self.config.token_ttl_seconds;
        let fresh = new_token();

        let record = self
            .store
            .update(
                session_id,
                Box::new(move |record: &mut SessionRecord| {
                    record.last_activity = now;
                    let live = record
                        .csrf
                        .as_ref()
                        .is_some_and(|token| now - token.minted_at <= ttl);
                    if !live {
                        record.csrf = Some(CsrfToken {
                            value: fresh,
                            minted_at: now,
                        });
                        debug!("Minted new CSRF token");
                    }
                }),
            )
            .await?
            .ok_or(SecurityError::SessionExpired)?;

        record
            .csrf
            .map(|token| token.value)
            .ok_or(SecurityError::CsrfRejected)
    }

    /// Whether `candidate` matches the session's live token
    pub async fn verify(&self, session_id: Option<&str>, candidate: &str) -> Result<bool> {
        let Some(session_id) = session_id else {
            return Ok(false);
        };
        let Some(record) = self.store.load(session_id).await? else {
            return Ok(false);
        };
        let Some(token) = record.csrf else {
            return Ok(false);
        };

        if self.clock.now() - token.minted_at > self.config.token_ttl_seconds {
            debug!("CSRF token expired");
            return Ok(false);
        }

        Ok(token.value.as_bytes().ct_eq(candidate.as_bytes()).into())
    }

    /// POSTs to these paths skip verification
    pub fn is_exempt(&self, path: &str, installed: bool) -> bool {
        if !installed && path.starts_with("/install") {
            return true;
        }
        self.config
            .exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// 32 random bytes, hex encoded
fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

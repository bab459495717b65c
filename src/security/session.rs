use crate::clock::SharedClock;
use crate::logging::{Logger, RequestExtras};
use crate::security::{PrincipalSummary, Result, SecurityError, SessionConfig};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Per-session CSRF token with its mint time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    pub minted_at: i64,
}

/// Signed-in identity bound to a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionLogin {
    pub user: PrincipalSummary,
    pub login_time: i64,
    /// Address the login came from; later requests must match it
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub login: Option<SessionLogin>,
    pub created_at: i64,
    pub last_activity: i64,
    pub last_rotation: i64,
    pub csrf: Option<CsrfToken>,
}

impl SessionRecord {
    pub fn new(now: i64) -> Self {
        Self {
            login: None,
            created_at: now,
            last_activity: now,
            last_rotation: now,
            csrf: None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        self.login.as_ref().map(|l| l.user.id)
    }
}

/// In-place edit applied by [`SessionStore::update`]
pub type SessionUpdate = Box<dyn FnOnce(&mut SessionRecord) + Send>;

/// Server-side session storage keyed by session id
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>>;

    async fn save(&self, id: &str, record: &SessionRecord) -> Result<()>;

    async fn destroy(&self, id: &str) -> Result<()>;

    /// Apply `apply` to the record under `id` and return the result.
    /// An absent id is left absent and yields `None`.
    async fn update(&self, id: &str, apply: SessionUpdate) -> Result<Option<SessionRecord>>;

    /// Drop records idle for longer than `idle_timeout` seconds; returns how many went
    async fn purge(&self, now: i64, idle_timeout: i64) -> Result<u64>;

    /// Move the record under a fresh id and return it; the old id stops working
    async fn regenerate(&self, id: &str) -> Result<String> {
        let new_id = new_session_id();
        if let Some(record) = self.load(id).await? {
            self.save(&new_id, &record).await?;
        }
        self.destroy(id).await?;
        Ok(new_id)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, id: &str, record: &SessionRecord) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn update(&self, id: &str, apply: SessionUpdate) -> Result<Option<SessionRecord>> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(id).map(|record| {
            apply(record);
            record.clone()
        }))
    }

    async fn purge(&self, now: i64, idle_timeout: i64) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| now - record.last_activity <= idle_timeout);
        Ok((before - sessions.len()) as u64)
    }

    async fn regenerate(&self, id: &str) -> Result<String> {
        let new_id = new_session_id();
        let mut sessions = self.sessions.write().await;
        if let Some(record) = sessions.remove(id) {
            sessions.insert(new_id.clone(), record);
        }
        Ok(new_id)
    }
}

/// 256-bit random session id, hex encoded
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Outcome of validating a request's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated {
        /// Current id, which differs from the presented one after a rotation
        session_id: String,
        record: SessionRecord,
    },
    Expired,
    HijackSuspected,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::HijackSuspected)
    }

    /// Terminal states as errors, for handlers that need a signed-in user
    pub fn into_result(self) -> Result<(String, SessionRecord)> {
        match self {
            SessionState::Authenticated { session_id, record } => Ok((session_id, record)),
            SessionState::Expired => Err(SecurityError::SessionExpired),
            SessionState::HijackSuspected => Err(SecurityError::SessionHijack),
            SessionState::Anonymous => Err(SecurityError::MissingCredentials),
        }
    }
}

/// Session lifecycle: login, per-request validation, rotation and logout
pub struct SessionGuard {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
    logger: Arc<Logger>,
}

impl SessionGuard {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        clock: SharedClock,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            logger,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Existing session for `session_id`, or a new anonymous one
    pub async fn start(&self, session_id: Option<&str>) -> Result<(String, SessionRecord)> {
        if let Some(id) = session_id {
            if let Some(record) = self.store.load(id).await? {
                return Ok((id.to_string(), record));
            }
        }

        let id = new_session_id();
        let record = SessionRecord::new(self.clock.now());
        self.store.save(&id, &record).await?;
        debug!("Started new session");
        Ok((id, record))
    }

    /// Bind `user` to the session and issue a fresh id
    pub async fn authenticate(
        &self,
        session_id: &str,
        user: PrincipalSummary,
        ip: &str,
    ) -> Result<String> {
        let now = self.clock.now();
        let mut record = self
            .store
            .load(session_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(now));

        let user_id = user.id;
        record.login = Some(SessionLogin {
            user,
            login_time: now,
            ip: ip.to_string(),
        });
        record.last_activity = now;
        record.last_rotation = now;
        self.store.save(session_id, &record).await?;

        let new_id = self.store.regenerate(session_id).await?;
        info!("Session established for user {}", user_id);
        Ok(new_id)
    }

    /// Validate the session presented with a request coming from `ip`
    pub async fn check(
        &self,
        session_id: Option<&str>,
        ip: &str,
        extras: &RequestExtras,
    ) -> Result<SessionState> {
        let Some(id) = session_id else {
            return Ok(SessionState::Anonymous);
        };
        let Some(record) = self.store.load(id).await? else {
            return Ok(SessionState::Anonymous);
        };
        let Some(login) = record.login.clone() else {
            return Ok(SessionState::Anonymous);
        };

        let now = self.clock.now();
        let extras = extras.clone().with_user(login.user.id);

        if now - login.login_time > self.config.timeout_seconds {
            self.store.destroy(id).await?;
            self.logger
                .security_event(
                    "session_timeout",
                    json!({
                        "user_id": login.user.id,
                        "elapsed": now - login.login_time,
                    }),
                    &extras,
                )
                .await;
            return Ok(SessionState::Expired);
        }

        if self.config.check_ip && login.ip != ip {
            self.store.destroy(id).await?;
            self.logger
                .security_event(
                    "session_hijack_attempt",
                    json!({
                        "user_id": login.user.id,
                        "session_ip": login.ip,
                        "current_ip": ip,
                    }),
                    &extras,
                )
                .await;
            return Ok(SessionState::HijackSuspected);
        }

        let rotate = now - record.last_rotation > self.config.rotation_interval_seconds;
        let touched = self
            .store
            .update(
                id,
                Box::new(move |record: &mut SessionRecord| {
                    record.last_activity = now;
                    if rotate {
                        record.last_rotation = now;
                    }
                }),
            )
            .await?;
        let Some(record) = touched else {
            return Ok(SessionState::Anonymous);
        };

        let mut session_id = id.to_string();
        if rotate {
            session_id = self.store.regenerate(id).await?;
            debug!("Rotated session id for user {}", login.user.id);
        }

        Ok(SessionState::Authenticated { session_id, record })
    }

    /// Drop sessions with no activity for `idle_seconds`
    pub async fn purge_idle(&self, idle_seconds: i64) -> Result<u64> {
        let purged = self.store.purge(self.clock.now(), idle_seconds).await?;
        if purged > 0 {
            debug!("Purged {} idle sessions", purged);
        }
        Ok(purged)
    }

    pub async fn logout(&self, session_id: &str) -> Result<()> {
        self.store.destroy(session_id).await
    }

    /// `Set-Cookie` value carrying `session_id`
    pub fn cookie(&self, session_id: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
            self.config.cookie_name, session_id, self.config.timeout_seconds
        );
        if self.config.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie
    pub fn expired_cookie(&self) -> String {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0",
            self.config.cookie_name
        );
        if self.config.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::logging::{Channel, LoggingConfig};
    use tempfile::TempDir;

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemorySessionStore>,
        logger: Arc<Logger>,
        guard: SessionGuard,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemorySessionStore::new());
        let logger = Arc::new(Logger::new(LoggingConfig {
            log_dir: dir.path().to_path_buf(),
            ..LoggingConfig::default()
        }));
        let guard = SessionGuard::new(
            SessionConfig::default(),
            store.clone(),
            Arc::new(clock.clone()),
            logger.clone(),
        );
        Fixture {
            clock,
            store,
            logger,
            guard,
            _dir: dir,
        }
    }

    fn user() -> PrincipalSummary {
        PrincipalSummary {
            id: 3,
            name: "Carlos Lima".to_string(),
            username: "carlos".to_string(),
            email: "carlos@escola.edu".to_string(),
            level_id: 2,
        }
    }

    async fn login(f: &Fixture, ip: &str) -> String {
        let (anon, _) = f.guard.start(None).await.unwrap();
        let id = f.guard.authenticate(&anon, user(), ip).await.unwrap();
        assert_ne!(anon, id);
        assert!(f.store.load(&anon).await.unwrap().is_none());
        id
    }

    #[tokio::test]
    async fn test_authenticated_session_refreshes_activity() {
        let f = fixture();
        let id = login(&f, "198.51.100.1").await;

        f.clock.advance(60);
        let state = f
            .guard
            .check(Some(&id), "198.51.100.1", &RequestExtras::default())
            .await
            .unwrap();

        match state {
            SessionState::Authenticated { session_id, record } => {
                assert_eq!(session_id, id);
                assert_eq!(record.last_activity, 1_000_060);
                assert_eq!(record.user_id(), Some(3));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_rotates_after_interval() {
        let f = fixture();
        let id = login(&f, "198.51.100.1").await;

        f.clock.advance(1801);
        let (rotated, _) = f
            .guard
            .check(Some(&id), "198.51.100.1", &RequestExtras::default())
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_ne!(rotated, id);
        assert!(f.store.load(&id).await.unwrap().is_none());
        assert!(f.store.load(&rotated).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_destroys_session() {
        let f = fixture();
        let id = login(&f, "198.51.100.1").await;

        f.clock.advance(3601);
        let state = f
            .guard
            .check(Some(&id), "198.51.100.1", &RequestExtras::default())
            .await
            .unwrap();

        assert_eq!(state, SessionState::Expired);
        assert!(f.store.load(&id).await.unwrap().is_none());

        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "session_timeout");
    }

    #[tokio::test]
    async fn test_ip_change_is_treated_as_hijack() {
        let f = fixture();
        let id = login(&f, "198.51.100.1").await;

        let state = f
            .guard
            .check(Some(&id), "203.0.113.200", &RequestExtras::default())
            .await
            .unwrap();
        assert_eq!(state, SessionState::HijackSuspected);
        assert!(matches!(
            state.into_result(),
            Err(SecurityError::SessionHijack)
        ));

        // No way back with the old id, even from the original address
        let again = f
            .guard
            .check(Some(&id), "198.51.100.1", &RequestExtras::default())
            .await
            .unwrap();
        assert_eq!(again, SessionState::Anonymous);

        let logged = f.logger.file_sink().read_entries(Channel::Security).await.unwrap();
        assert_eq!(logged[0].message, "session_hijack_attempt");
        assert_eq!(logged[0].context["session_ip"], "198.51.100.1");
        assert_eq!(logged[0].context["current_ip"], "203.0.113.200");
    }

    #[tokio::test]
    async fn test_update_leaves_missing_sessions_absent() {
        let store = MemorySessionStore::new();
        let updated = store
            .update("gone", Box::new(|record: &mut SessionRecord| record.last_activity = 99))
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(store.len().await, 0);

        store.save("live", &SessionRecord::new(1)).await.unwrap();
        let updated = store
            .update("live", Box::new(|record: &mut SessionRecord| record.last_activity = 99))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.last_activity, 99);
        assert_eq!(store.load("live").await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_purge_drops_idle_sessions() {
        let f = fixture();
        for _ in 0..5 {
            f.guard.start(None).await.unwrap();
        }
        let id = login(&f, "198.51.100.1").await;
        assert_eq!(f.store.len().await, 6);

        f.clock.advance(3000);
        let (current, _) = f
            .guard
            .check(Some(&id), "198.51.100.1", &RequestExtras::default())
            .await
            .unwrap()
            .into_result()
            .unwrap();

        f.clock.advance(1000);
        assert_eq!(f.guard.purge_idle(3600).await.unwrap(), 5);
        assert_eq!(f.store.len().await, 1);
        assert!(f.store.load(&current).await.unwrap().is_some());

        f.clock.advance(3600);
        assert_eq!(f.guard.purge_idle(3600).await.unwrap(), 1);
        assert_eq!(f.store.len().await, 0);
    }

    #[test]
    fn test_cookie_attributes() {
        let f = fixture();
        let cookie = f.guard.cookie("abc");
        assert!(cookie.starts_with("SECURE_SESSION_ID=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(!cookie.contains("Secure;") && !cookie.ends_with("Secure"));
        assert!(f.guard.expired_cookie().contains("Max-Age=0"));
    }
}

use crate::security::{Result, SecurityError};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::debug;

/// `status_id` of an account that may sign in
pub const ACTIVE_STATUS: i64 = 1;

/// Account as stored by the identity store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub level_id: i64,
    pub status_id: i64,
    pub last_access: Option<chrono::DateTime<chrono::Utc>>,
}

impl Principal {
    pub fn is_active(&self) -> bool {
        self.status_id == ACTIVE_STATUS
    }

    pub fn summary(&self) -> PrincipalSummary {
        PrincipalSummary {
            id: self.id,
            name: self.name.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            level_id: self.level_id,
        }
    }
}

/// Public view of a principal returned by the login endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSummary {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub email: String,
    pub level_id: i64,
}

/// Lookup seam over the application's user table
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Principal>>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>>;

    /// Resolve the web login field, which accepts either an email or a username
    async fn find_by_login(&self, login: &str) -> Result<Option<Principal>> {
        match self.find_by_email(login).await? {
            Some(principal) => Ok(Some(principal)),
            None => self.find_by_username(login).await,
        }
    }

    async fn record_login(&self, id: i64) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    principals: Arc<RwLock<HashMap<i64, Principal>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, principal: Principal) {
        self.principals.write().await.insert(principal.id, principal);
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Principal>> {
        Ok(self.principals.read().await.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>> {
        Ok(self
            .principals
            .read()
            .await
            .values()
            .find(|p| p.username == username)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        Ok(self
            .principals
            .read()
            .await
            .values()
            .find(|p| p.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn record_login(&self, id: i64) -> Result<()> {
        if let Some(principal) = self.principals.write().await.get_mut(&id) {
            principal.last_access = Some(chrono::Utc::now());
        }
        Ok(())
    }
}

const PRINCIPAL_COLUMNS: &str =
    "id, name, username, email, password, level_id, status_id, last_access";

/// Reads the application's `users` table
pub struct PgIdentityStore {
    db_pool: Arc<PgPool>,
}

impl PgIdentityStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    async fn find_one(&self, filter: &str, value: &str) -> Result<Option<Principal>> {
        let sql = format!("SELECT {PRINCIPAL_COLUMNS} FROM users WHERE {filter} = $1 LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        row.map(row_to_principal).transpose()
    }
}

/// Column type mismatches surface as [`SecurityError::Storage`]
fn row_to_principal(row: sqlx::postgres::PgRow) -> Result<Principal> {
    Ok(Principal {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password")?,
        level_id: row.try_get("level_id")?,
        status_id: row.try_get("status_id")?,
        last_access: row.try_get("last_access")?,
    })
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Principal>> {
        let sql = format!("SELECT {PRINCIPAL_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db_pool.as_ref())
            .await?;
        row.map(row_to_principal).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Principal>> {
        self.find_one("username", username).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>> {
        self.find_one("LOWER(email)", &email.to_lowercase()).await
    }

    async fn record_login(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_access = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }
}

/// Argon2id hash in PHC string form
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SecurityError::Configuration {
            message: format!("Failed to hash password: {e}"),
        })
}

/// Compare `password` with a stored PHC hash; an unparseable hash never matches
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        debug!("Stored password hash is not a PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Spend the same work as a real verification when the account does not exist
pub fn dummy_verify(password: &str) {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();
    let hash = DUMMY_HASH.get_or_init(|| hash_password("school-guard-dummy-password").ok());
    if let Some(hash) = hash {
        let _ = verify_password(password, hash);
    }
}

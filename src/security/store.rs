use crate::security::{Result, SecurityError};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// State of a fixed window after a hit was counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Hits in the current window, saturating one past the ceiling
    pub count: u32,
    pub window_start: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRecord {
    pub failures: u32,
    pub last_attempt: i64,
}

/// Shared counters for rate windows and failed logins.
///
/// Every method is a single atomic read-modify-write so concurrent requests
/// for the same key cannot both slip under a ceiling.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one hit in the window for `key`, opening a new window once
    /// `now - window_start > window_seconds`
    async fn hit(&self, key: &str, max: u32, window_seconds: i64, now: i64) -> Result<WindowHit>;

    async fn attempts(&self, key: &str) -> Result<Option<AttemptRecord>>;

    /// Record one failed login; a record idle for longer than `lockout_seconds` starts over
    async fn record_failure(&self, key: &str, now: i64, lockout_seconds: i64)
        -> Result<AttemptRecord>;

    async fn clear_attempts(&self, key: &str) -> Result<()>;

    /// Drop entries untouched for more than `max_age_seconds`
    async fn purge(&self, now: i64, max_age_seconds: i64) -> Result<u64>;
}

/// In-process counters, suitable for a single server
#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Arc<RwLock<HashMap<String, WindowHit>>>,
    attempts: Arc<RwLock<HashMap<String, AttemptRecord>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, max: u32, window_seconds: i64, now: i64) -> Result<WindowHit> {
        let mut windows = self.windows.write().await;
        let entry = windows.entry(key.to_string()).or_insert(WindowHit {
            count: 0,
            window_start: now,
        });

        if now - entry.window_start > window_seconds {
            entry.count = 1;
            entry.window_start = now;
        } else {
            entry.count = (entry.count + 1).min(max.saturating_add(1));
        }

        Ok(*entry)
    }

    async fn attempts(&self, key: &str) -> Result<Option<AttemptRecord>> {
        Ok(self.attempts.read().await.get(key).copied())
    }

    async fn record_failure(
        &self,
        key: &str,
        now: i64,
        lockout_seconds: i64,
    ) -> Result<AttemptRecord> {
        let mut attempts = self.attempts.write().await;
        let entry = attempts.entry(key.to_string()).or_insert(AttemptRecord {
            failures: 0,
            last_attempt: now,
        });

        if now - entry.last_attempt > lockout_seconds {
            entry.failures = 0;
        }
        entry.failures = entry.failures.saturating_add(1);
        entry.last_attempt = now;

        Ok(*entry)
    }

    async fn clear_attempts(&self, key: &str) -> Result<()> {
        self.attempts.write().await.remove(key);
        Ok(())
    }

    async fn purge(&self, now: i64, max_age_seconds: i64) -> Result<u64> {
        let mut windows = self.windows.write().await;
        let mut attempts = self.attempts.write().await;
        let before = windows.len() + attempts.len();

        windows.retain(|_, w| now - w.window_start <= max_age_seconds);
        attempts.retain(|_, a| now - a.last_attempt <= max_age_seconds);

        Ok((before - windows.len() - attempts.len()) as u64)
    }
}

/// PostgreSQL-backed counters shared by every process behind the load balancer
pub struct PgCounterStore {
    db_pool: Arc<PgPool>,
}

impl PgCounterStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_windows (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                window_start BIGINT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS login_attempts (
                key TEXT PRIMARY KEY,
                failures INTEGER NOT NULL,
                last_attempt BIGINT NOT NULL
            );
            "#,
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(self.db_pool.as_ref())
                .await
                .map_err(|e| SecurityError::Storage {
                    message: format!("Failed to create counter table: {e}"),
                })?;
        }

        info!("Counter tables ready");
        Ok(())
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn hit(&self, key: &str, max: u32, window_seconds: i64, now: i64) -> Result<WindowHit> {
        let ceiling = i32::try_from(max.saturating_add(1)).unwrap_or(i32::MAX);

        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (key, count, window_start)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE SET
                count = CASE
                    WHEN $2 - rate_limit_windows.window_start > $3 THEN 1
                    ELSE LEAST(rate_limit_windows.count + 1, $4)
                END,
                window_start = CASE
                    WHEN $2 - rate_limit_windows.window_start > $3 THEN $2
                    ELSE rate_limit_windows.window_start
                END
            RETURNING count, window_start
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(window_seconds)
        .bind(ceiling)
        .fetch_one(self.db_pool.as_ref())
        .await?;

        let count: i32 = row.try_get("count")?;
        Ok(WindowHit {
            count: count.max(0) as u32,
            window_start: row.try_get("window_start")?,
        })
    }

    async fn attempts(&self, key: &str) -> Result<Option<AttemptRecord>> {
        let row = sqlx::query("SELECT failures, last_attempt FROM login_attempts WHERE key = $1")
            .bind(key)
            .fetch_optional(self.db_pool.as_ref())
            .await?;

        row.map(|row| -> Result<AttemptRecord> {
            let failures: i32 = row.try_get("failures")?;
            Ok(AttemptRecord {
                failures: failures.max(0) as u32,
                last_attempt: row.try_get("last_attempt")?,
            })
        })
        .transpose()
    }

    async fn record_failure(
        &self,
        key: &str,
        now: i64,
        lockout_seconds: i64,
    ) -> Result<AttemptRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO login_attempts (key, failures, last_attempt)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE SET
                failures = CASE
                    WHEN $2 - login_attempts.last_attempt > $3 THEN 1
                    ELSE login_attempts.failures + 1
                END,
                last_attempt = $2
            RETURNING failures, last_attempt
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(lockout_seconds)
        .fetch_one(self.db_pool.as_ref())
        .await?;

        let failures: i32 = row.try_get("failures")?;
        Ok(AttemptRecord {
            failures: failures.max(0) as u32,
            last_attempt: row.try_get("last_attempt")?,
        })
    }

    async fn clear_attempts(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM login_attempts WHERE key = $1")
            .bind(key)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn purge(&self, now: i64, max_age_seconds: i64) -> Result<u64> {
        let cutoff = now - max_age_seconds;

        let windows = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
            .bind(cutoff)
            .execute(self.db_pool.as_ref())
            .await?
            .rows_affected();
        let attempts = sqlx::query("DELETE FROM login_attempts WHERE last_attempt < $1")
            .bind(cutoff)
            .execute(self.db_pool.as_ref())
            .await?
            .rows_affected();

        debug!("Purged {} stale counters", windows + attempts);
        Ok(windows + attempts)
    }
}

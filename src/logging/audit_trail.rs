//! Entity change history: who touched which row, with before and after snapshots.
//!
//! Unlike the `audit` log channel, records here are queryable by user, action,
//! table and date, and are pruned by age rather than by file rotation.

use crate::clock::SharedClock;
use crate::logging::{redact, RequestExtras};
use crate::security::{Result, SecurityError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub table_name: String,
    pub record_id: Option<i64>,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

/// A change to be recorded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditChange {
    pub action: String,
    pub table_name: String,
    pub record_id: Option<i64>,
    pub old_data: Option<Value>,
    pub new_data: Option<Value>,
    /// Acting user; falls back to the request's user
    pub user_id: Option<i64>,
}

impl AuditChange {
    pub fn new(action: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    pub fn record(mut self, record_id: i64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn before(mut self, old_data: Value) -> Self {
        self.old_data = Some(old_data);
        self
    }

    pub fn after(mut self, new_data: Value) -> Self {
        self.new_data = Some(new_data);
        self
    }

    pub fn by(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Criteria for [`AuditTrail::query`] and [`AuditTrail::count`]; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<i64>,
    pub action: Option<String>,
    pub table_name: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.user_id.map_or(true, |id| record.user_id == Some(id))
            && self.action.as_ref().map_or(true, |a| &record.action == a)
            && self.table_name.as_ref().map_or(true, |t| &record.table_name == t)
            && self.date_from.map_or(true, |from| record.created_at >= from)
            && self.date_to.map_or(true, |to| record.created_at <= to)
    }
}

/// Storage for audit records, newest first on read
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Store `record` under a fresh id, which is returned; `record.id` is ignored
    async fn insert(&self, record: AuditRecord) -> Result<i64>;

    async fn query(&self, filter: &AuditFilter, limit: i64, offset: i64)
        -> Result<Vec<AuditRecord>>;

    async fn count(&self, filter: &AuditFilter) -> Result<u64>;

    /// Delete records created before `cutoff`
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
    next_id: AtomicI64,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, mut record: AuditRecord) -> Result<i64> {
        let mut records = self.records.write().await;
        record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = record.id;
        records.push(record);
        Ok(id)
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<_> = records.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records.iter().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.created_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

/// `audit_logs` table in PostgreSQL
pub struct PgAuditStore {
    db_pool: Arc<PgPool>,
}

const AUDIT_COLUMNS: &str = "id, user_id, action, table_name, record_id, old_data, new_data, \
                             ip_address, user_agent, created_at";

// Unset filter fields bind as NULL and match every row
const AUDIT_WHERE: &str = r#"
    WHERE ($1::BIGINT IS NULL OR user_id = $1)
      AND ($2::TEXT IS NULL OR action = $2)
      AND ($3::TEXT IS NULL OR table_name = $3)
      AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
      AND ($5::TIMESTAMPTZ IS NULL OR created_at <= $5)
"#;

impl PgAuditStore {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id BIGSERIAL PRIMARY KEY,
                user_id BIGINT,
                action TEXT NOT NULL,
                table_name TEXT NOT NULL,
                record_id BIGINT,
                old_data JSONB,
                new_data JSONB,
                ip_address TEXT,
                user_agent TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs (created_at);",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_user_id ON audit_logs (user_id);",
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_table_record ON audit_logs (table_name, record_id);",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(self.db_pool.as_ref())
                .await
                .map_err(|e| SecurityError::Storage {
                    message: format!("Failed to create audit_logs table: {e}"),
                })?;
        }

        info!("Audit trail table ready");
        Ok(())
    }
}

fn row_to_record(row: sqlx::postgres::PgRow) -> Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        action: row.try_get("action")?,
        table_name: row.try_get("table_name")?,
        record_id: row.try_get("record_id")?,
        old_data: row.try_get("old_data")?,
        new_data: row.try_get("new_data")?,
        ip_address: row
            .try_get::<Option<String>, _>("ip_address")?
            .unwrap_or_else(|| UNKNOWN.to_string()),
        user_agent: row
            .try_get::<Option<String>, _>("user_agent")?
            .unwrap_or_else(|| UNKNOWN.to_string()),
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, record: AuditRecord) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO audit_logs (
                user_id, action, table_name, record_id, old_data, new_data,
                ip_address, user_agent, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(record.user_id)
        .bind(&record.action)
        .bind(&record.table_name)
        .bind(record.record_id)
        .bind(&record.old_data)
        .bind(&record.new_data)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.created_at)
        .fetch_one(self.db_pool.as_ref())
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs {AUDIT_WHERE} \
             ORDER BY created_at DESC, id DESC LIMIT $6 OFFSET $7"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.user_id)
            .bind(filter.action.as_deref())
            .bind(filter.table_name.as_deref())
            .bind(filter.date_from)
            .bind(filter.date_to)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db_pool.as_ref())
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM audit_logs {AUDIT_WHERE}");
        let row = sqlx::query(&sql)
            .bind(filter.user_id)
            .bind(filter.action.as_deref())
            .bind(filter.table_name.as_deref())
            .bind(filter.date_from)
            .bind(filter.date_to)
            .fetch_one(self.db_pool.as_ref())
            .await?;

        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM audit_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.db_pool.as_ref())
            .await?
            .rows_affected())
    }
}

/// Records entity changes and answers history queries
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.clock.now(), 0).unwrap_or_default()
    }

    /// Store one change with credentials masked in both snapshots.
    /// Failures are logged and swallowed; the returned id is `None` then.
    pub async fn record(&self, change: AuditChange, extras: &RequestExtras) -> Option<i64> {
        let mask = |data: Option<Value>| {
            data.map(|mut value| {
                redact(&mut value);
                value
            })
        };

        let record = AuditRecord {
            id: 0,
            user_id: change.user_id.or(extras.user_id),
            action: change.action,
            table_name: change.table_name,
            record_id: change.record_id,
            old_data: mask(change.old_data),
            new_data: mask(change.new_data),
            ip_address: extras.ip.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            user_agent: extras
                .user_agent
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            created_at: self.now(),
        };

        match self.store.insert(record).await {
            Ok(id) => {
                debug!("Audit record {} stored", id);
                Some(id)
            }
            Err(e) => {
                warn!("Failed to store audit record: {}", e);
                None
            }
        }
    }

    /// Matching records, newest first. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditRecord>> {
        self.store
            .query(filter, limit.clamp(1, MAX_PAGE_SIZE), offset.max(0))
            .await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<u64> {
        self.store.count(filter).await
    }

    /// Delete records older than `days` days; returns how many went
    pub async fn cleanup(&self, days: i64) -> Result<u64> {
        let cutoff = self.now() - Duration::days(days);
        let removed = self.store.delete_before(cutoff).await?;
        info!("Removed {} audit records older than {} days", removed, days);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::logging::REDACTED;
    use serde_json::json;

    const DAY: i64 = 86_400;

    fn trail(clock: &ManualClock) -> AuditTrail {
        AuditTrail::new(Arc::new(MemoryAuditStore::new()), Arc::new(clock.clone()))
    }

    fn request(user_id: Option<i64>) -> RequestExtras {
        RequestExtras {
            ip: Some("198.51.100.20".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            user_id,
            ..RequestExtras::default()
        }
    }

    /// Store whose inserts fail
    struct BrokenStore;

    #[async_trait]
    impl AuditStore for BrokenStore {
        async fn insert(&self, _: AuditRecord) -> Result<i64> {
            Err(SecurityError::Storage {
                message: "disk full".to_string(),
            })
        }

        async fn query(&self, _: &AuditFilter, _: i64, _: i64) -> Result<Vec<AuditRecord>> {
            Ok(Vec::new())
        }

        async fn count(&self, _: &AuditFilter) -> Result<u64> {
            Ok(0)
        }

        async fn delete_before(&self, _: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_record_masks_credentials_and_keeps_request_details() {
        let clock = ManualClock::new(1_700_000_000);
        let trail = trail(&clock);

        let id = trail
            .record(
                AuditChange::new("update", "users")
                    .record(7)
                    .before(json!({"email": "old@escola.edu", "password": "$argon2id$old"}))
                    .after(json!({"email": "new@escola.edu", "profile": {"api_key": "k"}})),
                &request(Some(3)),
            )
            .await
            .unwrap();

        let records = trail.query(&AuditFilter::default(), 50, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, id);
        assert_eq!(record.user_id, Some(3));
        assert_eq!(record.record_id, Some(7));
        assert_eq!(record.ip_address, "198.51.100.20");
        assert_eq!(record.user_agent, "Mozilla/5.0");
        assert_eq!(record.created_at.timestamp(), 1_700_000_000);

        let old = record.old_data.as_ref().unwrap();
        assert_eq!(old["email"], "old@escola.edu");
        assert_eq!(old["password"], REDACTED);
        assert_eq!(record.new_data.as_ref().unwrap()["profile"]["api_key"], REDACTED);
    }

    #[tokio::test]
    async fn test_explicit_actor_and_missing_request_details() {
        let clock = ManualClock::new(0);
        let trail = trail(&clock);

        trail
            .record(AuditChange::new("delete", "turmas").by(9), &RequestExtras::default())
            .await
            .unwrap();

        let records = trail.query(&AuditFilter::default(), 50, 0).await.unwrap();
        assert_eq!(records[0].user_id, Some(9));
        assert_eq!(records[0].ip_address, "unknown");
        assert!(records[0].old_data.is_none());
        assert!(records[0].new_data.is_none());
    }

    #[tokio::test]
    async fn test_query_filters_pages_newest_first() {
        let clock = ManualClock::new(1_700_000_000);
        let trail = trail(&clock);

        for (action, table, user) in [
            ("create", "alunos", 1),
            ("update", "alunos", 1),
            ("update", "users", 2),
            ("delete", "alunos", 2),
        ] {
            trail
                .record(AuditChange::new(action, table), &request(Some(user)))
                .await
                .unwrap();
            clock.advance(DAY);
        }

        let alunos = AuditFilter {
            table_name: Some("alunos".to_string()),
            ..AuditFilter::default()
        };
        let page = trail.query(&alunos, 2, 0).await.unwrap();
        assert_eq!(
            page.iter().map(|r| r.action.as_str()).collect::<Vec<_>>(),
            ["delete", "update"]
        );
        let rest = trail.query(&alunos, 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].action, "create");
        assert_eq!(trail.count(&alunos).await.unwrap(), 3);

        let by_user = AuditFilter {
            user_id: Some(2),
            action: Some("update".to_string()),
            ..AuditFilter::default()
        };
        assert_eq!(trail.count(&by_user).await.unwrap(), 1);

        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let window = AuditFilter {
            date_from: Some(start + Duration::days(1)),
            date_to: Some(start + Duration::days(2)),
            ..AuditFilter::default()
        };
        assert_eq!(trail.count(&window).await.unwrap(), 2);

        // Out of range page sizes are clamped
        assert_eq!(trail.query(&AuditFilter::default(), 0, -5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_records() {
        let clock = ManualClock::new(1_700_000_000);
        let trail = trail(&clock);

        trail
            .record(AuditChange::new("create", "alunos"), &request(None))
            .await
            .unwrap();
        clock.advance(100 * DAY);
        trail
            .record(AuditChange::new("update", "alunos"), &request(None))
            .await
            .unwrap();

        assert_eq!(trail.cleanup(DEFAULT_RETENTION_DAYS).await.unwrap(), 1);
        let left = trail.query(&AuditFilter::default(), 50, 0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action, "update");
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let clock = ManualClock::new(0);
        let trail = AuditTrail::new(Arc::new(BrokenStore), Arc::new(clock));

        let id = trail
            .record(AuditChange::new("update", "users"), &request(Some(1)))
            .await;
        assert!(id.is_none());
    }
}

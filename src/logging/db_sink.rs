use crate::logging::LogEntry;
use crate::security::{Result, SecurityError};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DB_INSERT_TIMEOUT: Duration = Duration::from_secs(2);

/// Column values written to `system_logs`
#[derive(Debug, Clone, PartialEq)]
pub struct SystemLogRow {
    pub level: String,
    pub channel: String,
    pub message: String,
    pub context: Value,
    pub ip_address: String,
    pub user_agent: String,
    pub user_id: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&LogEntry> for SystemLogRow {
    fn from(entry: &LogEntry) -> Self {
        Self {
            level: entry.level.as_str().to_uppercase(),
            channel: entry.channel.as_str().to_string(),
            message: entry.message.clone(),
            context: entry.context.clone(),
            ip_address: entry.extra.ip.clone(),
            user_agent: entry.extra.user_agent.clone(),
            user_id: entry.extra.user_id,
            created_at: entry.timestamp,
        }
    }
}

/// Optional copy of every entry in PostgreSQL
pub struct DbSink {
    db_pool: Arc<PgPool>,
}

impl DbSink {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self { db_pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS system_logs (
                id BIGSERIAL PRIMARY KEY,
                level TEXT NOT NULL,
                channel TEXT NOT NULL,
                message TEXT NOT NULL,
                context JSONB,
                ip_address TEXT,
                user_agent TEXT,
                user_id BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_system_logs_created_at ON system_logs (created_at);",
            "CREATE INDEX IF NOT EXISTS idx_system_logs_channel ON system_logs (channel);",
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(self.db_pool.as_ref())
                .await
                .map_err(|e| SecurityError::Storage {
                    message: format!("Failed to create system_logs table: {e}"),
                })?;
        }

        info!("Database log sink initialized");
        Ok(())
    }

    pub async fn insert(&self, entry: &LogEntry) -> Result<()> {
        let row = SystemLogRow::from(entry);

        let insert = sqlx::query(
            r#"
            INSERT INTO system_logs (
                level, channel, message, context, ip_address, user_agent, user_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&row.level)
        .bind(&row.channel)
        .bind(&row.message)
        .bind(&row.context)
        .bind(&row.ip_address)
        .bind(&row.user_agent)
        .bind(row.user_id)
        .bind(row.created_at)
        .execute(self.db_pool.as_ref());

        match tokio::time::timeout(DB_INSERT_TIMEOUT, insert).await {
            Ok(result) => result.map(|_| ()).map_err(SecurityError::from),
            Err(_) => Err(SecurityError::Storage {
                message: "system_logs insert timed out".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{Channel, EntryExtra, LogLevel};
    use serde_json::json;

    #[test]
    fn test_row_from_entry() {
        let entry = LogEntry {
            timestamp: chrono::Utc::now(),
            level: LogLevel::Notice,
            channel: Channel::Auth,
            message: "password changed".to_string(),
            context: json!({"senha": "[REDACTED]"}),
            extra: EntryExtra {
                ip: "192.0.2.10".to_string(),
                user_agent: "Firefox".to_string(),
                request_uri: "/profile".to_string(),
                request_method: "POST".to_string(),
                user_id: Some(9),
                session_id: None,
                memory_usage: 0,
                execution_time: 0.0,
            },
        };

        let row = SystemLogRow::from(&entry);
        assert_eq!(row.level, "NOTICE");
        assert_eq!(row.channel, "auth");
        assert_eq!(row.user_id, Some(9));
        assert_eq!(row.ip_address, "192.0.2.10");
        assert_eq!(row.context["senha"], "[REDACTED]");
    }
}

//! Structured audit and security logging.
//!
//! Every entry is redacted once, then fanned out to the per-channel JSON-lines
//! files, the optional `system_logs` table and the optional webhook. Sink
//! failures never reach the caller.

pub mod analyzer;
pub mod audit_trail;
pub mod db_sink;
pub mod file_sink;
pub mod redact;
pub mod webhook;

pub use analyzer::*;
pub use audit_trail::{
    AuditChange, AuditFilter, AuditRecord, AuditStore, AuditTrail, MemoryAuditStore, PgAuditStore,
};
pub use db_sink::DbSink;
pub use file_sink::FileSink;
pub use redact::{is_sensitive_key, redact, REDACTED};
pub use webhook::{WebhookPayload, WebhookSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Seconds after which `performance` entries are raised to WARNING
pub const SLOW_OPERATION_SECONDS: f64 = 1.0;
/// Seconds after which `sql_query` entries are raised to WARNING
pub const SLOW_QUERY_SECONDS: f64 = 0.1;

/// Syslog-style severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl LogLevel {
    pub const ALL: [LogLevel; 8] = [
        LogLevel::Emergency,
        LogLevel::Alert,
        LogLevel::Critical,
        LogLevel::Error,
        LogLevel::Warning,
        LogLevel::Notice,
        LogLevel::Info,
        LogLevel::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Alert => "alert",
            LogLevel::Emergency => "emergency",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info | LogLevel::Notice => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency => {
                tracing::Level::ERROR
            }
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown log level: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    System,
    Security,
    Api,
    Database,
    Auth,
    Audit,
    Performance,
    Error,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::System,
        Channel::Security,
        Channel::Api,
        Channel::Database,
        Channel::Auth,
        Channel::Audit,
        Channel::Performance,
        Channel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::System => "system",
            Channel::Security => "security",
            Channel::Api => "api",
            Channel::Database => "database",
            Channel::Auth => "auth",
            Channel::Audit => "audit",
            Channel::Performance => "performance",
            Channel::Error => "error",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown log channel: {s}"))
    }
}

/// Request details attached to an entry
#[derive(Debug, Clone, Default)]
pub struct RequestExtras {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_uri: Option<String>,
    pub request_method: Option<String>,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub started_at: Option<Instant>,
}

impl RequestExtras {
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryExtra {
    pub ip: String,
    pub user_agent: String,
    pub request_uri: String,
    pub request_method: String,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub memory_usage: u64,
    pub execution_time: f64,
}

/// One line of a channel log file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub channel: Channel,
    pub message: String,
    pub context: Value,
    pub extra: EntryExtra,
}

impl LogEntry {
    /// Source address recorded for the entry, when it came from a request
    pub fn ip(&self) -> Option<&str> {
        match self.extra.ip.as_str() {
            "" | "cli" => None,
            ip => Some(ip),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub max_file_size: u64,
    pub max_files: usize,
    pub to_database: bool,
    pub to_external: bool,
    pub webhook_url: Option<String>,
    /// Keep DEBUG entries (development or APP_DEBUG)
    pub debug_enabled: bool,
    pub environment: String,
    pub server: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("storage/logs"),
            max_file_size: 10 * 1024 * 1024, // 10MB
            max_files: 30,
            to_database: false,
            to_external: false,
            webhook_url: None,
            debug_enabled: false,
            environment: "production".to_string(),
            server: "localhost".to_string(),
        }
    }
}

/// Audit and security logger shared by every layer
pub struct Logger {
    config: LoggingConfig,
    file_sink: FileSink,
    db_sink: Option<DbSink>,
    webhook: Option<WebhookSink>,
    process: Mutex<sysinfo::System>,
}

impl Logger {
    pub fn new(config: LoggingConfig) -> Self {
        let file_sink = FileSink::new(&config.log_dir, config.max_file_size, config.max_files);

        let webhook = match (&config.webhook_url, config.to_external) {
            (Some(url), true) => WebhookSink::new(url, &config.server, &config.environment)
                .map_err(|e| warn!("Log webhook disabled: {}", e))
                .ok(),
            _ => None,
        };

        Self {
            config,
            file_sink,
            db_sink: None,
            webhook,
            process: Mutex::new(sysinfo::System::new()),
        }
    }

    /// Attach the `system_logs` sink; ignored unless database logging is enabled
    pub fn with_database(mut self, db_sink: DbSink) -> Self {
        if self.config.to_database {
            self.db_sink = Some(db_sink);
        }
        self
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    pub fn file_sink(&self) -> &FileSink {
        &self.file_sink
    }

    pub async fn log(&self, level: LogLevel, channel: Channel, message: &str, context: Value) {
        self.log_with(level, channel, message, context, &RequestExtras::default())
            .await
    }

    pub async fn log_with(
        &self,
        level: LogLevel,
        channel: Channel,
        message: &str,
        context: Value,
        extras: &RequestExtras,
    ) {
        if !self.config.enabled {
            return;
        }
        if level == LogLevel::Debug && !self.config.debug_enabled {
            return;
        }

        let entry = self.build_entry(level, channel, message, context, extras);
        mirror_to_tracing(&entry);

        if let Err(e) = self.file_sink.append(&entry).await {
            // Last resort so the entry is not lost silently
            eprintln!(
                "school-guard: failed to write {} log: {}: {}",
                entry.channel, e, entry.message
            );
        }

        if let Some(db_sink) = &self.db_sink {
            if let Err(e) = db_sink.insert(&entry).await {
                debug!("Database log sink failed: {}", e);
            }
        }

        if let Some(webhook) = &self.webhook {
            webhook.dispatch(&entry);
        }
    }

    fn build_entry(
        &self,
        level: LogLevel,
        channel: Channel,
        message: &str,
        mut context: Value,
        extras: &RequestExtras,
    ) -> LogEntry {
        if !context.is_object() && !context.is_null() {
            context = json!({ "value": context });
        }
        if context.is_null() {
            context = json!({});
        }
        redact(&mut context);

        LogEntry {
            timestamp: Utc::now(),
            level,
            channel,
            message: message.to_string(),
            context,
            extra: EntryExtra {
                ip: extras.ip.clone().unwrap_or_else(|| "cli".to_string()),
                user_agent: extras
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| "cli".to_string()),
                request_uri: extras
                    .request_uri
                    .clone()
                    .unwrap_or_else(|| "cli".to_string()),
                request_method: extras
                    .request_method
                    .clone()
                    .unwrap_or_else(|| "cli".to_string()),
                user_id: extras.user_id,
                session_id: extras.session_id.clone(),
                memory_usage: self.memory_usage(),
                execution_time: extras
                    .started_at
                    .map(|start| start.elapsed().as_secs_f64())
                    .unwrap_or(0.0),
            },
        }
    }

    fn memory_usage(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        match self.process.lock() {
            Ok(mut system) => {
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    pub async fn emergency(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Emergency, channel, message, context).await
    }

    pub async fn alert(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Alert, channel, message, context).await
    }

    pub async fn critical(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Critical, channel, message, context).await
    }

    pub async fn error(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Error, channel, message, context).await
    }

    pub async fn warning(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Warning, channel, message, context).await
    }

    pub async fn notice(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Notice, channel, message, context).await
    }

    pub async fn info(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Info, channel, message, context).await
    }

    pub async fn debug(&self, channel: Channel, message: &str, context: Value) {
        self.log(LogLevel::Debug, channel, message, context).await
    }

    /// Security-relevant denial or anomaly, written to the security channel
    pub async fn security_event(&self, event: &str, context: Value, extras: &RequestExtras) {
        self.log_with(LogLevel::Warning, Channel::Security, event, context, extras)
            .await
    }

    /// Successful access worth keeping for audit
    pub async fn audit(&self, event: &str, context: Value, extras: &RequestExtras) {
        self.log_with(LogLevel::Info, Channel::Audit, event, context, extras)
            .await
    }

    pub async fn sql_query(&self, query: &str, params: Value, execution_time: f64) {
        let level = if execution_time > SLOW_QUERY_SECONDS {
            LogLevel::Warning
        } else {
            LogLevel::Debug
        };
        let context = json!({
            "query": query,
            "params": params,
            "execution_time": execution_time,
        });
        self.log(level, Channel::Database, "SQL Query executed", context)
            .await
    }

    pub async fn performance(&self, operation: &str, elapsed: Duration, context: Value) {
        let execution_time = elapsed.as_secs_f64();
        let level = if execution_time > SLOW_OPERATION_SECONDS {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };

        let mut context = match context {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        context.insert("execution_time".to_string(), json!(execution_time));
        context.insert("memory_usage".to_string(), json!(self.memory_usage()));

        self.log(
            level,
            Channel::Performance,
            &format!("Performance: {operation}"),
            Value::Object(context),
        )
        .await
    }

    pub async fn exception(&self, err: &(dyn std::error::Error + 'static), context: Value) {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let mut context = match context {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        context.insert("exception".to_string(), json!(error_type_name(err)));
        context.insert("message".to_string(), json!(err.to_string()));
        context.insert("sources".to_string(), json!(chain));

        self.log(
            LogLevel::Error,
            Channel::Error,
            "Exception occurred",
            Value::Object(context),
        )
        .await
    }
}

fn error_type_name(err: &dyn std::error::Error) -> String {
    // Debug output starts with the variant or type name
    let debug = format!("{err:?}");
    debug
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default()
        .to_string()
}

fn mirror_to_tracing(entry: &LogEntry) {
    let channel = entry.channel.as_str();
    match tracing::Level::from(entry.level) {
        tracing::Level::ERROR => error!(channel, context = %entry.context, "{}", entry.message),
        tracing::Level::WARN => warn!(channel, context = %entry.context, "{}", entry.message),
        tracing::Level::INFO => info!(channel, context = %entry.context, "{}", entry.message),
        _ => debug!(channel, context = %entry.context, "{}", entry.message),
    }
}

pub type SharedLogger = Arc<Logger>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logger(dir: &TempDir, debug_enabled: bool) -> Logger {
        Logger::new(LoggingConfig {
            log_dir: dir.path().to_path_buf(),
            debug_enabled,
            ..LoggingConfig::default()
        })
    }

    async fn entries(logger: &Logger, channel: Channel) -> Vec<LogEntry> {
        logger.file_sink().read_entries(channel).await.unwrap()
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(LogLevel::Emergency > LogLevel::Alert);
        assert!(LogLevel::Warning > LogLevel::Notice);
        assert!(LogLevel::Info > LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!("Security".parse::<Channel>().unwrap(), Channel::Security);
    }

    #[tokio::test]
    async fn test_debug_entries_need_debug_mode() {
        let dir = TempDir::new().unwrap();

        let quiet = logger(&dir, false);
        quiet.debug(Channel::System, "hidden", json!({})).await;
        quiet.info(Channel::System, "shown", json!({})).await;
        let written = entries(&quiet, Channel::System).await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].message, "shown");

        let verbose = logger(&dir, true);
        verbose.debug(Channel::System, "now visible", json!({})).await;
        assert_eq!(entries(&verbose, Channel::System).await.len(), 2);
    }

    #[tokio::test]
    async fn test_sql_query_and_performance_thresholds() {
        let dir = TempDir::new().unwrap();
        let logger = logger(&dir, true);

        logger.sql_query("SELECT 1", json!([]), 0.05).await;
        logger.sql_query("SELECT pg_sleep(1)", json!([]), 0.25).await;
        let db = entries(&logger, Channel::Database).await;
        assert_eq!(db[0].level, LogLevel::Debug);
        assert_eq!(db[1].level, LogLevel::Warning);
        assert_eq!(db[1].context["query"], "SELECT pg_sleep(1)");

        logger
            .performance("report", Duration::from_millis(1500), json!({"rows": 10}))
            .await;
        logger
            .performance("report", Duration::from_millis(20), json!({}))
            .await;
        let perf = entries(&logger, Channel::Performance).await;
        assert_eq!(perf[0].level, LogLevel::Warning);
        assert_eq!(perf[0].message, "Performance: report");
        assert_eq!(perf[0].context["rows"], 10);
        assert_eq!(perf[1].level, LogLevel::Info);
    }

    #[tokio::test]
    async fn test_exception_records_source_chain() {
        let dir = TempDir::new().unwrap();
        let logger = logger(&dir, false);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = anyhow::Error::new(io).context("saving report");
        logger
            .exception(&*err, json!({"report_id": 3}))
            .await;

        let written = entries(&logger, Channel::Error).await;
        assert_eq!(written[0].level, LogLevel::Error);
        assert_eq!(written[0].context["message"], "saving report");
        assert_eq!(written[0].context["sources"][0], "disk full");
        assert_eq!(written[0].context["report_id"], 3);
    }

    #[tokio::test]
    async fn test_entries_are_redacted_and_carry_extras() {
        let dir = TempDir::new().unwrap();
        let logger = logger(&dir, false);

        let extras = RequestExtras {
            ip: Some("198.51.100.7".to_string()),
            request_uri: Some("/login".to_string()),
            request_method: Some("POST".to_string()),
            ..RequestExtras::default()
        }
        .with_user(4);

        logger
            .security_event(
                "login_failed",
                json!({"username": "ana", "password": "hunter22"}),
                &extras,
            )
            .await;

        let written = entries(&logger, Channel::Security).await;
        assert_eq!(written[0].context["password"], REDACTED);
        assert_eq!(written[0].ip(), Some("198.51.100.7"));
        assert_eq!(written[0].extra.user_id, Some(4));

        let raw = tokio::fs::read_to_string(logger.file_sink().active_path(Channel::Security))
            .await
            .unwrap();
        assert!(!raw.contains("hunter22"));
    }

    #[tokio::test]
    async fn test_disabled_logger_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let logger = Logger::new(LoggingConfig {
            enabled: false,
            log_dir: dir.path().to_path_buf(),
            ..LoggingConfig::default()
        });

        logger.emergency(Channel::System, "ignored", json!({})).await;
        assert!(entries(&logger, Channel::System).await.is_empty());
    }
}

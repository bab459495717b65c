//! Read-side of the log files: statistics, anomaly hints, export and cleanup.

use crate::logging::{Channel, LogEntry, LogLevel};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tracing::{debug, info, warn};

const TOP_N: usize = 10;
const ERROR_SPIKE_PER_HOUR: usize = 10;
const AUTH_FAILURES_PER_IP: usize = 5;
const HEAVY_IP_REQUESTS: usize = 1000;
const BUSY_IP_REQUESTS: usize = 100;
const BUSY_IP_USERS: usize = 10;
const SLOW_QUERY_ANOMALY_SECONDS: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountedKey {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStatistics {
    pub period_days: i64,
    pub total_logs: usize,
    pub levels: Vec<CountedKey>,
    pub channels: Vec<CountedKey>,
    /// Entries per hour of day (UTC), index 0..24
    pub hourly_activity: Vec<usize>,
    pub top_ips: Vec<CountedKey>,
    pub top_errors: Vec<CountedKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuspiciousIp {
    pub ip: String,
    pub request_count: usize,
    pub unique_users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlowQuery {
    pub query: String,
    pub max_execution_time: f64,
    pub occurrences: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Anomalies {
    pub error_spikes: Vec<CountedKey>,
    pub suspicious_ips: Vec<SuspiciousIp>,
    pub auth_failures: Vec<CountedKey>,
    pub slow_queries: Vec<SlowQuery>,
}

impl Anomalies {
    pub fn is_empty(&self) -> bool {
        self.error_spikes.is_empty()
            && self.suspicious_ips.is_empty()
            && self.auth_failures.is_empty()
            && self.slow_queries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Txt,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Txt => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" => Ok(ExportFormat::Txt),
            other => Err(format!("Unsupported export format: {other}")),
        }
    }
}

/// Analyzer over a log directory
pub struct LogAnalyzer {
    dir: PathBuf,
}

impl LogAnalyzer {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Entries at or after `since`, oldest first, optionally for one channel
    pub async fn load_entries(
        &self,
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        channel: Option<Channel>,
    ) -> io::Result<Vec<LogEntry>> {
        let dir = self.dir.clone();
        let mut entries = tokio::task::spawn_blocking(move || read_dir_entries(&dir, channel))
            .await
            .map_err(io::Error::other)??;

        entries.retain(|e| e.timestamp >= since && until.map_or(true, |u| e.timestamp <= u));
        entries.sort_by_key(|e| e.timestamp);
        debug!("Loaded {} log entries from {}", entries.len(), self.dir.display());
        Ok(entries)
    }

    pub fn statistics(entries: &[LogEntry], period_days: i64) -> LogStatistics {
        let mut hourly_activity = vec![0; 24];
        for entry in entries {
            hourly_activity[entry.timestamp.hour() as usize] += 1;
        }

        let errors = entries.iter().filter(|e| is_error_level(e.level));

        LogStatistics {
            period_days,
            total_logs: entries.len(),
            levels: count_by(entries.iter(), |e| Some(e.level.as_str().to_uppercase()), usize::MAX),
            channels: count_by(entries.iter(), |e| Some(e.channel.to_string()), usize::MAX),
            hourly_activity,
            top_ips: count_by(entries.iter(), |e| e.ip().map(str::to_string), TOP_N),
            top_errors: count_by(errors, |e| Some(e.message.clone()), TOP_N),
        }
    }

    pub fn detect_anomalies(entries: &[LogEntry]) -> Anomalies {
        let errors = entries.iter().filter(|e| is_error_level(e.level));
        let error_spikes = count_by(
            errors,
            |e| Some(e.timestamp.format("%Y-%m-%d %H:00:00").to_string()),
            usize::MAX,
        )
        .into_iter()
        .filter(|c| c.count > ERROR_SPIKE_PER_HOUR)
        .collect();

        let auth_failures = count_by(
            entries.iter().filter(|e| {
                matches!(e.channel, Channel::Auth | Channel::Security)
                    && e.level == LogLevel::Warning
                    && e.message.contains("failed")
            }),
            |e| e.ip().map(str::to_string),
            usize::MAX,
        )
        .into_iter()
        .filter(|c| c.count > AUTH_FAILURES_PER_IP)
        .collect();

        let mut per_ip: HashMap<&str, (usize, HashSet<i64>)> = HashMap::new();
        for entry in entries {
            if let Some(ip) = entry.ip() {
                let slot = per_ip.entry(ip).or_default();
                slot.0 += 1;
                if let Some(user_id) = entry.extra.user_id {
                    slot.1.insert(user_id);
                }
            }
        }
        let mut suspicious_ips: Vec<SuspiciousIp> = per_ip
            .into_iter()
            .filter(|(_, (requests, users))| {
                *requests > HEAVY_IP_REQUESTS
                    || (*requests > BUSY_IP_REQUESTS && users.len() > BUSY_IP_USERS)
            })
            .map(|(ip, (request_count, users))| SuspiciousIp {
                ip: ip.to_string(),
                request_count,
                unique_users: users.len(),
            })
            .collect();
        suspicious_ips.sort_by(|a, b| b.request_count.cmp(&a.request_count));

        let mut slow: HashMap<String, SlowQuery> = HashMap::new();
        for entry in entries.iter().filter(|e| e.channel == Channel::Database) {
            let Some(time) = entry.context["execution_time"].as_f64() else {
                continue;
            };
            if time <= SLOW_QUERY_ANOMALY_SECONDS {
                continue;
            }
            let query = entry.context["query"]
                .as_str()
                .unwrap_or(&entry.message)
                .to_string();
            let slot = slow.entry(query.clone()).or_insert(SlowQuery {
                query,
                max_execution_time: 0.0,
                occurrences: 0,
            });
            slot.occurrences += 1;
            slot.max_execution_time = slot.max_execution_time.max(time);
        }
        let mut slow_queries: Vec<SlowQuery> = slow.into_values().collect();
        slow_queries.sort_by(|a, b| b.max_execution_time.total_cmp(&a.max_execution_time));
        slow_queries.truncate(TOP_N);

        Anomalies {
            error_spikes,
            suspicious_ips,
            auth_failures,
            slow_queries,
        }
    }

    /// Render `entries` in the export format
    pub fn render(entries: &[LogEntry], format: ExportFormat) -> io::Result<String> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(entries)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "timestamp,level,channel,message,context,ip,user_agent,request_uri,request_method,user_id\n",
                );
                for e in entries {
                    let fields = [
                        e.timestamp.to_rfc3339(),
                        e.level.as_str().to_uppercase(),
                        e.channel.to_string(),
                        e.message.clone(),
                        e.context.to_string(),
                        e.extra.ip.clone(),
                        e.extra.user_agent.clone(),
                        e.extra.request_uri.clone(),
                        e.extra.request_method.clone(),
                        e.extra.user_id.map(|id| id.to_string()).unwrap_or_default(),
                    ];
                    let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
                    out.push_str(&row.join(","));
                    out.push('\n');
                }
                Ok(out)
            }
            ExportFormat::Txt => {
                let mut out = String::new();
                for e in entries {
                    let _ = writeln!(
                        out,
                        "[{}] {}.{}: {}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        e.level.as_str().to_uppercase(),
                        e.channel,
                        e.message
                    );
                    if e.context.as_object().is_some_and(|c| !c.is_empty()) {
                        let _ = writeln!(out, "Context: {}", e.context);
                    }
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    /// Write an export under `{log_dir}/exports` and return its path
    pub async fn export(
        &self,
        entries: &[LogEntry],
        format: ExportFormat,
        label: &str,
    ) -> io::Result<PathBuf> {
        let content = Self::render(entries, format)?;
        let dir = self.dir.join("exports");
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("logs_export_{label}.{}", format.extension()));
        tokio::fs::write(&path, content).await?;
        info!("Exported {} log entries to {}", entries.len(), path.display());
        Ok(path)
    }

    /// Delete log files last modified more than `days` ago
    pub async fn cleanup(&self, days: i64) -> io::Result<usize> {
        let cutoff: SystemTime = (Utc::now() - Duration::days(days)).into();
        let mut removed = 0;

        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let is_log = name.to_str().is_some_and(|n| n.contains(".log"));
            let metadata = item.metadata().await?;
            if is_log && metadata.is_file() && metadata.modified()? < cutoff {
                tokio::fs::remove_file(item.path()).await?;
                removed += 1;
            }
        }

        info!("Removed {} log files older than {} days", removed, days);
        Ok(removed)
    }
}

fn is_error_level(level: LogLevel) -> bool {
    matches!(
        level,
        LogLevel::Error | LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency
    )
}

fn count_by<'a, I, F>(entries: I, key: F, limit: usize) -> Vec<CountedKey>
where
    I: Iterator<Item = &'a LogEntry>,
    F: Fn(&LogEntry) -> Option<String>,
{
    let mut counts: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        if let Some(k) = key(entry) {
            *counts.entry(k).or_default() += 1;
        }
    }

    let mut counted: Vec<CountedKey> = counts
        .into_iter()
        .map(|(key, count)| CountedKey { key, count })
        .collect();
    counted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    counted.truncate(limit);
    counted
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn read_dir_entries(dir: &Path, channel: Option<Channel>) -> io::Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let listing = match std::fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e),
    };

    for item in listing {
        let path = item?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(channel) = channel {
            if !name.starts_with(&format!("{channel}-")) {
                continue;
            }
        }

        let file = std::fs::File::open(&path)?;
        let reader: Box<dyn BufRead> = if name.ends_with(".log.zst") {
            Box::new(BufReader::new(zstd::stream::read::Decoder::new(file)?))
        } else if name.ends_with(".log") {
            Box::new(BufReader::new(file))
        } else {
            continue;
        };

        // Unparseable lines (including invalid UTF-8) are skipped
        for line in reader.split(b'\n') {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Stopped reading {} early: {}", path.display(), e);
                    break;
                }
            };
            if let Ok(entry) = serde_json::from_slice::<LogEntry>(&line) {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

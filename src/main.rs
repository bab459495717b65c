use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use school_guard::logging::{
    AuditFilter, AuditStore, AuditTrail, DbSink, ExportFormat, PgAuditStore,
};
use school_guard::security::{
    hash_password, CounterStore, IdentityStore, MemoryIdentityStore, PgCounterStore,
    PgIdentityStore, SessionGuard,
};
use school_guard::{
    create_router, system_clock, AppState, Backends, Channel, Config, LogAnalyzer, Logger,
    SharedClock,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often idle rate windows and login records are swept
const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(3600);
/// Counters untouched for this long are dropped; longer than every window and lockout
const COUNTER_MAX_AGE_SECONDS: i64 = 86_400;
/// How often idle sessions are swept
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser)]
#[command(name = "school-guard")]
#[command(about = "Request security pipeline and log tooling for the school administration app")]
#[command(version)]
struct Cli {
    /// Emit JSON log lines instead of human-readable output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Override HTTP_PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect and maintain the log directory
    Logs {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Query and prune the entity audit trail (needs DATABASE_URL)
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Print an Argon2id hash for a password
    HashPassword {
        #[arg(env = "SCHOOL_GUARD_PASSWORD")]
        password: String,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Summary of the last days of entries
    Stats {
        #[arg(long, default_value = "7")]
        days: i64,
    },
    /// Anomaly hints over the last days of entries
    Anomalies {
        #[arg(long, default_value = "1")]
        days: i64,
    },
    /// Write entries to {log_dir}/exports
    Export {
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long, default_value = "7")]
        days: i64,
        /// Only this channel
        #[arg(long)]
        channel: Option<String>,
    },
    /// Delete log files older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Matching records, newest first, with the total count
    List {
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        table: Option<String>,
        /// Only records from the last N days
        #[arg(long)]
        days: Option<i64>,
        #[arg(long, default_value = "50")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Delete records older than the given number of days
    Cleanup {
        #[arg(long, default_value = "90")]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    // RUST_LOG wins over LOG_LEVEL
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .and_then(|level| tracing_subscriber::EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| "info".into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = Config::from_env()?;

    match cli.command {
        Some(Commands::HashPassword { password }) => {
            println!("{}", hash_password(&password)?);
            Ok(())
        }
        Some(Commands::Logs { command }) => handle_log_command(command, &config).await,
        Some(Commands::Audit { command }) => handle_audit_command(command, &config).await,
        Some(Commands::Serve { port }) => serve(config, port).await,
        None => serve(config, None).await,
    }
}

async fn serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.http_port = port;
    }
    config.validate()?;

    let clock = system_clock();
    let mut logger = Logger::new(config.logging.clone());

    let backends = match &config.database_url {
        Some(url) => {
            info!(
                "Connecting to {}",
                config.safe_database_url().unwrap_or_default()
            );
            let pool = connect(url).await?;

            let counters = PgCounterStore::new(pool.clone());
            counters.initialize().await?;

            let audit = PgAuditStore::new(pool.clone());
            audit.initialize().await?;

            let db_sink = DbSink::new(pool.clone());
            if config.logging.to_database {
                db_sink.initialize().await?;
            }
            logger = logger.with_database(db_sink);

            let counters: Arc<dyn CounterStore> = Arc::new(counters);
            let identities: Arc<dyn IdentityStore> = Arc::new(PgIdentityStore::new(pool));
            let audit: Arc<dyn AuditStore> = Arc::new(audit);
            Backends {
                counters,
                audit,
                ..Backends::in_memory(identities)
            }
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores with no accounts");
            Backends::in_memory(Arc::new(MemoryIdentityStore::new()))
        }
    };

    let logger = Arc::new(logger);
    tokio::spawn(purge_counters(backends.counters.clone(), clock.clone()));

    let state = AppState::new(
        config.security.clone(),
        backends,
        logger.clone(),
        clock,
        config.installed,
    )?;

    // Sessions outlive neither their login timeout nor their CSRF token
    let session_idle = config
        .security
        .session
        .timeout_seconds
        .max(config.security.csrf.token_ttl_seconds);
    tokio::spawn(purge_sessions(state.sessions.clone(), session_idle));

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("school-guard listening on {}", addr);
    logger
        .info(
            Channel::System,
            "server_started",
            serde_json::json!({ "port": config.http_port, "environment": config.environment }),
        )
        .await;

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn purge_counters(counters: Arc<dyn CounterStore>, clock: SharedClock) {
    let mut interval = tokio::time::interval(COUNTER_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        match counters.purge(clock.now(), COUNTER_MAX_AGE_SECONDS).await {
            Ok(0) => {}
            Ok(removed) => debug!("Purged {} idle counters", removed),
            Err(e) => warn!("Counter purge failed: {}", e),
        }
    }
}

async fn purge_sessions(sessions: Arc<SessionGuard>, idle_seconds: i64) {
    let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = sessions.purge_idle(idle_seconds).await {
            warn!("Session purge failed: {}", e);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn connect(url: &str) -> Result<Arc<sqlx::PgPool>> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("Failed to connect to the database")?;
    Ok(Arc::new(pool))
}

async fn handle_audit_command(command: AuditCommands, config: &Config) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the audit trail")?;
    let store = PgAuditStore::new(connect(url).await?);
    store.initialize().await?;
    let trail = AuditTrail::new(Arc::new(store), system_clock());

    match command {
        AuditCommands::List {
            user_id,
            action,
            table,
            days,
            limit,
            offset,
        } => {
            let filter = AuditFilter {
                user_id,
                action,
                table_name: table,
                date_from: days.map(|d| Utc::now() - ChronoDuration::days(d)),
                date_to: None,
            };
            let records = trail.query(&filter, limit, offset).await?;
            let total = trail.count(&filter).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "total": total,
                    "records": records,
                }))?
            );
        }
        AuditCommands::Cleanup { days } => {
            let removed = trail.cleanup(days).await?;
            println!("Removed {removed} audit records");
        }
    }

    Ok(())
}

async fn handle_log_command(command: LogCommands, config: &Config) -> Result<()> {
    let analyzer = LogAnalyzer::new(&config.logging.log_dir);

    match command {
        LogCommands::Stats { days } => {
            let entries = analyzer
                .load_entries(Utc::now() - ChronoDuration::days(days), None, None)
                .await?;
            let stats = LogAnalyzer::statistics(&entries, days);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        LogCommands::Anomalies { days } => {
            let entries = analyzer
                .load_entries(Utc::now() - ChronoDuration::days(days), None, None)
                .await?;
            let anomalies = LogAnalyzer::detect_anomalies(&entries);
            if anomalies.is_empty() {
                println!("No anomalies detected");
            } else {
                println!("{}", serde_json::to_string_pretty(&anomalies)?);
            }
        }
        LogCommands::Export {
            format,
            days,
            channel,
        } => {
            let format: ExportFormat = format.parse().map_err(anyhow::Error::msg)?;
            let channel = channel
                .map(|c| c.parse::<Channel>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let entries = analyzer
                .load_entries(Utc::now() - ChronoDuration::days(days), None, channel)
                .await?;
            let label = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let path = analyzer.export(&entries, format, &label).await?;
            println!("{}", path.display());
        }
        LogCommands::Cleanup { days } => {
            let removed = analyzer.cleanup(days).await?;
            println!("Removed {removed} log files");
        }
    }

    Ok(())
}

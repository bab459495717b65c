use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::logging::LoggingConfig;
use crate::security::{RatePolicy, SecurityConfig, PLACEHOLDER_JWT_SECRET};

/// Shortest accepted signing secret, in bytes
pub const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `production`, `development`, ...
    pub environment: String,

    /// APP_DEBUG flag
    pub debug: bool,

    /// Public base URL, also the token issuer
    pub app_url: String,

    /// HTTP server port
    pub http_port: u16,

    /// PostgreSQL connection URL; in-memory stores are used without it
    pub database_url: Option<String>,

    /// Whether the installer has completed
    pub installed: bool,

    /// Request security settings
    pub security: SecurityConfig,

    /// Audit/security log settings
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            debug: false,
            app_url: "http://localhost".to_string(),
            http_port: 8080,
            database_url: None,
            installed: true,
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(environment) = lookup("APP_ENV") {
            config.environment = environment.to_lowercase();
        }
        if let Some(debug) = lookup("APP_DEBUG") {
            config.debug = parse_flag("APP_DEBUG", &debug)?;
        }
        if let Some(app_url) = lookup("APP_URL") {
            config.app_url = app_url;
        }
        if let Some(port) = lookup("HTTP_PORT") {
            config.http_port = parse("HTTP_PORT", &port)?;
        }
        config.database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());
        if let Some(installed) = lookup("APP_INSTALLED") {
            config.installed = parse_flag("APP_INSTALLED", &installed)?;
        }

        let production = config.is_production();

        // Security
        let security = &mut config.security;
        if let Some(secret) = lookup("JWT_SECRET") {
            security.auth.jwt_secret = secret;
        }
        security.auth.issuer = config.app_url.clone();
        security.session.secure_cookie = production;
        security.headers.hsts = production;

        if let Some(timeout) = lookup("SESSION_TIMEOUT_SECONDS") {
            security.session.timeout_seconds = parse("SESSION_TIMEOUT_SECONDS", &timeout)?;
        }
        if let Some(rotation) = lookup("SESSION_ROTATION_SECONDS") {
            security.session.rotation_interval_seconds =
                parse("SESSION_ROTATION_SECONDS", &rotation)?;
        }
        if let Some(ttl) = lookup("CSRF_TTL_SECONDS") {
            security.csrf.token_ttl_seconds = parse("CSRF_TTL_SECONDS", &ttl)?;
        }
        if let Some(list) = lookup("IP_WHITELIST") {
            security.ip.whitelist = split_list(&list);
        }
        if let Some(list) = lookup("IP_BLACKLIST") {
            security.ip.blacklist = split_list(&list);
        }
        if let Some(enabled) = lookup("RATE_LIMIT_ENABLED") {
            security.rate_limiting.enabled = parse_flag("RATE_LIMIT_ENABLED", &enabled)?;
        }

        let rates = &mut security.rate_limiting;
        for (key, policy) in [
            ("RATE_LIMIT_GENERAL", &mut rates.general),
            ("RATE_LIMIT_LOGIN", &mut rates.login),
            ("RATE_LIMIT_API", &mut rates.api),
        ] {
            if let Some(raw) = lookup(key) {
                *policy = RatePolicy::parse(&raw).ok_or_else(|| {
                    anyhow::anyhow!("Invalid {}: expected max/window, got '{}'", key, raw)
                })?;
            }
        }

        // Logging
        let logging = &mut config.logging;
        logging.environment = config.environment.clone();
        logging.debug_enabled = config.environment == "development" || config.debug;
        logging.server = url::Url::parse(&config.app_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        if let Some(enabled) = lookup("LOG_ENABLED") {
            logging.enabled = parse_flag("LOG_ENABLED", &enabled)?;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            logging.log_dir = PathBuf::from(dir);
        }
        if let Some(size) = lookup("LOG_MAX_FILE_SIZE") {
            logging.max_file_size = parse("LOG_MAX_FILE_SIZE", &size)?;
        }
        if let Some(files) = lookup("LOG_MAX_FILES") {
            logging.max_files = parse("LOG_MAX_FILES", &files)?;
        }
        if let Some(flag) = lookup("LOG_TO_DATABASE") {
            logging.to_database = parse_flag("LOG_TO_DATABASE", &flag)?;
        }
        if let Some(flag) = lookup("LOG_TO_EXTERNAL") {
            logging.to_external = parse_flag("LOG_TO_EXTERNAL", &flag)?;
        }
        logging.webhook_url = lookup("LOG_WEBHOOK_URL").filter(|url| !url.is_empty());

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Validate the configuration; startup must stop on any error
    pub fn validate(&self) -> Result<()> {
        let secret = &self.security.auth.jwt_secret;
        if secret.is_empty() {
            return Err(anyhow::anyhow!("JWT_SECRET is required"));
        }
        if secret == PLACEHOLDER_JWT_SECRET {
            return Err(anyhow::anyhow!(
                "JWT_SECRET still holds the sample placeholder value"
            ));
        }
        if secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least {} bytes",
                MIN_JWT_SECRET_BYTES
            ));
        }

        if self.logging.log_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("LOG_DIR must not be empty"));
        }
        if self.logging.to_external && self.logging.webhook_url.is_none() {
            return Err(anyhow::anyhow!(
                "LOG_TO_EXTERNAL is set but LOG_WEBHOOK_URL is missing"
            ));
        }
        if self.logging.to_database && self.database_url.is_none() {
            return Err(anyhow::anyhow!(
                "LOG_TO_DATABASE is set but DATABASE_URL is missing"
            ));
        }

        let rates = &self.security.rate_limiting;
        for (name, policy) in [
            ("general", rates.general),
            ("login", rates.login),
            ("api", rates.api),
        ] {
            if policy.max_requests == 0 || policy.window_seconds <= 0 {
                return Err(anyhow::anyhow!(
                    "Rate limit '{}' needs a positive ceiling and window",
                    name
                ));
            }
        }

        if self.security.session.timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("Session timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Generate a safe connection string for logging (masks password)
    pub fn safe_database_url(&self) -> Option<String> {
        let raw = self.database_url.as_ref()?;
        match url::Url::parse(raw) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                Some(url.to_string())
            }
            Err(_) => Some("postgresql://[credentials-hidden]".to_string()),
        }
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("Invalid {}: '{}' is not a boolean", key, other)),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

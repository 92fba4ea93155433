// src/config.rs - Configuration management (defaults → TOML → environment)
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub keep_alive: u64,
    pub client_timeout: u64,
    pub client_shutdown: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: u64,
    pub idle_timeout: u64,
    pub busy_timeout_ms: u64,
}

/// Параметры леджера ёмкости
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    /// Max wait for a node/stock lock before `LockTimeout`.
    pub lock_timeout_ms: u64,
    /// 0 disables the periodic invariant check.
    pub verify_interval_seconds: u64,
    /// 0 keeps idempotency records forever.
    pub operation_retention_days: i64,
    pub fail_on_drift: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub max_request_size: usize,
    pub require_https: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "full" или "compact"
    pub format: String,
    pub with_target: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: None,
            keep_alive: 30,
            client_timeout: 30,
            client_shutdown: 5,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:warehouse.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: 30,
            idle_timeout: 600,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 2000,
            verify_interval_seconds: 300,
            operation_retention_days: 30,
            fail_on_drift: false,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
            max_request_size: 256 * 1024,
            require_https: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
            with_target: true,
        }
    }
}

pub fn load_config() -> Result<Config> {
    load_env_file()?;

    let mut config = match env::var("CONFIG_FILE") {
        Ok(config_file) => load_config_file(Path::new(&config_file))?,
        Err(_) => Config::default(),
    };

    override_with_env(&mut config)?;

    config.validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

/// Reads a TOML file; missing sections and keys fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn override_with_env(config: &mut Config) -> Result<()> {
    apply_overrides(config, |key| env::var(key).ok())
}

/// Applies `KEY=value` overrides from `lookup`. Unparsable numbers are errors
/// rather than silently ignored.
pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
        raw.trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", key, raw))
    }

    if let Some(host) = lookup("BIND_ADDRESS") {
        config.server.host = host;
    }
    if let Some(port) = lookup("WAREHOUSE_PORT") {
        config.server.port = parse("WAREHOUSE_PORT", &port)?;
    }
    if let Some(workers) = lookup("WAREHOUSE_WORKERS") {
        config.server.workers = Some(parse("WAREHOUSE_WORKERS", &workers)?);
    }
    if let Some(url) = lookup("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(max_conn) = lookup("DATABASE_MAX_CONNECTIONS") {
        config.database.max_connections = parse("DATABASE_MAX_CONNECTIONS", &max_conn)?;
    }
    if let Some(min_conn) = lookup("DATABASE_MIN_CONNECTIONS") {
        config.database.min_connections = parse("DATABASE_MIN_CONNECTIONS", &min_conn)?;
    }
    if let Some(timeout) = lookup("LEDGER_LOCK_TIMEOUT_MS") {
        config.ledger.lock_timeout_ms = parse("LEDGER_LOCK_TIMEOUT_MS", &timeout)?;
    }
    if let Some(interval) = lookup("LEDGER_VERIFY_INTERVAL_SECONDS") {
        config.ledger.verify_interval_seconds = parse("LEDGER_VERIFY_INTERVAL_SECONDS", &interval)?;
    }
    if let Some(days) = lookup("LEDGER_OPERATION_RETENTION_DAYS") {
        config.ledger.operation_retention_days = parse("LEDGER_OPERATION_RETENTION_DAYS", &days)?;
    }
    if let Some(origins) = lookup("ALLOWED_ORIGINS") {
        config.security.allowed_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(level) = lookup("RUST_LOG") {
        config.logging.level = level;
    }

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections < self.database.min_connections {
            return Err(anyhow::anyhow!(
                "max_connections ({}) must be >= min_connections ({})",
                self.database.max_connections,
                self.database.min_connections
            ));
        }

        if self.ledger.lock_timeout_ms == 0 {
            return Err(anyhow::anyhow!("ledger.lock_timeout_ms must be positive"));
        }

        if self.ledger.operation_retention_days < 0 {
            return Err(anyhow::anyhow!(
                "ledger.operation_retention_days cannot be negative ({})",
                self.ledger.operation_retention_days
            ));
        }

        if !matches!(self.logging.format.as_str(), "full" | "compact") {
            return Err(anyhow::anyhow!(
                "logging.format must be 'full' or 'compact' (got '{}')",
                self.logging.format
            ));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        env::var("WAREHOUSE_ENV").map(|v| v == "production").unwrap_or(false)
    }

    pub fn print_startup_info(&self) {
        log::info!("📦 Warehouse ledger starting up...");
        log::info!("🌐 Server: {}:{}", self.server.host, self.server.port);
        log::info!("💾 Database: {}",
            if self.database.url.starts_with("sqlite") { "SQLite" } else { "Unknown" });
        log::info!(
            "⚖️ Ledger: lock timeout {}ms, verify every {}s, keep operation ids {} days",
            self.ledger.lock_timeout_ms,
            self.ledger.verify_interval_seconds,
            self.ledger.operation_retention_days
        );
        log::info!("📊 Logging: {} level", self.logging.level);

        if !self.is_production() {
            log::warn!("🚧 Running in development mode");
        }

        if self.security.require_https {
            log::info!("🔒 HTTPS enforcement enabled");
        } else if self.is_production() {
            log::warn!("⚠️  HTTPS not required in production mode");
        }
    }
}

pub fn load_env_file() -> Result<()> {
    if let Ok(env_file) = env::var("ENV_FILE") {
        dotenvy::from_filename(&env_file)
            .with_context(|| format!("Failed to load environment file: {}", env_file))?;
    } else if Path::new(".env").exists() {
        dotenvy::dotenv().context("Failed to load .env file")?;
    }
    Ok(())
}

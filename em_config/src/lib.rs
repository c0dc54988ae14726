//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles server, database and pool settings from env vars and files

use config::{Config as ConfigBuilder, Environment, File};
use em_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Deployment environment ("development", "production", ...)
    #[validate(length(min = 1))]
    pub environment: String,
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Monitoring server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Database target and pool sizing
#[derive(Clone, Deserialize, Serialize, Validate)]
#[validate(schema(function = "validate_pool_bounds"))]
pub struct DatabaseConfig {
    /// Connection string; required before the pool can be initialized
    pub url: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub min_connections: u32,
    #[validate(range(min = 1, max = 100))]
    pub max_connections: u32,
    /// Idle connections above the minimum are closed after this many seconds
    #[validate(range(min = 1, max = 86400))]
    pub idle_timeout_secs: u64,
    #[validate(range(min = 1, max = 300))]
    pub acquire_timeout_secs: u64,
    pub keepalive: bool,
    #[validate(range(min = 1, max = 3600))]
    pub keepalive_delay_secs: u64,
    /// Optional PEM file with a custom CA for `sslmode=require`
    pub ssl_cert: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            min_connections: 5,
            max_connections: 20,
            idle_timeout_secs: 30,
            acquire_timeout_secs: 5,
            keepalive: true,
            keepalive_delay_secs: 10,
            ssl_cert: None,
        }
    }
}

impl DatabaseConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn keepalive_delay(&self) -> Duration {
        Duration::from_secs(self.keepalive_delay_secs)
    }

    /// Connection string with any password replaced, safe for logs
    pub fn redacted_url(&self) -> Option<String> {
        self.url.as_deref().map(redact_url)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.redacted_url())
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("keepalive", &self.keepalive)
            .field("keepalive_delay_secs", &self.keepalive_delay_secs)
            .field("ssl_cert", &self.ssl_cert)
            .finish()
    }
}

fn validate_pool_bounds(db: &DatabaseConfig) -> std::result::Result<(), ValidationError> {
    if db.min_connections > db.max_connections {
        return Err(ValidationError::new("min_connections_exceeds_max"));
    }
    Ok(())
}

/// Replace the password component of a connection string with `[REDACTED]`
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("[REDACTED]"));
            }
            parsed.to_string()
        }
        Err(_) => "[REDACTED]".to_string(),
    }
}

/// Env vars whose keys contain underscores and so can't go through the
/// `_`-separated environment source
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("ENMON_DATABASE_URL", "database.url"),
    ("ENMON_DATABASE_MIN_CONNECTIONS", "database.min_connections"),
    ("ENMON_DATABASE_MAX_CONNECTIONS", "database.max_connections"),
    ("ENMON_DATABASE_IDLE_TIMEOUT_SECS", "database.idle_timeout_secs"),
    ("ENMON_DATABASE_ACQUIRE_TIMEOUT_SECS", "database.acquire_timeout_secs"),
    ("ENMON_DATABASE_KEEPALIVE_DELAY_SECS", "database.keepalive_delay_secs"),
    ("ENMON_DATABASE_SSL_CERT", "database.ssl_cert"),
];

impl Config {
    /// Load configuration from defaults, an optional .env file and environment variables
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .set_default("environment", "development")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default("database.min_connections", 5)?
            .set_default("database.max_connections", 20)?
            .set_default("database.idle_timeout_secs", 30)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("database.keepalive", true)?
            .set_default("database.keepalive_delay_secs", 10)?;

        if std::path::Path::new(".env").exists() {
            builder = builder.add_source(File::with_name(".env").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("ENMON")
                .try_parsing(true)
                .separator("_"),
        );

        // Applied last so they win over the generic environment source
        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        Ok(parsed)
    }
}

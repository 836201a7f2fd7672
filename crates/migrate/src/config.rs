//! Configuration for the database connection and the migration engine
//!
//! Values come from environment variables (see [`DatabaseConfig::from_env`]
//! and [`MigrationConfig::from_env`]); the CLI layers its flags on top.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// PostgreSQL connection and pool settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; takes precedence over the discrete fields
    pub url: Option<String>,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    /// Connect without TLS. TLS is required otherwise.
    pub ssl_disabled: bool,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            user: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            database_name: "postgres".to_string(),
            ssl_disabled: false,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Duration::from_secs(60),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        if let Some(user) = lookup("DB_USER") {
            config.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            config.password = password;
        }
        if let Some(host) = lookup("DB_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            config.port = parse_field("port", &port, "valid port number (1-65535)")?;
        }
        if let Some(name) = lookup("DB_NAME") {
            config.database_name = name;
        }
        if let Some(disabled) = lookup("DB_SSL_DISABLED") {
            config.ssl_disabled = parse_bool("ssl_disabled", &disabled)?;
        }
        if let Some(max) = lookup("DB_MAX_CONNECTIONS") {
            config.max_connections = parse_field("max_connections", &max, "positive integer")?;
        }
        if let Some(min) = lookup("DB_MIN_CONNECTIONS") {
            config.min_connections = parse_field("min_connections", &min, "non-negative integer")?;
        }
        if let Some(lifetime) = lookup("DB_MAX_LIFETIME") {
            let secs: u64 = parse_field("max_lifetime", &lifetime, "lifetime in seconds")?;
            config.max_lifetime = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_none() {
            if self.host.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "host".to_string(),
                    hint: "set DB_HOST or DATABASE_URL".to_string(),
                });
            }
            if self.database_name.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "database_name".to_string(),
                    hint: "set DB_NAME or DATABASE_URL".to_string(),
                });
            }
            if self.port == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "port".to_string(),
                    value: self.port.to_string(),
                    expected: "port between 1 and 65535".to_string(),
                });
            }
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections".to_string(),
                value: "0".to_string(),
                expected: "at least 1".to_string(),
            });
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue {
                field: "min_connections".to_string(),
                value: self.min_connections.to_string(),
                expected: format!("at most max_connections ({})", self.max_connections),
            });
        }

        Ok(())
    }

    /// Connection target without credentials, for log lines
    pub fn redacted_target(&self) -> String {
        match &self.url {
            Some(url) => match PgConnectOptions::from_str(url) {
                Ok(options) => format!(
                    "{}:{}/{}",
                    options.get_host(),
                    options.get_port(),
                    options.get_database().unwrap_or_default()
                ),
                Err(_) => "<invalid connection url>".to_string(),
            },
            None => format!("{}:{}/{}", self.host, self.port, self.database_name),
        }
    }
}

/// Settings for discovering and reconciling migrations
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory holding the numbered `.sql` files
    pub migrations_dir: PathBuf,
    /// Downgrade a hash mismatch on the current checkpoint from an error to a
    /// warning. Meant for manually repairing a development database only.
    pub allow_drift: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            allow_drift: false,
        }
    }
}

impl MigrationConfig {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_allow_drift(mut self, allow_drift: bool) -> Self {
        self.allow_drift = allow_drift;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("DBVER_MIGRATIONS_DIR") {
            if dir.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "migrations_dir".to_string(),
                    hint: "DBVER_MIGRATIONS_DIR must not be empty".to_string(),
                });
            }
            config.migrations_dir = PathBuf::from(dir);
        }
        if let Some(allow) = lookup("DBVER_ALLOW_DRIFT") {
            config.allow_drift = parse_bool("allow_drift", &allow)?;
        }

        Ok(config)
    }
}

fn parse_field<T: FromStr>(field: &str, value: &str, expected: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    })
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            expected: "true or false".to_string(),
        }),
    }
}

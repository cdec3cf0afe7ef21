//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub relay: RelayConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "relay.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the relay
    ///
    /// # Returns
    /// Full URL like "https://relay.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Relay admission policy
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Hold subscriber Follow requests as pending until approved
    #[serde(default)]
    pub manual_approval: bool,
    /// Domains refused at Follow time, merged with blocks kept in the store
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// RSA modulus size for a freshly generated relay key
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

fn default_key_bits() -> usize {
    2048
}

impl RelayConfig {
    /// Whether `domain` is on the static block list (case-insensitive).
    pub fn is_statically_blocked(&self, domain: &str) -> bool {
        self.blocked_domains
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(domain))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            manual_approval: false,
            blocked_domains: Vec::new(),
            key_bits: default_key_bits(),
        }
    }
}

/// Outbound delivery tuning
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum concurrent in-flight deliveries
    pub workers: usize,
    /// Bounded queue capacity, also the cap on jobs pending retry;
    /// submissions beyond it are dropped
    pub queue_capacity: usize,
    /// Attempt ceiling per job (first attempt included)
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled per attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff sleep
    pub max_backoff_secs: u64,
    /// Jobs older than this are abandoned instead of retried
    pub max_age_secs: u64,
    /// Per-request HTTP timeout
    pub request_timeout_secs: u64,
}

impl DeliveryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_capacity: 4096,
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_secs: 600,
            max_age_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIRELAY__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedirelay.db")?
            .set_default("relay.manual_approval", false)?
            .set_default("relay.key_bits", 2048)?
            .set_default("delivery.workers", 16)?
            .set_default("delivery.queue_capacity", 4096)?
            .set_default("delivery.max_attempts", 5)?
            .set_default("delivery.initial_backoff_ms", 1000)?
            .set_default("delivery.max_backoff_secs", 600)?
            .set_default("delivery.max_age_secs", 3600)?
            .set_default("delivery.request_timeout_secs", 30)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIRELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("relay.blocked_domains")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.delivery.workers == 0 {
            return Err(AppError::Config(
                "delivery.workers must be greater than 0".to_string(),
            ));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(AppError::Config(
                "delivery.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving relay over plain http; remote servers will refuse to federate"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}

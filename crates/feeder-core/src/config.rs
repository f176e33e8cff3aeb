//! Configuration system for SuperDuperFeeder.
//!
//! TOML file plus environment variable overrides; CLI flags win over both.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Hub protocol configuration
    pub hub: HubConfig,
    /// Polling engine configuration
    pub polling: PollingConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Queue/worker configuration
    pub queue: QueueConfig,
    /// Scheduler cadences
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (used to build callback paths)
    pub base_url: String,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            base_url: "http://localhost:8080".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Hub protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Advertised hub URL; derived from `server.base_url` when empty
    pub hub_url: String,
    /// Lease applied when a subscriber does not request one
    pub default_lease_seconds: u32,
    /// Upper bound on requested leases
    pub max_lease_seconds: u32,
    /// How long a pending verification token stays valid, in minutes
    pub verification_window_minutes: u32,
    /// Grace period before an expired subscription is swept, in hours
    pub expiration_grace_hours: u32,
    /// Window before expiry in which outbound subscriptions renew, in minutes
    pub renewal_window_minutes: u32,
    /// Timeout for verification and delivery requests, in milliseconds
    pub webhook_timeout_ms: u64,
    /// Retry budget for user-callback relays
    pub webhook_retries: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_url: String::new(),
            default_lease_seconds: 86_400,
            max_lease_seconds: 2_592_000,
            verification_window_minutes: 15,
            expiration_grace_hours: 24,
            renewal_window_minutes: 60,
            webhook_timeout_ms: 10_000,
            webhook_retries: 3,
        }
    }
}

impl HubConfig {
    /// The hub URL to advertise in `Link` headers, falling back to the base URL.
    pub fn hub_url_or(&self, base_url: &str) -> String {
        if self.hub_url.is_empty() {
            base_url.trim_end_matches('/').to_string()
        } else {
            self.hub_url.clone()
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
}

/// Polling engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval assigned to newly discovered feeds, in minutes
    pub default_interval_minutes: u32,
    /// Floor for per-feed polling intervals, in minutes
    pub min_interval_minutes: u32,
    /// Feed fetch timeout in seconds
    pub fetch_timeout_secs: u64,
    /// Maximum accepted feed body, in bytes
    pub max_body_bytes: usize,
    /// Upper bound of the uniform due-time jitter, in minutes
    pub jitter_minutes: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: 60,
            min_interval_minutes: 15,
            fetch_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            jitter_minutes: 5,
        }
    }
}

impl PollingConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Floor a per-feed interval at the configured minimum.
    pub fn clamp_interval(&self, minutes: u32) -> u32 {
        minutes.max(self.min_interval_minutes)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Storage backend type
    pub backend: StoreBackend,
    /// Database URL (postgres backend)
    pub url: String,
    /// Maximum connection pool size
    pub pool_max: u32,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: "postgres://localhost/superduperfeeder".to_string(),
            pool_max: 10,
            connect_timeout_secs: 10,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Queue/worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent dispatch workers
    pub workers: usize,
    /// Visibility timeout for reserved messages, in seconds
    pub visibility_timeout_secs: u64,
    /// Sleep when the queue is empty, in milliseconds
    pub sleep_on_empty_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_timeout_secs: 120,
            sleep_on_empty_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn sleep_on_empty(&self) -> Duration {
        Duration::from_millis(self.sleep_on_empty_ms)
    }
}

/// Scheduler cadences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Polling tick interval, in seconds
    pub poll_tick_secs: u64,
    /// Renewal + verification-cleanup tick interval, in seconds
    pub renewal_tick_secs: u64,
    /// Expired-subscription sweep interval, in seconds
    pub expiration_tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_tick_secs: 60,
            renewal_tick_secs: 600,
            expiration_tick_secs: 3600,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "superduperfeeder=info,feeder=info,tower_http=info,sqlx=warn".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.hub.default_lease_seconds, 86_400);
        assert_eq!(config.hub.max_lease_seconds, 2_592_000);
        assert_eq!(config.polling.default_interval_minutes, 60);
        assert_eq!(config.polling.min_interval_minutes, 15);
        assert_eq!(config.hub.webhook_timeout_ms, 10_000);
        assert_eq!(config.hub.webhook_retries, 3);
    }

    #[test]
    fn test_server_address() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_hub_url_fallback() {
        let hub = HubConfig::default();
        assert_eq!(hub.hub_url_or("https://hub.example/"), "https://hub.example");

        let hub = HubConfig {
            hub_url: "https://other.example/hub".into(),
            ..HubConfig::default()
        };
        assert_eq!(hub.hub_url_or("https://hub.example"), "https://other.example/hub");
    }

    #[test]
    fn test_interval_clamp() {
        let polling = PollingConfig::default();
        assert_eq!(polling.clamp_interval(5), 15);
        assert_eq!(polling.clamp_interval(15), 15);
        assert_eq!(polling.clamp_interval(90), 90);
    }

    #[test]
    fn test_partial_toml_round_trip() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [database]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.database.backend, StoreBackend::Memory);
        // Untouched sections keep their defaults
        assert_eq!(parsed.hub.default_lease_seconds, 86_400);
    }
}

use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the intake service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Transform service configuration
    pub transform: TransformConfig,
    /// Upload limits
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Stalled product detection
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploads until the transform pipeline finishes
    pub quarantine_bucket: String,
    /// Bucket holding promoted products
    pub permanent_bucket: String,
    /// Bucket holding metadata copies fetched from the transform service
    pub metadata_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Transform service endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    /// Base URL of the transform service
    pub base_url: String,
    /// Externally reachable base URL of this service; callbacks go to `{callback_base_url}/store/{id}`
    pub callback_base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Upload limits
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Largest accepted upload in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

/// Watchdog/poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds between passes
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
    /// Age after which an unfinished product is polled
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,
    /// Age after which an unfinished product without a terminal status fails
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Ledger page size per scan
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Products recovered concurrently within a page
    #[serde(default = "default_watchdog_concurrency")]
    pub concurrency: usize,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest buffered request body (callbacks); uploads are streamed
    #[serde(default = "default_max_buffered_body")]
    pub max_buffered_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "intake-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

fn default_stall_after_secs() -> u64 {
    300 // 5 minutes
}

fn default_deadline_secs() -> u64 {
    3600
}

fn default_batch_size() -> usize {
    100
}

fn default_watchdog_concurrency() -> usize {
    8
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_buffered_body() -> usize {
    1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "intake-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/intake").required(false))
            .add_source(config::File::with_name("/etc/intake/intake").required(false))
            // INTAKE__S3__QUARANTINE_BUCKET -> s3.quarantine_bucket
            .add_source(
                config::Environment::with_prefix("INTAKE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.watchdog.deadline_secs < self.watchdog.stall_after_secs {
            anyhow::bail!(
                "watchdog.deadline_secs ({}) must not be shorter than watchdog.stall_after_secs ({})",
                self.watchdog.deadline_secs,
                self.watchdog.stall_after_secs
            );
        }
        if self.ingest.max_file_size_bytes == 0 {
            anyhow::bail!("ingest.max_file_size_bytes must be positive");
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl TransformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stall_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_after_secs as i64)
    }

    pub fn deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deadline_secs as i64)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval_secs(),
            stall_after_secs: default_stall_after_secs(),
            deadline_secs: default_deadline_secs(),
            batch_size: default_batch_size(),
            concurrency: default_watchdog_concurrency(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_buffered_body_bytes: default_max_buffered_body(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_file_size(), 10 * 1024 * 1024 * 1024);
        assert_eq!(default_stall_after_secs(), 300);
        assert_eq!(default_deadline_secs(), 3600);
    }

    #[test]
    fn test_watchdog_durations() {
        let watchdog = WatchdogConfig::default();
        assert_eq!(watchdog.stall_after(), chrono::Duration::minutes(5));
        assert_eq!(watchdog.deadline(), chrono::Duration::hours(1));
        assert_eq!(watchdog.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "s3": {
                "quarantine_bucket": "quarantine",
                "permanent_bucket": "products",
                "metadata_bucket": "metadata"
            },
            "database": { "url": "postgres://localhost/intake" },
            "transform": {
                "base_url": "http://transform:8080",
                "callback_base_url": "http://intake:8080"
            }
        }))
        .unwrap();

        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.watchdog.batch_size, 100);
        assert!(config.validate().is_ok());
    }
}

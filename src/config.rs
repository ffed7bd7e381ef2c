//! Steep Configuration
//!
//! This module provides configuration structures for the steep-repl
//! node initialization daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on snapshot workers
pub const MAX_PARALLEL_WORKERS: usize = 16;

/// Main steep-repl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteepConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Local PostgreSQL connection (the node being provisioned)
    pub postgresql: PostgresConfig,

    /// Nodes that may serve as snapshot sources
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Snapshot generation/application tuning
    #[serde(default)]
    pub initialization: InitializationConfig,

    /// WAL catch-up tuning
    #[serde(default)]
    pub catchup: CatchupConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Human readable name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Data directory for state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// PostgreSQL connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl PostgresConfig {
    /// Connection URL for sqlx
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// libpq connection string (used for subscriptions)
    pub fn conninfo(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.database, self.user
        );
        if !self.password.is_empty() {
            s.push_str(&format!(" password={}", self.password));
        }
        s
    }
}

/// A peer node that can supply snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub postgresql: PostgresConfig,
}

/// Snapshot generation/application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializationConfig {
    /// Workers shared by streaming and loading (0 = auto-tune)
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,

    /// Target chunk size, e.g. "8MB"
    #[serde(default = "default_chunk_size")]
    pub chunk_size: String,

    /// Compress chunks in flight with LZ4
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Attempts per chunk before the table fails
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,

    /// Per-attempt chunk transfer timeout
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// Initial retry backoff (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Re-fetches allowed after a checksum mismatch
    #[serde(default = "default_checksum_retries")]
    pub checksum_retries: u32,

    /// What to do when target tables differ from the source after schema apply
    #[serde(default)]
    pub schema_sync: SchemaSyncMode,

    /// How long an orderly cancel may take before workers are aborted
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,

    /// Throughput ring size (samples)
    #[serde(default = "default_progress_window")]
    pub progress_window: usize,

    /// Throughput sampling interval
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

/// Handling of schema fingerprint differences between source and target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaSyncMode {
    /// Fail the session
    #[default]
    Strict,
    /// Reset the target and apply the source DDL again
    Auto,
    /// Log the differences and continue
    Manual,
}

/// WAL catch-up configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupConfig {
    /// Poll interval for replay position
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lag at or below which the node counts as synchronized
    #[serde(default = "default_max_lag_bytes")]
    pub max_lag_bytes: u64,

    /// Warn when lag keeps growing for this long
    #[serde(default = "default_lag_alert_secs")]
    pub lag_alert_secs: u64,

    /// Consecutive failed polls tolerated before giving up
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_pg_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_parallel_workers() -> usize {
    4
}

fn default_chunk_size() -> String {
    "8MB".to_string()
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_chunk_timeout() -> u64 {
    300
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_checksum_retries() -> u32 {
    3
}

fn default_cancel_grace() -> u64 {
    30
}

fn default_progress_window() -> usize {
    crate::throughput::DEFAULT_WINDOW
}

fn default_sample_interval_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_lag_bytes() -> u64 {
    1024 * 1024
}

fn default_lag_alert_secs() -> u64 {
    300
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/steep-repl")
}

impl Default for InitializationConfig {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            chunk_size: default_chunk_size(),
            compression: true,
            chunk_retries: default_chunk_retries(),
            chunk_timeout_secs: default_chunk_timeout(),
            retry_backoff_ms: default_retry_backoff_ms(),
            checksum_retries: default_checksum_retries(),
            schema_sync: SchemaSyncMode::default(),
            cancel_grace_secs: default_cancel_grace(),
            progress_window: default_progress_window(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl InitializationConfig {
    /// Chunk size in bytes
    pub fn chunk_bytes(&self) -> Result<u64> {
        parse_size(&self.chunk_size)
    }

    /// Configured worker count, auto-tuned from hardware when 0
    pub fn effective_workers(&self) -> usize {
        if self.parallel_workers == 0 {
            crate::tuning::auto_tune().parallel_workers
        } else {
            self.parallel_workers.min(MAX_PARALLEL_WORKERS)
        }
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_lag_bytes: default_max_lag_bytes(),
            lag_alert_secs: default_lag_alert_secs(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

impl CatchupConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lag_alert(&self) -> Duration {
        Duration::from_secs(self.lag_alert_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl SteepConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: SteepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            return Err(Error::Config("node.id cannot be empty".into()));
        }

        if self.postgresql.host.is_empty() {
            return Err(Error::Config("postgresql.host cannot be empty".into()));
        }

        if self.initialization.parallel_workers > MAX_PARALLEL_WORKERS {
            return Err(Error::Config(format!(
                "initialization.parallel_workers must be between 1 and {} (0 = auto)",
                MAX_PARALLEL_WORKERS
            )));
        }

        if self.initialization.chunk_bytes()? == 0 {
            return Err(Error::Config("initialization.chunk_size must be positive".into()));
        }

        if self.initialization.chunk_retries == 0 {
            return Err(Error::Config("initialization.chunk_retries must be at least 1".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node.id {
                return Err(Error::Config(format!("peer {} has the same id as this node", peer.id)));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(Error::Config(format!("duplicate peer id: {}", peer.id)));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(Error::Config(format!("unknown logging.format: {}", other)));
            }
        }

        Ok(())
    }

    /// Display name of the local node
    pub fn node_name(&self) -> &str {
        self.node.name.as_deref().unwrap_or(&self.node.id)
    }

    pub fn peer(&self, id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }
}

/// Parse a human size such as `512KB`, `8MB`, `1GB` or a plain byte count
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid size: {}", s)))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("size overflows: {}", s)))
}

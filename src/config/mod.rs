//! Configuration types, defaults, loading, and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Session manager configuration
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Bulk messaging engine configuration
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Durable job queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Auto-reply engine configuration
    #[serde(default)]
    pub auto_reply: AutoReplyConfig,

    /// Webhook delivery configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Inbound media storage configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// WhatsApp transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

/// WhatsApp transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Client transport to use. `"sim"` is the in-process simulator shipped
    /// in-tree; protocol adapters register their own kind.
    #[serde(default = "default_transport_kind")]
    pub kind: String,
}

fn default_transport_kind() -> String {
    "sim".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
        }
    }
}

/// HTTP gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address (default: "127.0.0.1")
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Gateway port (default: 18900)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Allowed CORS origins; empty means no cross-origin requests
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18900
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            allowed_origins: vec![],
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path (default: "~/.wamux/wamux.db")
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    wamux_home().join("wamux.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter directive (default: "info")
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Optional log file directory; when set, logs also go to a daily file
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            directory: None,
            json: false,
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum sessions per non-admin user (default: 5)
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,

    /// Seconds to wait for a connect to complete (default: 30)
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,

    /// Seconds to wait for a pairing code (default: 30)
    #[serde(default = "default_pairing_timeout_s")]
    pub pairing_timeout_s: u64,
}

fn default_max_sessions() -> usize {
    5
}

fn default_connect_timeout_s() -> u64 {
    30
}

fn default_pairing_timeout_s() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: default_max_sessions(),
            connect_timeout_s: default_connect_timeout_s(),
            pairing_timeout_s: default_pairing_timeout_s(),
        }
    }
}

/// Bulk messaging engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Hours to keep finished jobs before the cleanup sweep drops them (default: 24)
    #[serde(default = "default_bulk_retention_h")]
    pub retention_hours: u64,
}

fn default_bulk_retention_h() -> u64 {
    24
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_bulk_retention_h(),
        }
    }
}

/// Durable job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of workers (default: 5)
    #[serde(default = "default_queue_workers")]
    pub workers: usize,

    /// Poll interval in seconds (default: 5)
    #[serde(default = "default_queue_poll_s")]
    pub poll_interval_s: u64,

    /// Jobs fetched per poll per worker (default: 10)
    #[serde(default = "default_queue_batch")]
    pub batch_size: u32,

    /// Default maximum attempts per job (default: 3)
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,

    /// Days to keep terminal jobs before cleanup (default: 7)
    #[serde(default = "default_queue_retention_d")]
    pub retention_days: u64,
}

fn default_queue_workers() -> usize {
    5
}

fn default_queue_poll_s() -> u64 {
    5
}

fn default_queue_batch() -> u32 {
    10
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_retention_d() -> u64 {
    7
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_queue_workers(),
            poll_interval_s: default_queue_poll_s(),
            batch_size: default_queue_batch(),
            max_attempts: default_queue_max_attempts(),
            retention_days: default_queue_retention_d(),
        }
    }
}

/// Auto-reply engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyConfig {
    /// Default replies per contact per session per local day when a rule
    /// has no cap of its own (default: 5)
    #[serde(default = "default_daily_cap")]
    pub daily_cap: u32,
}

fn default_daily_cap() -> u32 {
    5
}

impl Default for AutoReplyConfig {
    fn default() -> Self {
        Self {
            daily_cap: default_daily_cap(),
        }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Delivery attempts per event (default: 3)
    #[serde(default = "default_webhook_attempts")]
    pub max_attempts: u32,

    /// Per-request timeout in seconds (default: 30)
    #[serde(default = "default_webhook_timeout_s")]
    pub timeout_s: u64,
}

fn default_webhook_attempts() -> u32 {
    3
}

fn default_webhook_timeout_s() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_webhook_attempts(),
            timeout_s: default_webhook_timeout_s(),
        }
    }
}

/// Inbound media storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directory for downloaded inbound media (default: "~/.wamux/media")
    #[serde(default = "default_media_dir")]
    pub directory: PathBuf,

    /// Minutes a temp media URL stays valid (default: 60)
    #[serde(default = "default_media_ttl_m")]
    pub url_ttl_minutes: u64,
}

fn default_media_dir() -> PathBuf {
    wamux_home().join("media")
}

fn default_media_ttl_m() -> u64 {
    60
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            directory: default_media_dir(),
            url_ttl_minutes: default_media_ttl_m(),
        }
    }
}

/// Home directory for runtime state: `~/.wamux/`
pub fn wamux_home() -> PathBuf {
    std::env::var_os("WAMUX_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".wamux")
        })
}

impl Config {
    /// Load configuration from a TOML file; missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.queue.workers > 0, "queue.workers must be at least 1");
        anyhow::ensure!(
            self.queue.batch_size > 0,
            "queue.batch_size must be at least 1"
        );
        anyhow::ensure!(
            self.sessions.max_sessions_per_user > 0,
            "sessions.max_sessions_per_user must be at least 1"
        );
        anyhow::ensure!(
            self.webhook.max_attempts > 0,
            "webhook.max_attempts must be at least 1"
        );
        Ok(())
    }
}

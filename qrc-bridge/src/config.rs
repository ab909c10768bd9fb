//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: QRC_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/qrc-bridge/{service_name}/config.toml
//! 4. System directory: /etc/qrc-bridge/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// QRC transport configuration
    pub transport: TransportConfig,

    /// Control-state cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Event cache configuration
    #[serde(default)]
    pub event_cache: EventCacheConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Change-group execution defaults
    #[serde(default)]
    pub change_group: ChangeGroupConfig,

    /// Raw-command passthrough policy
    #[serde(default)]
    pub raw_command: RawCommandConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// QRC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Core hostname or IP
    pub host: String,

    /// Core TCP port for the QRC WebSocket endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// ChangeGroup.Poll cadence in milliseconds
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Base delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Maximum reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// WebSocket open + Logon deadline in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Per-command response deadline in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Heartbeat ping cadence in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Reconnect automatically on unsolicited close
    #[serde(default = "default_true")]
    pub enable_auto_reconnect: bool,

    /// Run the ping/pong heartbeat
    #[serde(default = "default_true")]
    pub enable_heartbeat: bool,

    /// Accept self-signed Core certificates
    #[serde(default = "default_true")]
    pub insecure_tls: bool,

    /// Logon user
    #[serde(default)]
    pub username: String,

    /// Logon password
    #[serde(default)]
    pub password: String,
}

impl TransportConfig {
    /// Polling cadence as a `Duration`
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Reconnect base delay as a `Duration`
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Connection deadline as a `Duration`
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Command deadline as a `Duration`
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Heartbeat cadence as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The QRC endpoint URL for this Core
    pub fn endpoint_url(&self) -> String {
        format!("wss://{}:{}/qrc-public-api/v0", self.host, self.port)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            polling_interval_ms: default_polling_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            enable_auto_reconnect: true,
            enable_heartbeat: true,
            insecure_tls: true,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Control-state cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached control states
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Per-entry TTL in milliseconds; 0 disables expiry
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// TTL sweep cadence in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Track hit/miss/eviction counters
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Persist cache contents on shutdown and restore on startup
    #[serde(default = "default_false")]
    pub persistence_enabled: bool,

    /// Snapshot target path; required when persistence is enabled
    #[serde(default)]
    pub persistence_file: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_ms: default_cache_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            enable_metrics: true,
            persistence_enabled: false,
            persistence_file: None,
        }
    }
}

/// Event cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCacheConfig {
    /// Per-group ring capacity
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Maximum event age in milliseconds
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Global memory budget across all group buffers, in megabytes
    #[serde(default = "default_global_memory_limit_mb")]
    pub global_memory_limit_mb: u64,

    /// Memory checker cadence in milliseconds
    #[serde(default = "default_memory_check_interval_ms")]
    pub memory_check_interval_ms: u64,

    /// Per-control numeric thresholds for threshold_crossed classification
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<f64>>,

    /// Significance compression; disabled when absent
    #[serde(default)]
    pub compression: Option<CompressionConfig>,

    /// Disk spillover; disabled when absent
    #[serde(default)]
    pub spillover: Option<SpilloverConfig>,
}

impl EventCacheConfig {
    /// Memory budget in bytes
    pub fn global_memory_limit_bytes(&self) -> u64 {
        self.global_memory_limit_mb * 1024 * 1024
    }
}

impl Default for EventCacheConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_age_ms: default_max_age_ms(),
            global_memory_limit_mb: default_global_memory_limit_mb(),
            memory_check_interval_ms: default_memory_check_interval_ms(),
            thresholds: HashMap::new(),
            compression: None,
            spillover: None,
        }
    }
}

/// Significance-compression windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Events younger than this are always kept, in milliseconds
    #[serde(default = "default_recent_window_ms")]
    pub recent_window_ms: u64,

    /// Window in which only significant events are kept, in milliseconds
    #[serde(default = "default_medium_window_ms")]
    pub medium_window_ms: u64,

    /// Window in which only state transitions are kept, in milliseconds
    #[serde(default = "default_ancient_window_ms")]
    pub ancient_window_ms: u64,

    /// Percent change qualifying an event as significant
    #[serde(default = "default_significant_change_percent")]
    pub significant_change_percent: f64,

    /// Minimum spacing between kept events in the medium window, in milliseconds
    #[serde(default = "default_min_time_between_events_ms")]
    pub min_time_between_events_ms: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            recent_window_ms: default_recent_window_ms(),
            medium_window_ms: default_medium_window_ms(),
            ancient_window_ms: default_ancient_window_ms(),
            significant_change_percent: default_significant_change_percent(),
            min_time_between_events_ms: default_min_time_between_events_ms(),
        }
    }
}

/// Disk spillover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpilloverConfig {
    /// Directory spill files are written to
    pub directory: PathBuf,

    /// Maximum size of one spill file in megabytes
    #[serde(default = "default_spill_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Spill files older than this are removed by the janitor, in days
    #[serde(default = "default_spill_max_age_days")]
    pub max_age_days: u64,

    /// Total on-disk budget across all spill files in megabytes
    #[serde(default = "default_spill_total_size_cap_mb")]
    pub total_size_cap_mb: u64,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Successes required in half-open before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time the breaker stays open before probing, in milliseconds
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
}

impl BreakerConfig {
    /// Open-state hold time as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
        }
    }
}

/// Change-group execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeGroupConfig {
    /// Roll back successful writes when any write fails
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Keep dispatching after the first failure
    #[serde(default = "default_false")]
    pub continue_on_error: bool,

    /// Maximum writes in flight at once
    #[serde(default = "default_max_concurrent_changes")]
    pub max_concurrent_changes: usize,

    /// Per-write deadline in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,

    /// Validate the batch before dispatching anything
    #[serde(default = "default_true")]
    pub validate_before_execution: bool,
}

impl Default for ChangeGroupConfig {
    fn default() -> Self {
        Self {
            rollback_on_failure: true,
            continue_on_error: false,
            max_concurrent_changes: default_max_concurrent_changes(),
            timeout_ms: default_command_timeout_ms(),
            validate_before_execution: true,
        }
    }
}

/// Raw-command passthrough policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCommandConfig {
    /// QRC methods the raw path refuses to send
    #[serde(default = "default_deny_list")]
    pub deny_list: Vec<String>,
}

impl Default for RawCommandConfig {
    fn default() -> Self {
        Self {
            deny_list: default_deny_list(),
        }
    }
}

// Service default functions
fn default_log_level() -> String {
    "info".to_string()
}

// Transport default functions
fn default_port() -> u16 {
    443
}

fn default_polling_interval_ms() -> u64 {
    350
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// Cache default functions
fn default_max_entries() -> usize {
    1000
}

fn default_cache_ttl_ms() -> u64 {
    3_600_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

// Event cache default functions
fn default_max_events() -> usize {
    1000
}

fn default_max_age_ms() -> u64 {
    3_600_000
}

fn default_global_memory_limit_mb() -> u64 {
    50
}

fn default_memory_check_interval_ms() -> u64 {
    5000
}

fn default_recent_window_ms() -> u64 {
    60_000
}

fn default_medium_window_ms() -> u64 {
    300_000
}

fn default_ancient_window_ms() -> u64 {
    900_000
}

fn default_significant_change_percent() -> f64 {
    10.0
}

fn default_min_time_between_events_ms() -> u64 {
    1000
}

fn default_spill_max_file_size_mb() -> u64 {
    10
}

fn default_spill_max_age_days() -> u64 {
    7
}

fn default_spill_total_size_cap_mb() -> u64 {
    500
}

// Breaker default functions
fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_breaker_timeout_ms() -> u64 {
    60_000
}

// Change-group default functions
fn default_max_concurrent_changes() -> usize {
    10
}

// Raw-command default functions
fn default_deny_list() -> Vec<String> {
    vec![
        "Core.Reboot".to_string(),
        "Core.Shutdown".to_string(),
        "Core.FactoryReset".to_string(),
        "Design.Delete".to_string(),
    ]
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/qrc-bridge/{service_name}/config.toml
    /// 3. System directory: /etc/qrc-bridge/{service_name}/config.toml
    ///
    /// Environment variables (QRC_ prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "qrc-bridge".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    ///
    /// This is the recommended way to load config in production.
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Merge config files in reverse order (lowest priority first)
        // so that higher priority files override lower ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        // Environment variables have highest priority
        figment = figment.merge(Env::prefixed("QRC_").split("_"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses XDG directories and loads directly from the given path.
    /// Useful for testing or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("QRC_").split("_"))
            .extract()?;

        Ok(config)
    }

    /// Find all possible config file paths for a service
    ///
    /// Returns paths in priority order (highest first):
    /// 1. Current working directory
    /// 2. XDG config directory
    /// 3. System directory
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("qrc-bridge");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/qrc-bridge")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "qrc-bridge".to_string(),
                log_level: default_log_level(),
            },
            transport: TransportConfig::default(),
            cache: CacheConfig::default(),
            event_cache: EventCacheConfig::default(),
            breaker: BreakerConfig::default(),
            change_group: ChangeGroupConfig::default(),
            raw_command: RawCommandConfig::default(),
        }
    }
}

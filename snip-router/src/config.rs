//! Configuration management for the snip router.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::engine::format::{ProcessingFormat, RecognitionFormat};

/// Environment variable that overrides `ai.api_key`
pub const API_KEY_ENV: &str = "SNIP_AI_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the router is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of entries kept (oldest dropped first)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Persist on every mutation
    #[serde(default = "default_true")]
    pub auto_save: bool,

    /// Key under which the history is stored in the local store
    #[serde(default = "default_history_key")]
    pub storage_key: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            auto_save: true,
            storage_key: default_history_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Queue capacity; the oldest item is evicted on overflow
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Drain passes before an item with no successful destination fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Drain tick interval
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,

    /// Skip items that are mid-delivery when choosing what to evict
    #[serde(default = "default_true")]
    pub protect_processing: bool,

    /// Program run as `<cmd> <title> <message>` for notification deliveries;
    /// unset means notifications are only logged
    #[serde(default)]
    pub notify_command: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            drain_interval_ms: default_drain_interval(),
            protect_processing: true,
            notify_command: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Output format requested from recognition rules
    #[serde(default)]
    pub recognition_format: RecognitionFormat,

    /// Output format requested from processing rules
    #[serde(default)]
    pub processing_format: ProcessingFormat,

    /// Rule set consulted before the default table
    #[serde(default)]
    pub default_rule_set: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Base URL of the responses API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token (overridden by SNIP_AI_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AiConfig {
    /// API key from the environment, falling back to the config file
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// RPC response timeout
    #[serde(default = "default_rpc_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_rpc_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Data URL length above which captures are recompressed
    #[serde(default = "default_size_threshold")]
    pub size_threshold_bytes: usize,

    /// JPEG quality used for recompression (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Delay after creating the offscreen document before messaging it
    #[serde(default = "default_offscreen_settle")]
    pub offscreen_settle_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: default_size_threshold(),
            jpeg_quality: default_jpeg_quality(),
            offscreen_settle_ms: default_offscreen_settle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Path to the SQLite database backing the local store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            db_path: default_db_path(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_entries() -> usize {
    500
}

fn default_history_key() -> String {
    "rs-action-history".to_string()
}

fn default_max_queue_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_drain_interval() -> u64 {
    1000
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-5-mini".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_rpc_timeout() -> u64 {
    30_000
}

fn default_size_threshold() -> usize {
    2 * 1024 * 1024
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_offscreen_settle() -> u64 {
    500
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/snip-router.sock")
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("snip-router")
        .join("state.db")
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("snip-router")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

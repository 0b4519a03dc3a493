//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Media library configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root directory of the audio library
    #[serde(default = "default_media_root")]
    pub media_root: String,
    /// Playable file extensions (lowercase, with leading dot)
    #[serde(default = "default_allowed_exts")]
    pub allowed_exts: Vec<String>,
}

fn default_media_root() -> String {
    "static/sounds".to_string()
}

fn default_allowed_exts() -> Vec<String> {
    [".mp3", ".wav", ".ogg", ".m4a", ".flac", ".aac"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            media_root: default_media_root(),
            allowed_exts: default_allowed_exts(),
        }
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Directory holding cached JSON entries
    #[serde(default = "default_cache_dir")]
    pub dir: String,
    /// Entry time-to-live in seconds (default 12 hours)
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Seconds between library change-detection sweeps
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
}

fn default_cache_dir() -> String {
    "_cache".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    43_200
}

fn default_watch_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
            watch_interval_secs: default_watch_interval_secs(),
        }
    }
}

/// Transcoding gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeConfig {
    /// Whether the gateway transcodes at all (false = direct serving only)
    #[serde(default = "default_transcode_enabled")]
    pub enabled: bool,
    /// Target audio bitrate passed to the encoder
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
    /// Output sample rate in Hz
    #[serde(default = "default_sample_rate_hz")]
    pub sample_rate_hz: u32,
    /// Persist completed transcodes and reuse them on repeat requests
    #[serde(default = "default_cache_outputs")]
    pub cache_outputs: bool,
    /// ffmpeg executable (name on PATH or absolute path)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

fn default_transcode_enabled() -> bool {
    true
}

fn default_bitrate() -> String {
    "96k".to_string()
}

fn default_sample_rate_hz() -> u32 {
    48_000
}

fn default_cache_outputs() -> bool {
    true
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: default_transcode_enabled(),
            bitrate: default_bitrate(),
            sample_rate_hz: default_sample_rate_hz(),
            cache_outputs: default_cache_outputs(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Community-recording intake configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingsConfig {
    /// Root directory for submitted recordings and the upload log
    #[serde(default = "default_recordings_root")]
    pub root: String,
    /// Bitrate for converting submitted recordings to mp3
    #[serde(default = "default_upload_bitrate")]
    pub upload_bitrate: String,
    /// Sample rate for converted recordings in Hz
    #[serde(default = "default_upload_sample_rate_hz")]
    pub upload_sample_rate_hz: u32,
}

fn default_recordings_root() -> String {
    "data/recorded".to_string()
}

fn default_upload_bitrate() -> String {
    "192k".to_string()
}

fn default_upload_sample_rate_hz() -> u32 {
    44_100
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            root: default_recordings_root(),
            upload_bitrate: default_upload_bitrate(),
            upload_sample_rate_hz: default_upload_sample_rate_hz(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket address to bind
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Identity allowed to accept/reject recordings; empty disables those endpoints
    #[serde(default)]
    pub owner_id: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            owner_id: String::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub recordings: RecordingsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - WAVEBOX_MEDIA_ROOT -> library.media_root
    /// - WAVEBOX_CACHE_DIR -> cache.dir
    /// - WAVEBOX_CACHE_TTL_SECS -> cache.ttl_secs
    /// - WAVEBOX_WATCH_INTERVAL_SECS -> cache.watch_interval_secs
    /// - WAVEBOX_TRANSCODE_ENABLED -> transcode.enabled
    /// - WAVEBOX_FFMPEG_PATH -> transcode.ffmpeg_path
    /// - WAVEBOX_RECORDINGS_ROOT -> recordings.root
    /// - WAVEBOX_BIND_ADDR -> server.bind_addr
    /// - WAVEBOX_OWNER_ID -> server.owner_id
    pub fn apply_env_overrides(&mut self) {
        // WAVEBOX_MEDIA_ROOT
        if let Ok(val) = env::var("WAVEBOX_MEDIA_ROOT") {
            if !val.is_empty() {
                self.library.media_root = val;
            }
        }

        // WAVEBOX_CACHE_DIR
        if let Ok(val) = env::var("WAVEBOX_CACHE_DIR") {
            if !val.is_empty() {
                self.cache.dir = val;
            }
        }

        // WAVEBOX_CACHE_TTL_SECS
        if let Ok(val) = env::var("WAVEBOX_CACHE_TTL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.cache.ttl_secs = secs;
            }
        }

        // WAVEBOX_WATCH_INTERVAL_SECS
        if let Ok(val) = env::var("WAVEBOX_WATCH_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.cache.watch_interval_secs = secs;
            }
        }

        // WAVEBOX_TRANSCODE_ENABLED
        if let Ok(val) = env::var("WAVEBOX_TRANSCODE_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.transcode.enabled = true,
                "false" | "0" | "no" => self.transcode.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }

        // WAVEBOX_FFMPEG_PATH
        if let Ok(val) = env::var("WAVEBOX_FFMPEG_PATH") {
            if !val.is_empty() {
                self.transcode.ffmpeg_path = val;
            }
        }

        // WAVEBOX_RECORDINGS_ROOT
        if let Ok(val) = env::var("WAVEBOX_RECORDINGS_ROOT") {
            if !val.is_empty() {
                self.recordings.root = val;
            }
        }

        // WAVEBOX_BIND_ADDR
        if let Ok(val) = env::var("WAVEBOX_BIND_ADDR") {
            if !val.is_empty() {
                self.server.bind_addr = val;
            }
        }

        // WAVEBOX_OWNER_ID
        if let Ok(val) = env::var("WAVEBOX_OWNER_ID") {
            self.server.owner_id = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

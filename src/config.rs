//! Configuration for the update agent.

use crate::upgrade::version::VersionTriple;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Shape of the version-check request sent to the update endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataRequest {
    /// `POST` a JSON object carrying the device identifier.
    #[default]
    DeviceId,
    /// Plain `GET` with no body.
    Bare,
}

/// Credentials for joining the wireless network.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WifiCredentials {
    /// Network name.
    #[serde(default)]
    pub ssid: String,

    /// Network passphrase.
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Wireless network credentials.
    #[serde(default)]
    pub wifi: WifiCredentials,

    /// Version of the firmware currently running.
    #[serde(default = "default_current_version")]
    pub current_version: String,

    /// Update endpoint answering version checks.
    #[serde(default)]
    pub endpoint: String,

    /// Identifier sent to the update endpoint.
    #[serde(default)]
    pub device_id: String,

    /// Interval between version checks in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Connect to the network on `start()`.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Verify TLS peers. When unset, encrypted transports skip verification.
    #[serde(default)]
    pub verify_tls: bool,

    /// Version-check request shape.
    #[serde(default)]
    pub metadata_request: MetadataRequest,

    /// Largest accepted version-check response body, in bytes.
    #[serde(default = "default_metadata_limit")]
    pub metadata_limit: usize,

    /// Download tuning.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Network connection retry policy.
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Flash slot used by the host binary.
    #[serde(default)]
    pub flash: FlashConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Firmware download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Read buffer size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Fail the download when no bytes arrive for this many seconds.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Pause between the completion notice and the restart, in milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

/// Network connection retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Connection attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,

    /// Delay between attempts in milliseconds.
    #[serde(default = "default_connect_backoff_ms")]
    pub backoff_ms: u64,
}

/// File-backed flash slot used on hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Where committed images are written.
    #[serde(default = "default_image_path")]
    pub image_path: PathBuf,

    /// Slot capacity in bytes.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            wifi: WifiCredentials::default(),
            current_version: default_current_version(),
            endpoint: String::new(),
            device_id: String::new(),
            check_interval_ms: default_check_interval_ms(),
            auto_connect: true,
            verify_tls: false,
            metadata_request: MetadataRequest::default(),
            metadata_limit: default_metadata_limit(),
            download: DownloadConfig::default(),
            connect: ConnectConfig::default(),
            flash: FlashConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            backoff_ms: default_connect_backoff_ms(),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            image_path: default_image_path(),
            capacity: default_capacity(),
        }
    }
}

fn default_current_version() -> String {
    "0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_image_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "bitflash")
        .map(|dirs| dirs.data_dir().join("firmware.bin"))
        .unwrap_or_else(|| PathBuf::from(".bitflash/firmware.bin"))
}

const fn default_true() -> bool {
    true
}

const fn default_check_interval_ms() -> u64 {
    3_600_000 // 1 hour
}

const fn default_metadata_limit() -> usize {
    1024
}

const fn default_chunk_size() -> usize {
    1024
}

const fn default_inactivity_timeout_secs() -> u64 {
    30
}

const fn default_restart_delay_ms() -> u64 {
    1000
}

const fn default_connect_attempts() -> u32 {
    20
}

const fn default_connect_backoff_ms() -> u64 {
    500
}

const fn default_capacity() -> u64 {
    4 * 1024 * 1024
}

impl AgentConfig {
    /// Interval between version checks.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Check the invariants the agent relies on.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first violated invariant.
    pub fn validate(&self) -> crate::Result<()> {
        if self.check_interval_ms == 0 {
            return Err(crate::Error::Config(
                "check interval must be greater than zero".to_string(),
            ));
        }
        if VersionTriple::parse(&self.current_version).is_err() {
            return Err(crate::Error::Config(format!(
                "current version {:?} is not major.minor.patch",
                self.current_version
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(crate::Error::Config("update endpoint is empty".to_string()));
        }
        if self.metadata_limit == 0 {
            return Err(crate::Error::Config(
                "metadata limit must be greater than zero".to_string(),
            ));
        }
        if self.download.chunk_size == 0 {
            return Err(crate::Error::Config(
                "download chunk size must be greater than zero".to_string(),
            ));
        }
        if self.connect.attempts == 0 {
            return Err(crate::Error::Config(
                "connect attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

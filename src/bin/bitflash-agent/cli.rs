//! Command-line interface definition.

use bitflash::config::{AgentConfig, MetadataRequest};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Over-the-air firmware update agent.
#[derive(Parser, Debug)]
#[command(name = "bitflash-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Update endpoint answering version checks.
    #[arg(long, short, env = "BITFLASH_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Version of the firmware currently running.
    #[arg(long, env = "BITFLASH_CURRENT_VERSION")]
    pub current_version: Option<String>,

    /// Identifier sent to the update endpoint.
    #[arg(long, env = "BITFLASH_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Interval between version checks, in seconds.
    #[arg(long, env = "BITFLASH_CHECK_INTERVAL")]
    pub check_interval_secs: Option<u64>,

    /// Wireless network name.
    #[arg(long, env = "BITFLASH_WIFI_SSID")]
    pub wifi_ssid: Option<String>,

    /// Wireless network passphrase.
    #[arg(long, env = "BITFLASH_WIFI_PASSWORD", hide_env_values = true)]
    pub wifi_password: Option<String>,

    /// Verify TLS certificates of encrypted endpoints.
    #[arg(long, env = "BITFLASH_VERIFY_TLS")]
    pub verify_tls: bool,

    /// Shape of the version-check request.
    #[arg(long, value_enum, env = "BITFLASH_REQUEST")]
    pub request: Option<CliMetadataRequest>,

    /// File receiving committed firmware images.
    #[arg(long, env = "BITFLASH_IMAGE_PATH")]
    pub image_path: Option<PathBuf>,

    /// Flash slot capacity in bytes.
    #[arg(long, env = "BITFLASH_FLASH_CAPACITY")]
    pub flash_capacity: Option<u64>,

    /// Run a single check and exit.
    #[arg(long)]
    pub once: bool,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BITFLASH_JSON_LOGS")]
    pub json_logs: bool,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Version-check request CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliMetadataRequest {
    /// POST the device identifier as JSON.
    DeviceId,
    /// Bodyless GET.
    Bare,
}

impl Cli {
    /// Convert CLI arguments into an `AgentConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded,
    /// or the resulting configuration is invalid.
    pub fn to_config(&self) -> color_eyre::Result<AgentConfig> {
        let mut config = if let Some(ref path) = self.config {
            AgentConfig::from_file(path)?
        } else {
            AgentConfig::default()
        };

        if let Some(ref endpoint) = self.endpoint {
            config.endpoint.clone_from(endpoint);
        }
        if let Some(ref version) = self.current_version {
            config.current_version.clone_from(version);
        }
        if let Some(ref device_id) = self.device_id {
            config.device_id.clone_from(device_id);
        }
        if let Some(secs) = self.check_interval_secs {
            config.check_interval_ms = secs.saturating_mul(1000);
        }
        if let Some(ref ssid) = self.wifi_ssid {
            config.wifi.ssid.clone_from(ssid);
        }
        if let Some(ref password) = self.wifi_password {
            config.wifi.password.clone_from(password);
        }
        if let Some(request) = self.request {
            config.metadata_request = request.into();
        }
        if let Some(ref path) = self.image_path {
            config.flash.image_path.clone_from(path);
        }
        if let Some(capacity) = self.flash_capacity {
            config.flash.capacity = capacity;
        }

        config.verify_tls |= self.verify_tls;
        config.log_level.clone_from(&self.log_level);

        config.validate()?;
        Ok(config)
    }
}

impl From<CliMetadataRequest> for MetadataRequest {
    fn from(r: CliMetadataRequest) -> Self {
        match r {
            CliMetadataRequest::DeviceId => Self::DeviceId,
            CliMetadataRequest::Bare => Self::Bare,
        }
    }
}

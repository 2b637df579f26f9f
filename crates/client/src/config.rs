//! Client configuration management

use crate::engine::EngineConfig;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub log_level: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Transfer pool tuning
///
/// # Example Configuration
/// ```toml
/// [transfer]
/// pool_size = 8
/// buffer_size = 8192
/// exit_on_eof = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Transfers in flight per direction
    #[serde(default = "TransferSettings::default_pool_size")]
    pub pool_size: usize,
    /// Capacity of every transfer buffer, both directions
    #[serde(default = "TransferSettings::default_buffer_size")]
    pub buffer_size: usize,
    /// Upper bound on one libusb event-handling call
    #[serde(default = "TransferSettings::default_event_timeout")]
    pub event_timeout_ms: u64,
    /// Back-off after a would-block read of local input
    #[serde(default = "TransferSettings::default_retry_delay")]
    pub retry_delay_us: u64,
    /// Stop the client once local input ends and every outbound transfer completed
    #[serde(default)]
    pub exit_on_eof: bool,
    /// How long cancelled transfers are given to complete on shutdown
    #[serde(default = "TransferSettings::default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            buffer_size: Self::default_buffer_size(),
            event_timeout_ms: Self::default_event_timeout(),
            retry_delay_us: Self::default_retry_delay(),
            exit_on_eof: false,
            shutdown_grace_ms: Self::default_shutdown_grace(),
        }
    }
}

impl TransferSettings {
    fn default_pool_size() -> usize {
        8
    }

    fn default_buffer_size() -> usize {
        8192
    }

    fn default_event_timeout() -> u64 {
        100
    }

    fn default_retry_delay() -> u64 {
        100
    }

    fn default_shutdown_grace() -> u64 {
        1000
    }

    /// Engine parameters derived from these settings
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pool_size: self.pool_size,
            buffer_size: self.buffer_size,
            event_timeout: Duration::from_millis(self.event_timeout_ms),
            retry_delay: Duration::from_micros(self.retry_delay_us),
            exit_on_eof: self.exit_on_eof,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

impl ClientConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbpipe/client.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ClientConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!(
            "Transfer pool: {} x {} bytes per direction",
            config.transfer.pool_size,
            config.transfer.buffer_size
        );
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Print to stderr since logging might not be initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbpipe").join("client.toml")
        } else {
            PathBuf::from(".config/usbpipe/client.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.client.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.client.log_level,
                valid_levels.join(", ")
            ));
        }

        let t = &self.transfer;
        if t.pool_size == 0 {
            return Err(anyhow!("pool_size must be greater than 0"));
        }
        // libusb takes the transfer length as a C int
        if t.buffer_size == 0 || t.buffer_size > i32::MAX as usize {
            return Err(anyhow!("Invalid buffer_size {}", t.buffer_size));
        }
        if t.event_timeout_ms == 0 {
            return Err(anyhow!("event_timeout_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<ClientConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ClientConfig::load(Some(path_buf))
}

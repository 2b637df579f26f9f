//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub gadget: GadgetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Upper bound on how long ep0 is polled before the shutdown flag is rechecked
    #[serde(default = "DaemonSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl DaemonSettings {
    fn default_poll_interval() -> u64 {
        100
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// USB gadget identity written to configfs
///
/// # Example Configuration
/// ```toml
/// [gadget]
/// name = "usbpipe"
/// vendor_id = 0x0456
/// product_id = 0xb672
/// manufacturer = "Analog Devices Inc."
/// product = "M2K"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GadgetSettings {
    /// Mount point of configfs
    #[serde(default = "GadgetSettings::default_configfs_root")]
    pub configfs_root: PathBuf,
    /// Gadget directory name, also used as the FunctionFS instance name
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default = "GadgetSettings::default_bcd_usb")]
    pub bcd_usb: u16,
    #[serde(default = "GadgetSettings::default_bcd_device")]
    pub bcd_device: u16,
    #[serde(default = "GadgetSettings::default_max_packet_size0")]
    pub max_packet_size0: u8,
    pub serial_number: String,
    pub manufacturer: String,
    pub product: String,
    /// Configuration string of the single configuration
    pub configuration: String,
}

impl Default for GadgetSettings {
    fn default() -> Self {
        Self {
            configfs_root: Self::default_configfs_root(),
            name: "usbpipe".to_string(),
            vendor_id: 0x0456,
            product_id: 0xb672,
            bcd_usb: Self::default_bcd_usb(),
            bcd_device: Self::default_bcd_device(),
            max_packet_size0: Self::default_max_packet_size0(),
            serial_number: "00000000".to_string(),
            manufacturer: "Analog Devices Inc.".to_string(),
            product: "M2K".to_string(),
            configuration: "M2K IIO".to_string(),
        }
    }
}

impl GadgetSettings {
    fn default_configfs_root() -> PathBuf {
        PathBuf::from("/sys/kernel/config")
    }

    fn default_bcd_usb() -> u16 {
        0x0200
    }

    fn default_bcd_device() -> u16 {
        0x0001
    }

    fn default_max_packet_size0() -> u8 {
        64
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbpipe/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults
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

        // Create parent directories if they don't exist
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
            config_dir.join("usbpipe").join("daemon.toml")
        } else {
            PathBuf::from(".config/usbpipe/daemon.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.daemon.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        let name = &self.gadget.name;
        if name.is_empty() || name.contains('/') || name.contains('.') {
            return Err(anyhow!(
                "Invalid gadget name '{}': must be non-empty and contain no '/' or '.'",
                name
            ));
        }

        if ![8, 16, 32, 64].contains(&self.gadget.max_packet_size0) {
            return Err(anyhow!(
                "Invalid max_packet_size0 {}, must be 8, 16, 32 or 64",
                self.gadget.max_packet_size0
            ));
        }

        Ok(())
    }
}

/// Load configuration from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<DaemonConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    DaemonConfig::load(Some(path_buf))
}

use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zramkit_core::{DeviceConfig, ManagerConfig};

/// Prefix of environment variables overriding the file, e.g.
/// `ZRAMKIT__MONITORING__REFRESH_INTERVAL_SECS=5`
pub const ENV_PREFIX: &str = "ZRAMKIT";

/// Main configuration for the ZramKit daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Kernel paths, tools and defaults for the device manager
    pub manager: ManagerConfig,

    /// Logging configuration
    pub logging: LogConfig,

    /// Periodic refresh and stats export
    pub monitoring: MonitoringConfig,

    /// Devices brought up by `run`, in creation order
    pub devices: Vec<DeviceEntry>,
}

/// One zram device of the device table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceEntry {
    /// Disk size, e.g. "512MiB" or "2 GiB"
    pub size: String,

    /// Compression streams (default: 1)
    pub streams: u32,

    /// Compression algorithm; the manager default applies when unset
    pub algorithm: Option<String>,

    /// Swap priority (default: 100)
    pub priority: i32,

    /// Swap label; activation and deactivation go by label when set
    pub label: Option<String>,

    /// Enable as swap right after creation (default: true)
    pub activate: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log directory path (default: ./logs)
    pub log_dir: PathBuf,

    /// Daily rotated log file prefix (default: zramkit-daemon.log)
    pub log_file: String,

    /// Filter used when RUST_LOG is not set (default: info)
    pub level: String,
}

/// Periodic device refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Refresh interval in seconds (default: 10)
    pub refresh_interval_secs: u64,

    /// JSON stats file rewritten after every refresh, if set
    pub stats_file: Option<PathBuf>,
}

impl Default for DeviceEntry {
    fn default() -> Self {
        Self {
            size: "256MiB".to_string(),
            streams: 1,
            algorithm: None,
            priority: 100,
            label: None,
            activate: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            log_file: "zramkit-daemon.log".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 10,
            stats_file: None,
        }
    }
}

impl DeviceEntry {
    /// Size in bytes
    pub fn size_bytes(&self) -> Result<u64, String> {
        Byte::parse_str(&self.size, true)
            .map(|b| b.as_u64())
            .map_err(|e| format!("invalid device size {:?}: {}", self.size, e))
    }

    pub fn to_device_config(&self) -> Result<DeviceConfig, String> {
        let config = DeviceConfig::new(self.size_bytes()?).with_max_streams(self.streams);
        Ok(match &self.algorithm {
            Some(alg) => config.with_algorithm(alg.clone()),
            None => config,
        })
    }
}

impl Config {
    /// Default configuration with one example device in the table
    pub fn example() -> Self {
        Self {
            devices: vec![DeviceEntry {
                label: Some("zram0".to_string()),
                ..DeviceEntry::default()
            }],
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file, with `ZRAMKIT__*` environment
    /// variables layered on top
    ///
    /// # Example
    /// ```no_run
    /// use zramkit_daemon::config::Config;
    ///
    /// let config = Config::load_from_file("/etc/zramkit/config.toml").unwrap();
    /// println!("devices: {}", config.devices.len());
    /// ```
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::from(path.as_ref()).format(::config::FileFormat::Toml),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        self.manager.validate()?;

        if self.monitoring.refresh_interval_secs == 0 {
            return Err("Refresh interval must be > 0".to_string());
        }

        if self.logging.log_file.trim().is_empty() {
            return Err("Log file name must not be empty".to_string());
        }

        let mut labels = Vec::new();
        for (position, entry) in self.devices.iter().enumerate() {
            let size = entry
                .size_bytes()
                .map_err(|e| format!("device {}: {}", position, e))?;
            if size == 0 {
                return Err(format!("device {}: size must be > 0", position));
            }
            if entry.streams == 0 {
                return Err(format!("device {}: streams must be >= 1", position));
            }
            if let Some(label) = &entry.label {
                if labels.contains(&label) {
                    return Err(format!("device {}: duplicate label {:?}", position, label));
                }
                labels.push(label);
            }
        }

        Ok(())
    }

    /// Per-device configs for the manager, in table order
    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>, String> {
        self.devices.iter().map(DeviceEntry::to_device_config).collect()
    }

    /// Full path of the active log file
    pub fn log_path(&self) -> PathBuf {
        self.logging.log_dir.join(&self.logging.log_file)
    }
}

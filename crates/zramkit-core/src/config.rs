use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Paths and tools the manager talks to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// sysfs mount point (default: /sys)
    pub sys_root: PathBuf,

    /// Directory holding block device nodes (default: /dev)
    pub dev_root: PathBuf,

    /// Kernel swap listing (default: /proc/swaps)
    pub proc_swaps: PathBuf,

    /// External programs
    pub tools: ToolPaths,

    /// Compression algorithm applied to every new device, if set
    pub default_algorithm: Option<String>,

    /// Upper bound for formatting plus activating a swap device
    pub swap_timeout_secs: Option<u64>,
}

/// Locations of the external programs used for module and swap control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub modprobe: String,
    pub mkswap: String,
    pub swapon: String,
    pub swapoff: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            proc_swaps: PathBuf::from("/proc/swaps"),
            tools: ToolPaths::default(),
            default_algorithm: None,
            swap_timeout_secs: Some(60),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            modprobe: "modprobe".to_string(),
            mkswap: "mkswap".to_string(),
            swapon: "swapon".to_string(),
            swapoff: "swapoff".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn swap_timeout(&self) -> Option<Duration> {
        self.swap_timeout_secs.map(Duration::from_secs)
    }

    /// Check values that would otherwise surface as confusing kernel errors
    pub fn validate(&self) -> Result<(), String> {
        if self.swap_timeout_secs == Some(0) {
            return Err("Swap timeout must be > 0 when set".to_string());
        }

        if let Some(alg) = &self.default_algorithm {
            if alg.trim().is_empty() || alg.contains(char::is_whitespace) {
                return Err(format!("Invalid default algorithm: {:?}", alg));
            }
        }

        for (name, tool) in [
            ("modprobe", &self.tools.modprobe),
            ("mkswap", &self.tools.mkswap),
            ("swapon", &self.tools.swapon),
            ("swapoff", &self.tools.swapoff),
        ] {
            if tool.trim().is_empty() {
                return Err(format!("Tool path for {} must not be empty", name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();

        assert_eq!(config.sys_root, PathBuf::from("/sys"));
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
        assert_eq!(config.proc_swaps, PathBuf::from("/proc/swaps"));
        assert_eq!(config.tools.mkswap, "mkswap");
        assert_eq!(config.swap_timeout(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = ManagerConfig {
            swap_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("timeout"));
    }

    #[test]
    fn test_validation_rejects_bad_algorithm() {
        let config = ManagerConfig {
            default_algorithm: Some("lz4 zstd".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_tool() {
        let mut config = ManagerConfig::default();
        config.tools.swapoff = String::new();
        assert!(config.validate().unwrap_err().contains("swapoff"));
    }
}

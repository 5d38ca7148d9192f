//! Statistics export
//!
//! After every refresh the daemon can write a JSON snapshot of all devices
//! for dashboards and scripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zramkit_core::ZramDevice;

/// Complete statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStats {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Daemon runtime in seconds
    pub runtime_secs: u64,

    /// Refresh rounds performed so far
    pub refresh_count: u64,

    /// Counter regressions seen so far
    pub regressions: u64,

    pub devices: Vec<DeviceStats>,

    pub totals: TotalStats,
}

/// Per-device statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub index: u32,
    pub device_node: PathBuf,
    pub disk_size: u64,
    pub comp_algorithm: String,
    pub max_comp_streams: u32,
    pub active: bool,
    pub label: Option<String>,
    pub num_reads: u64,
    pub num_writes: u64,
    pub orig_data_size: u64,
    pub compr_data_size: u64,
    pub compression_ratio: f64,
    pub space_savings: f64,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Sums over all devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalStats {
    pub devices: usize,
    pub active_devices: usize,
    pub disk_size: u64,
    pub orig_data_size: u64,
    pub compr_data_size: u64,
}

impl From<&ZramDevice> for DeviceStats {
    fn from(device: &ZramDevice) -> Self {
        Self {
            index: device.index(),
            device_node: device.device_node().to_path_buf(),
            disk_size: device.disk_size(),
            comp_algorithm: device.comp_algorithm().to_string(),
            max_comp_streams: device.max_comp_streams(),
            active: device.is_active(),
            label: device.label().map(str::to_string),
            num_reads: device.num_reads(),
            num_writes: device.num_writes(),
            orig_data_size: device.orig_data_size(),
            compr_data_size: device.compr_data_size(),
            compression_ratio: device.stats().compression_ratio(),
            space_savings: device.stats().space_savings(),
            last_refresh: device.last_refresh(),
        }
    }
}

impl TotalStats {
    pub fn from_devices(devices: &[DeviceStats]) -> Self {
        devices.iter().fold(Self::default(), |mut totals, d| {
            totals.devices += 1;
            if d.active {
                totals.active_devices += 1;
            }
            totals.disk_size += d.disk_size;
            totals.orig_data_size += d.orig_data_size;
            totals.compr_data_size += d.compr_data_size;
            totals
        })
    }
}

impl DaemonStats {
    pub fn new(devices: &[ZramDevice], runtime_secs: u64, refresh_count: u64, regressions: u64) -> Self {
        let devices: Vec<DeviceStats> = devices.iter().map(DeviceStats::from).collect();
        Self {
            timestamp: Utc::now(),
            runtime_secs,
            refresh_count,
            regressions,
            totals: TotalStats::from_devices(&devices),
            devices,
        }
    }

    /// Write pretty JSON, replacing the file atomically
    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }
}

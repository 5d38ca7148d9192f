//! Device model

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::stats::StatsSnapshot;

/// How a swap device was brought up, and therefore how to bring it down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapIdentity {
    Path(PathBuf),
    Label(String),
}

impl SwapIdentity {
    /// Arguments addressing this swap space for `swapon`/`swapoff`
    pub fn args(&self) -> Vec<String> {
        match self {
            SwapIdentity::Path(path) => vec![path.display().to_string()],
            SwapIdentity::Label(label) => vec!["-L".to_string(), label.clone()],
        }
    }
}

impl fmt::Display for SwapIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapIdentity::Path(path) => write!(f, "{}", path.display()),
            SwapIdentity::Label(label) => write!(f, "LABEL={}", label),
        }
    }
}

/// One live kernel zram device
///
/// Fields are read-only outside the crate; the configurator, swap controller
/// and manager are the only writers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZramDevice {
    index: u32,
    device_node: PathBuf,
    pub(crate) disk_size: u64,
    pub(crate) comp_algorithm: String,
    pub(crate) max_comp_streams: u32,
    pub(crate) active: bool,
    pub(crate) label: Option<String>,
    pub(crate) stats: StatsSnapshot,
    pub(crate) last_refresh: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) identity: Option<SwapIdentity>,
}

impl ZramDevice {
    /// A freshly hot-added, unconfigured device
    pub fn new(index: u32, device_node: PathBuf) -> Self {
        Self {
            index,
            device_node,
            disk_size: 0,
            comp_algorithm: String::new(),
            max_comp_streams: 0,
            active: false,
            label: None,
            stats: StatsSnapshot::default(),
            last_refresh: None,
            identity: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> String {
        format!("zram{}", self.index)
    }

    pub fn device_node(&self) -> &Path {
        &self.device_node
    }

    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    pub fn is_configured(&self) -> bool {
        self.disk_size > 0
    }

    pub fn comp_algorithm(&self) -> &str {
        &self.comp_algorithm
    }

    pub fn max_comp_streams(&self) -> u32 {
        self.max_comp_streams
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    pub fn num_reads(&self) -> u64 {
        self.stats.num_reads
    }

    pub fn num_writes(&self) -> u64 {
        self.stats.num_writes
    }

    pub fn orig_data_size(&self) -> u64 {
        self.stats.orig_data_size
    }

    pub fn compr_data_size(&self) -> u64 {
        self.stats.compr_data_size
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    /// Identity to use for `swapoff`; path when the device was activated by path
    /// or when swap was enabled behind our back
    pub fn swap_identity(&self) -> SwapIdentity {
        self.identity
            .clone()
            .unwrap_or_else(|| SwapIdentity::Path(self.device_node.clone()))
    }

    pub(crate) fn mark_active(&mut self, identity: SwapIdentity) {
        self.label = match &identity {
            SwapIdentity::Label(label) => Some(label.clone()),
            SwapIdentity::Path(_) => None,
        };
        self.identity = Some(identity);
        self.active = true;
    }

    pub(crate) fn mark_inactive(&mut self) {
        self.active = false;
        self.label = None;
        self.identity = None;
    }

    /// Back to the state right after hot-add
    pub(crate) fn clear_configuration(&mut self) {
        self.mark_inactive();
        self.disk_size = 0;
        self.stats = StatsSnapshot::default();
    }
}

impl fmt::Display for ZramDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}B disksize, {} algorithm, {} streams, {}",
            self.name(),
            self.disk_size,
            if self.comp_algorithm.is_empty() {
                "-"
            } else {
                self.comp_algorithm.as_str()
            },
            self.max_comp_streams,
            if self.active { "active" } else { "inactive" }
        )
    }
}

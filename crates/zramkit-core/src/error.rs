use std::fmt;
use thiserror::Error;

/// Why a configuration request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReason {
    /// `disksize` is one-shot; the device must be reset first
    AlreadySized,
    /// Algorithm and stream count are frozen while the device is swap
    DeviceActive,
    /// The kernel does not list this algorithm in `comp_algorithm`
    UnsupportedAlgorithm(String),
}

impl fmt::Display for ConfigReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigReason::AlreadySized => write!(f, "already sized"),
            ConfigReason::DeviceActive => write!(f, "device active"),
            ConfigReason::UnsupportedAlgorithm(_) => write!(f, "unsupported algorithm"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ZramError {
    #[error("Module error: {0}")]
    Module(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Allocation failed at position {failed_at}: {cause}")]
    Allocation {
        failed_at: usize,
        cause: Box<ZramError>,
    },

    #[error("Config error on zram{index}: {reason}")]
    Config { index: u32, reason: ConfigReason },

    #[error("Swap error on {target}: {reason}")]
    Swap { target: String, reason: String },

    #[error("Stats error on zram{index}: {reason}")]
    Stats { index: u32, reason: String },

    #[error("Device zram{0} is not registered")]
    NotFound(u32),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ZramError {
    pub fn config(index: u32, reason: ConfigReason) -> Self {
        ZramError::Config { index, reason }
    }

    pub fn swap(target: impl Into<String>, reason: impl Into<String>) -> Self {
        ZramError::Swap {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn stats(index: u32, reason: impl Into<String>) -> Self {
        ZramError::Stats {
            index,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ZramError>;

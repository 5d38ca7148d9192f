//! ZramKit Daemon
//!
//! Brings up a configured table of zram swap devices, keeps their statistics
//! fresh and tears everything down on shutdown.

pub mod config;
pub mod monitor;
pub mod service;
pub mod stats;

pub use config::Config;
pub use monitor::DeviceMonitor;
pub use service::{ServiceError, ZramService};
pub use stats::DaemonStats;

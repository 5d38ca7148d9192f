//! ZramKit Core Library
//!
//! Lifecycle management for Linux zram devices: module loading, device
//! allocation and sizing, swap activation and statistics, behind typed,
//! concurrency-safe handles.

pub mod algorithm;
pub mod allocator;
pub mod command;
pub mod config;
pub mod configurator;
pub mod device;
pub mod error;
pub mod kernel;
pub mod manager;
pub mod module_gate;
pub mod registry;
pub mod stats;
pub mod swap;
pub mod swaps;
pub mod sysfs;
pub mod testing;

pub use algorithm::CompAlgorithm;
pub use allocator::{DestroyOutcome, DestroyTarget, DeviceAllocator};
pub use command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use config::{ManagerConfig, ToolPaths};
pub use configurator::{DeviceConfig, DeviceConfigurator};
pub use device::{SwapIdentity, ZramDevice};
pub use error::{ConfigReason, Result, ZramError};
pub use kernel::{zram_supported, Attr, SysfsKernel, ZramKernel};
pub use manager::ZramManager;
pub use module_gate::ModuleGate;
pub use stats::{StatsReader, StatsSnapshot};
pub use swap::SwapController;
pub use swaps::SwapEntry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

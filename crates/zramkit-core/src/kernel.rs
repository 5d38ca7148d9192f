//! Kernel surfaces consumed by the manager
//!
//! Everything that touches the zram module, `/sys/class/zram-control`,
//! `/sys/block/zramN` or `/proc/swaps` goes through [`ZramKernel`], so the
//! components above can be exercised against an in-memory kernel.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::command::CommandRunner;
use crate::config::ManagerConfig;
use crate::error::{Result, ZramError};
use crate::sysfs::{parse_u64_attr, poll_backoff, read_sysfs_file, write_sysfs_file};

/// Per-device sysfs attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    DiskSize,
    CompAlgorithm,
    MaxCompStreams,
    Reset,
    Stat,
    MmStat,
}

impl Attr {
    pub fn file_name(&self) -> &'static str {
        match self {
            Attr::DiskSize => "disksize",
            Attr::CompAlgorithm => "comp_algorithm",
            Attr::MaxCompStreams => "max_comp_streams",
            Attr::Reset => "reset",
            Attr::Stat => "stat",
            Attr::MmStat => "mm_stat",
        }
    }
}

/// Low-level zram primitives
pub trait ZramKernel: Send + Sync {
    /// Whether the zram module is currently present
    fn module_loaded(&self) -> bool;

    /// Load the zram module without pre-created devices
    fn load_module(&self) -> Result<()>;

    fn unload_module(&self) -> Result<()>;

    /// Ask the kernel for a new device slot; returns its index
    fn hot_add(&self) -> Result<u32>;

    fn hot_remove(&self, index: u32) -> Result<()>;

    fn read_attr(&self, index: u32, attr: Attr) -> Result<String>;

    fn write_attr(&self, index: u32, attr: Attr, value: &str) -> Result<()>;

    /// Indices of every zram device the kernel currently exposes
    fn devices(&self) -> Result<Vec<u32>>;

    /// Raw contents of the swap listing
    fn swap_listing(&self) -> Result<String>;

    /// Block device node for a device index
    fn device_node(&self, index: u32) -> PathBuf;

    /// Reset the device to the unconfigured state, dropping its data
    fn reset(&self, index: u32) -> Result<()> {
        self.write_attr(index, Attr::Reset, "1")
    }

    fn disk_size(&self, index: u32) -> Result<u64> {
        let content = self.read_attr(index, Attr::DiskSize)?;
        parse_u64_attr("disksize", &content)
    }
}

/// Parse a block device name of the form `zramN`
pub fn parse_device_name(name: &str) -> Option<u32> {
    static DEVICE_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DEVICE_NAME
        .get_or_init(|| Regex::new(r"^zram(\d+)$").ok())
        .as_ref()?;
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

/// The real kernel, reached through sysfs and `modprobe`
pub struct SysfsKernel {
    sys_root: PathBuf,
    dev_root: PathBuf,
    proc_swaps: PathBuf,
    modprobe: String,
    runner: Arc<dyn CommandRunner>,
}

impl SysfsKernel {
    pub fn new(config: &ManagerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            sys_root: config.sys_root.clone(),
            dev_root: config.dev_root.clone(),
            proc_swaps: config.proc_swaps.clone(),
            modprobe: config.tools.modprobe.clone(),
            runner,
        }
    }

    fn control_dir(&self) -> PathBuf {
        self.sys_root.join("class").join("zram-control")
    }

    fn block_dir(&self, index: u32) -> PathBuf {
        self.sys_root.join("block").join(format!("zram{}", index))
    }

    fn run_modprobe(&self, args: &[&str]) -> Result<()> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self
            .runner
            .run(&self.modprobe, &args, None)
            .map_err(|e| ZramError::Module(format!("Failed to execute {}: {}", self.modprobe, e)))?;

        if !output.success {
            return Err(ZramError::Module(format!(
                "{} {} failed: {}",
                self.modprobe,
                args.join(" "),
                output.failure_message()
            )));
        }
        Ok(())
    }
}

impl ZramKernel for SysfsKernel {
    fn module_loaded(&self) -> bool {
        self.sys_root.join("module").join("zram").exists() || self.control_dir().exists()
    }

    fn load_module(&self) -> Result<()> {
        self.run_modprobe(&["zram", "num_devices=0"])?;

        // udev may lag behind modprobe on slow machines
        let control = self.control_dir();
        if !poll_backoff(&[1, 2, 4, 8, 16, 32, 64, 128, 256, 512], || control.exists()) {
            return Err(ZramError::Module(format!(
                "{} did not appear after loading zram",
                control.display()
            )));
        }

        info!("zram module loaded");
        Ok(())
    }

    fn unload_module(&self) -> Result<()> {
        self.run_modprobe(&["-r", "zram"])?;
        info!("zram module unloaded");
        Ok(())
    }

    fn hot_add(&self) -> Result<u32> {
        let path = self.control_dir().join("hot_add");
        if !path.exists() {
            return Err(ZramError::Module(
                "zram-control not available, is zram module loaded?".to_string(),
            ));
        }

        // Reading hot_add allocates the device and returns its number
        let content = read_sysfs_file(&path)?;
        let index = parse_u64_attr("hot_add", &content)?;
        u32::try_from(index)
            .map_err(|_| ZramError::Parse(format!("Device index out of range: {}", index)))
    }

    fn hot_remove(&self, index: u32) -> Result<()> {
        let path = self.control_dir().join("hot_remove");
        debug!("hot_remove zram{}", index);
        write_sysfs_file(&path, &index.to_string())
    }

    fn read_attr(&self, index: u32, attr: Attr) -> Result<String> {
        read_sysfs_file(&self.block_dir(index).join(attr.file_name()))
    }

    fn write_attr(&self, index: u32, attr: Attr, value: &str) -> Result<()> {
        debug!("zram{}/{} <- {}", index, attr.file_name(), value);
        write_sysfs_file(&self.block_dir(index).join(attr.file_name()), value)
    }

    fn devices(&self) -> Result<Vec<u32>> {
        let block = self.sys_root.join("block");
        let mut indices = Vec::new();

        for entry in fs::read_dir(&block)? {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_device_name) {
                indices.push(index);
            }
        }

        indices.sort_unstable();
        Ok(indices)
    }

    fn swap_listing(&self) -> Result<String> {
        read_sysfs_file(&self.proc_swaps)
    }

    fn device_node(&self, index: u32) -> PathBuf {
        self.dev_root.join(format!("zram{}", index))
    }
}

/// Whether a sysfs tree looks like it belongs to a zram-capable kernel
pub fn zram_supported(sys_root: &Path) -> bool {
    sys_root.join("module").join("zram").exists()
        || sys_root.join("class").join("zram-control").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SystemCommandRunner;

    #[test]
    fn test_attr_file_names() {
        assert_eq!(Attr::DiskSize.file_name(), "disksize");
        assert_eq!(Attr::CompAlgorithm.file_name(), "comp_algorithm");
        assert_eq!(Attr::MaxCompStreams.file_name(), "max_comp_streams");
        assert_eq!(Attr::Reset.file_name(), "reset");
        assert_eq!(Attr::Stat.file_name(), "stat");
        assert_eq!(Attr::MmStat.file_name(), "mm_stat");
    }

    #[test]
    fn test_parse_device_name() {
        assert_eq!(parse_device_name("zram0"), Some(0));
        assert_eq!(parse_device_name("zram15"), Some(15));
        assert_eq!(parse_device_name("zram"), None);
        assert_eq!(parse_device_name("zram0p1"), None);
        assert_eq!(parse_device_name("sda"), None);
    }

    #[test]
    fn test_sysfs_kernel_paths() {
        let config = ManagerConfig {
            sys_root: PathBuf::from("/tmp/fake-sys"),
            dev_root: PathBuf::from("/tmp/fake-dev"),
            ..Default::default()
        };
        let kernel = SysfsKernel::new(&config, Arc::new(SystemCommandRunner::new()));

        assert_eq!(kernel.device_node(3), PathBuf::from("/tmp/fake-dev/zram3"));
        assert_eq!(
            kernel.block_dir(3),
            PathBuf::from("/tmp/fake-sys/block/zram3")
        );
        assert_eq!(
            kernel.control_dir(),
            PathBuf::from("/tmp/fake-sys/class/zram-control")
        );
    }

    #[test]
    fn test_attributes_on_a_plain_directory_tree() {
        let root = std::env::temp_dir().join(format!("zramkit-kernel-{}", std::process::id()));
        let block = root.join("block").join("zram7");
        fs::create_dir_all(&block).unwrap();
        fs::create_dir_all(root.join("block").join("sda")).unwrap();
        fs::write(block.join("disksize"), "10485760\n").unwrap();

        let config = ManagerConfig {
            sys_root: root.clone(),
            ..Default::default()
        };
        let kernel = SysfsKernel::new(&config, Arc::new(SystemCommandRunner::new()));

        assert_eq!(kernel.devices().unwrap(), vec![7]);
        assert_eq!(kernel.disk_size(7).unwrap(), 10485760);

        kernel.write_attr(7, Attr::MaxCompStreams, "2").unwrap();
        assert_eq!(
            fs::read_to_string(block.join("max_comp_streams")).unwrap(),
            "2"
        );

        // No zram-control directory: hot_add must refuse
        assert!(matches!(kernel.hot_add(), Err(ZramError::Module(_))));
        assert!(!zram_supported(&root));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    #[ignore = "requires root and zram module"]
    fn test_real_module_presence() {
        let config = ManagerConfig::default();
        let kernel = SysfsKernel::new(&config, Arc::new(SystemCommandRunner::new()));
        println!("zram loaded: {}", kernel.module_loaded());
    }
}

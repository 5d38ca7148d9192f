//! In-memory kernel and swap tooling for tests
//!
//! [`FakeSystem`] implements both [`ZramKernel`] and [`CommandRunner`], so the
//! swap state changed by `mkswap`/`swapon`/`swapoff` is visible through the
//! swap listing exactly as it would be on a real machine. Failure injection
//! helpers let tests drive rollback and reconciliation paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::command::{CommandOutput, CommandRunner};
use crate::error::{Result, ZramError};
use crate::kernel::{parse_device_name, Attr, ZramKernel};

#[derive(Debug, Clone)]
struct FakeDevice {
    disk_size: u64,
    algorithm: String,
    streams: u32,
    reads: u64,
    writes: u64,
    orig: u64,
    compr: u64,
    formatted: bool,
    swap_label: Option<String>,
    stat_override: Option<String>,
    mm_stat_override: Option<String>,
}

impl FakeDevice {
    fn new(algorithm: &str) -> Self {
        Self {
            disk_size: 0,
            algorithm: algorithm.to_string(),
            streams: 1,
            reads: 0,
            writes: 0,
            orig: 0,
            compr: 0,
            formatted: false,
            swap_label: None,
            stat_override: None,
            mm_stat_override: None,
        }
    }
}

#[derive(Debug)]
struct FakeState {
    zram_supported: bool,
    module_loaded: bool,
    loads: usize,
    unloads: usize,
    devices: BTreeMap<u32, FakeDevice>,
    swaps: Vec<(PathBuf, i32)>,
    algorithms: Vec<String>,
    hot_adds: usize,
    fail_hot_add_after: Option<usize>,
    failing_writes: HashSet<Attr>,
    failing_commands: HashSet<String>,
    /// program -> whether the command still takes effect before timing out
    timed_out_commands: HashMap<String, bool>,
    busy: HashSet<u32>,
    commands: Vec<String>,
}

/// Simulated zram kernel plus swap utilities
#[derive(Debug)]
pub struct FakeSystem {
    dev_root: PathBuf,
    state: Mutex<FakeState>,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dev_root: PathBuf::from("/dev"),
            state: Mutex::new(FakeState {
                zram_supported: true,
                module_loaded: false,
                loads: 0,
                unloads: 0,
                devices: BTreeMap::new(),
                swaps: Vec::new(),
                algorithms: ["lzo", "lzo-rle", "lz4", "zstd"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                hot_adds: 0,
                fail_hot_add_after: None,
                failing_writes: HashSet::new(),
                failing_commands: HashSet::new(),
                timed_out_commands: HashMap::new(),
                busy: HashSet::new(),
                commands: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_zram_supported(&self, supported: bool) {
        self.lock().zram_supported = supported;
    }

    pub fn set_module_loaded(&self, loaded: bool) {
        self.lock().module_loaded = loaded;
    }

    pub fn module_loads(&self) -> usize {
        self.lock().loads
    }

    pub fn module_unloads(&self) -> usize {
        self.lock().unloads
    }

    /// Make the hot-add after `n` successful ones fail
    pub fn fail_hot_add_after(&self, n: usize) {
        let mut state = self.lock();
        let done = state.hot_adds;
        state.fail_hot_add_after = Some(done + n);
    }

    pub fn fail_write(&self, attr: Attr) {
        self.lock().failing_writes.insert(attr);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_hot_add_after = None;
        state.failing_writes.clear();
        state.failing_commands.clear();
        state.timed_out_commands.clear();
        state.busy.clear();
    }

    /// Make every run of `program` exit non-zero
    pub fn fail_command(&self, program: &str) {
        self.lock().failing_commands.insert(program.to_string());
    }

    /// Make `program` time out; with `takes_effect` the command still
    /// completes its work before the caller gives up on it
    pub fn time_out_command(&self, program: &str, takes_effect: bool) {
        self.lock()
            .timed_out_commands
            .insert(program.to_string(), takes_effect);
    }

    /// Make reset and hot_remove of a device fail with EBUSY
    pub fn set_busy(&self, index: u32) {
        self.lock().busy.insert(index);
    }

    /// Pre-create a device as if another agent had set it up
    pub fn add_foreign_device(&self, disk_size: u64, streams: u32) -> u32 {
        let mut state = self.lock();
        state.module_loaded = true;
        let index = lowest_free(&state.devices);
        let mut device = FakeDevice::new("lzo-rle");
        device.disk_size = disk_size;
        device.streams = streams;
        state.devices.insert(index, device);
        index
    }

    /// Account I/O against a device
    pub fn simulate_io(&self, index: u32, reads: u64, writes: u64, orig: u64, compr: u64) {
        if let Some(dev) = self.lock().devices.get_mut(&index) {
            dev.reads += reads;
            dev.writes += writes;
            dev.orig = orig;
            dev.compr = compr;
        }
    }

    /// Replace the raw `stat` record of a device
    pub fn set_stat_override(&self, index: u32, content: &str) {
        if let Some(dev) = self.lock().devices.get_mut(&index) {
            dev.stat_override = Some(content.to_string());
        }
    }

    /// Replace the raw `mm_stat` record of a device
    pub fn set_mm_stat_override(&self, index: u32, content: &str) {
        if let Some(dev) = self.lock().devices.get_mut(&index) {
            dev.mm_stat_override = Some(content.to_string());
        }
    }

    /// Another agent runs `swapoff` on a path
    pub fn external_swapoff(&self, path: &Path) {
        self.lock().swaps.retain(|(p, _)| p != path);
    }

    /// Another agent runs `swapon` on a formatted device
    pub fn external_swapon(&self, path: &Path, priority: i32) {
        self.lock().swaps.push((path.to_path_buf(), priority));
    }

    pub fn kernel_devices(&self) -> Vec<u32> {
        self.lock().devices.keys().copied().collect()
    }

    pub fn device_disk_size(&self, index: u32) -> Option<u64> {
        self.lock().devices.get(&index).map(|d| d.disk_size)
    }

    pub fn device_streams(&self, index: u32) -> Option<u32> {
        self.lock().devices.get(&index).map(|d| d.streams)
    }

    pub fn device_algorithm(&self, index: u32) -> Option<String> {
        self.lock().devices.get(&index).map(|d| d.algorithm.clone())
    }

    pub fn swap_paths(&self) -> Vec<PathBuf> {
        self.lock().swaps.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn swap_priority(&self, path: &Path) -> Option<i32> {
        self.lock()
            .swaps
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, prio)| *prio)
    }

    /// Every external command run so far, as a single line each
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn index_of(&self, path: &str) -> Option<u32> {
        Path::new(path)
            .strip_prefix(&self.dev_root)
            .ok()
            .and_then(|p| p.to_str())
            .and_then(parse_device_name)
    }
}

fn lowest_free(devices: &BTreeMap<u32, FakeDevice>) -> u32 {
    let mut index = 0;
    while devices.contains_key(&index) {
        index += 1;
    }
    index
}

fn busy_error(what: &str) -> ZramError {
    ZramError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{}: Device or resource busy", what),
    ))
}

fn failed(program: &str, message: String) -> CommandOutput {
    CommandOutput {
        success: false,
        code: Some(1),
        stdout: String::new(),
        stderr: format!("{}: {}\n", program, message),
    }
}

fn succeeded() -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        ..Default::default()
    }
}

impl ZramKernel for FakeSystem {
    fn module_loaded(&self) -> bool {
        self.lock().module_loaded
    }

    fn load_module(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.zram_supported {
            return Err(ZramError::Module(
                "modprobe: FATAL: Module zram not found".to_string(),
            ));
        }
        state.module_loaded = true;
        state.loads += 1;
        Ok(())
    }

    fn unload_module(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.swaps.is_empty() {
            return Err(ZramError::Module(
                "modprobe: FATAL: Module zram is in use".to_string(),
            ));
        }
        state.module_loaded = false;
        state.devices.clear();
        state.unloads += 1;
        Ok(())
    }

    fn hot_add(&self) -> Result<u32> {
        let mut state = self.lock();
        if !state.module_loaded {
            return Err(ZramError::Module(
                "zram-control not available, is zram module loaded?".to_string(),
            ));
        }
        if let Some(limit) = state.fail_hot_add_after {
            if state.hot_adds >= limit {
                return Err(ZramError::Io(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "hot_add: Cannot allocate memory",
                )));
            }
        }

        let index = lowest_free(&state.devices);
        state.devices.insert(index, FakeDevice::new("lzo-rle"));
        state.hot_adds += 1;
        Ok(index)
    }

    fn hot_remove(&self, index: u32) -> Result<()> {
        let node = self.device_node(index);
        let mut state = self.lock();
        if !state.devices.contains_key(&index) {
            return Err(ZramError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("hot_remove: no zram{}", index),
            )));
        }
        if state.busy.contains(&index) || state.swaps.iter().any(|(p, _)| *p == node) {
            return Err(busy_error("hot_remove"));
        }
        state.devices.remove(&index);
        Ok(())
    }

    fn read_attr(&self, index: u32, attr: Attr) -> Result<String> {
        let state = self.lock();
        let dev = state.devices.get(&index).ok_or_else(|| {
            ZramError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("/sys/block/zram{}/{}", index, attr.file_name()),
            ))
        })?;

        let content = match attr {
            Attr::DiskSize => format!("{}\n", dev.disk_size),
            Attr::MaxCompStreams => format!("{}\n", dev.streams),
            Attr::CompAlgorithm => {
                let listed: Vec<String> = state
                    .algorithms
                    .iter()
                    .map(|a| {
                        if *a == dev.algorithm {
                            format!("[{}]", a)
                        } else {
                            a.clone()
                        }
                    })
                    .collect();
                format!("{}\n", listed.join(" "))
            }
            Attr::Stat => dev.stat_override.clone().unwrap_or_else(|| {
                format!(
                    "{:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
                    dev.reads,
                    0,
                    dev.reads * 8,
                    0,
                    dev.writes,
                    0,
                    dev.writes * 8,
                    0,
                    0,
                    0,
                    0
                )
            }),
            Attr::MmStat => dev.mm_stat_override.clone().unwrap_or_else(|| {
                format!(
                    "{:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
                    dev.orig, dev.compr, dev.compr, 0, dev.compr, 0, 0
                )
            }),
            Attr::Reset => {
                return Err(ZramError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "reset is write-only",
                )))
            }
        };

        Ok(content)
    }

    fn write_attr(&self, index: u32, attr: Attr, value: &str) -> Result<()> {
        let node = self.device_node(index);
        let mut state = self.lock();
        if state.failing_writes.contains(&attr) {
            return Err(ZramError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: Input/output error", attr.file_name()),
            )));
        }

        let in_swap = state.swaps.iter().any(|(p, _)| *p == node);
        let is_busy = state.busy.contains(&index);
        let algorithms = state.algorithms.clone();
        let dev = state.devices.get_mut(&index).ok_or_else(|| {
            ZramError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("/sys/block/zram{}/{}", index, attr.file_name()),
            ))
        })?;

        let invalid = |what: &str| {
            ZramError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: Invalid argument", what),
            ))
        };

        match attr {
            Attr::DiskSize => {
                if dev.disk_size > 0 {
                    return Err(busy_error("disksize"));
                }
                dev.disk_size = value.trim().parse().map_err(|_| invalid("disksize"))?;
            }
            Attr::CompAlgorithm => {
                if dev.disk_size > 0 {
                    return Err(busy_error("comp_algorithm"));
                }
                let name = value.trim();
                if !algorithms.iter().any(|a| a == name) {
                    return Err(invalid("comp_algorithm"));
                }
                dev.algorithm = name.to_string();
            }
            Attr::MaxCompStreams => {
                dev.streams = value.trim().parse().map_err(|_| invalid("max_comp_streams"))?;
            }
            Attr::Reset => {
                if in_swap || is_busy {
                    return Err(busy_error("reset"));
                }
                let algorithm = dev.algorithm.clone();
                *dev = FakeDevice::new(&algorithm);
            }
            Attr::Stat | Attr::MmStat => {
                return Err(ZramError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is read-only", attr.file_name()),
                )))
            }
        }

        Ok(())
    }

    fn devices(&self) -> Result<Vec<u32>> {
        Ok(self.kernel_devices())
    }

    fn swap_listing(&self) -> Result<String> {
        let state = self.lock();
        let mut listing = String::from("Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n");
        for (path, priority) in &state.swaps {
            let size_kib = self
                .index_of(&path.display().to_string())
                .and_then(|i| state.devices.get(&i))
                .map(|d| d.disk_size / 1024)
                .unwrap_or(0);
            listing.push_str(&format!(
                "{:<40}partition\t{}\t\t0\t\t{}\n",
                path.display(),
                size_kib.saturating_sub(4),
                priority
            ));
        }
        Ok(listing)
    }

    fn device_node(&self, index: u32) -> PathBuf {
        self.dev_root.join(format!("zram{}", index))
    }
}

impl CommandRunner for FakeSystem {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> io::Result<CommandOutput> {
        let name = Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program)
            .to_string();

        let timed_out = {
            let mut state = self.lock();
            state
                .commands
                .push(format!("{} {}", name, args.join(" ")).trim().to_string());
            if state.failing_commands.contains(&name) {
                return Ok(failed(&name, "simulated failure".to_string()));
            }
            state.timed_out_commands.get(&name).copied()
        };

        let timeout_error = || {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not finish in time", name),
            )
        };

        if timed_out == Some(false) {
            return Err(timeout_error());
        }

        let output = match name.as_str() {
            "mkswap" => self.fake_mkswap(args),
            "swapon" => self.fake_swapon(args),
            "swapoff" => self.fake_swapoff(args),
            other => failed(other, "command not found".to_string()),
        };

        if timed_out == Some(true) {
            return Err(timeout_error());
        }
        Ok(output)
    }
}

impl FakeSystem {
    /// Split `[-L label] [path]` out of an argument list, skipping `-p N`
    fn target_of(args: &[String]) -> (Option<String>, Option<String>, Option<i32>) {
        let mut label = None;
        let mut path = None;
        let mut priority = None;
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-L" => label = iter.next().cloned(),
                "-p" => priority = iter.next().and_then(|p| p.parse().ok()),
                other if other.starts_with('-') => {}
                other => path = Some(other.to_string()),
            }
        }

        (label, path, priority)
    }

    fn resolve(&self, state: &FakeState, label: Option<&str>, path: Option<&str>) -> Option<u32> {
        match (label, path) {
            (Some(label), _) => state
                .devices
                .iter()
                .find(|(_, d)| d.formatted && d.swap_label.as_deref() == Some(label))
                .map(|(i, _)| *i),
            (None, Some(path)) => self.index_of(path),
            (None, None) => None,
        }
    }

    fn fake_mkswap(&self, args: &[String]) -> CommandOutput {
        let (label, path, _) = Self::target_of(args);
        let mut state = self.lock();
        let index = match path.as_deref().and_then(|p| self.index_of(p)) {
            Some(i) => i,
            None => return failed("mkswap", format!("cannot open {:?}", path)),
        };
        let node = self.device_node(index);
        if state.swaps.iter().any(|(p, _)| *p == node) {
            return failed(
                "mkswap",
                format!("error: {} is mounted; will not make swapspace", node.display()),
            );
        }

        match state.devices.get_mut(&index) {
            Some(dev) if dev.disk_size >= 40 * 1024 => {
                dev.formatted = true;
                dev.swap_label = label;
                succeeded()
            }
            Some(_) => failed("mkswap", "error: swap area needs to be at least 40 KiB".to_string()),
            None => failed("mkswap", format!("cannot open {}", node.display())),
        }
    }

    fn fake_swapon(&self, args: &[String]) -> CommandOutput {
        let (label, path, priority) = Self::target_of(args);
        let mut state = self.lock();
        let index = match self.resolve(&state, label.as_deref(), path.as_deref()) {
            Some(i) => i,
            None => return failed("swapon", "cannot find the device".to_string()),
        };
        let node = self.device_node(index);

        match state.devices.get(&index) {
            Some(dev) if dev.formatted => {}
            _ => {
                return failed(
                    "swapon",
                    format!("{}: read swap header failed", node.display()),
                )
            }
        }
        if state.swaps.iter().any(|(p, _)| *p == node) {
            return failed(
                "swapon",
                format!("{}: swapon failed: Device or resource busy", node.display()),
            );
        }

        state.swaps.push((node, priority.unwrap_or(-2)));
        succeeded()
    }

    fn fake_swapoff(&self, args: &[String]) -> CommandOutput {
        let (label, path, _) = Self::target_of(args);
        let mut state = self.lock();
        let index = match self.resolve(&state, label.as_deref(), path.as_deref()) {
            Some(i) => i,
            None => return failed("swapoff", "cannot find the device".to_string()),
        };
        let node = self.device_node(index);

        if !state.swaps.iter().any(|(p, _)| *p == node) {
            return failed(
                "swapoff",
                format!("{}: swapoff failed: Invalid argument", node.display()),
            );
        }
        state.swaps.retain(|(p, _)| *p != node);
        succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_hot_add_reuses_lowest_index() {
        let system = FakeSystem::new();
        system.load_module().unwrap();

        assert_eq!(system.hot_add().unwrap(), 0);
        assert_eq!(system.hot_add().unwrap(), 1);
        system.hot_remove(0).unwrap();
        assert_eq!(system.hot_add().unwrap(), 0);
    }

    #[test]
    fn test_fake_disksize_is_one_shot() {
        let system = FakeSystem::new();
        system.load_module().unwrap();
        let index = system.hot_add().unwrap();

        system.write_attr(index, Attr::DiskSize, "1048576").unwrap();
        assert!(system.write_attr(index, Attr::DiskSize, "2097152").is_err());
        assert!(system.write_attr(index, Attr::CompAlgorithm, "zstd").is_err());

        system.reset(index).unwrap();
        system.write_attr(index, Attr::DiskSize, "2097152").unwrap();
        assert_eq!(system.device_disk_size(index), Some(2097152));
    }

    #[test]
    fn test_fake_swap_tools() {
        let system = FakeSystem::new();
        system.load_module().unwrap();
        let index = system.hot_add().unwrap();
        system.write_attr(index, Attr::DiskSize, "10485760").unwrap();

        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(system.run("mkswap", &args(&["-L", "zram", "/dev/zram0"]), None).unwrap().success);
        assert!(system.run("swapon", &args(&["-p", "5", "-L", "zram"]), None).unwrap().success);
        assert_eq!(system.swap_priority(Path::new("/dev/zram0")), Some(5));

        assert!(!system.run("swapon", &args(&["-p", "5", "/dev/zram0"]), None).unwrap().success);
        assert!(system.run("swapoff", &args(&["-L", "zram"]), None).unwrap().success);
        assert!(system.swap_paths().is_empty());
    }
}

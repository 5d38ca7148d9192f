//! Top-level orchestration of zram devices
//!
//! `ZramManager` owns the registry and composes the module gate, allocator,
//! configurator, swap controller and stats reader. The registry lock
//! serializes creation and guards entry removal during destruction. Swap
//! teardown and every other operation only hold the lock of the device they
//! work on.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::algorithm::CompAlgorithm;
use crate::allocator::{DestroyTarget, DeviceAllocator};
use crate::command::{CommandRunner, SystemCommandRunner};
use crate::config::ManagerConfig;
use crate::configurator::{DeviceConfig, DeviceConfigurator};
use crate::device::{SwapIdentity, ZramDevice};
use crate::error::{Result, ZramError};
use crate::kernel::{SysfsKernel, ZramKernel};
use crate::module_gate::ModuleGate;
use crate::registry::{DeviceSlot, Registry, SetId};
use crate::stats::StatsReader;
use crate::swap::SwapController;
use crate::swaps::{is_listed, SwapEntry};

/// Set id of devices imported by [`ZramManager::adopt_existing`]; holds no
/// module reference
const ADOPTED_SET: SetId = 0;

pub struct ZramManager {
    kernel: Arc<dyn ZramKernel>,
    gate: ModuleGate,
    allocator: DeviceAllocator,
    configurator: Arc<DeviceConfigurator>,
    swap: Arc<SwapController>,
    stats: StatsReader,
    registry: Mutex<Registry>,
    /// Serializes labeled activations so two devices cannot claim one label
    label_lock: Mutex<()>,
    next_set: AtomicU64,
    default_algorithm: Option<String>,
    swap_timeout: Option<Duration>,
}

impl ZramManager {
    pub fn new(
        kernel: Arc<dyn ZramKernel>,
        runner: Arc<dyn CommandRunner>,
        config: &ManagerConfig,
    ) -> Self {
        let configurator = Arc::new(DeviceConfigurator::new(kernel.clone()));
        let swap = Arc::new(SwapController::new(
            kernel.clone(),
            runner,
            config.tools.clone(),
        ));

        Self {
            gate: ModuleGate::new(kernel.clone()),
            allocator: DeviceAllocator::new(kernel.clone(), configurator.clone(), swap.clone()),
            stats: StatsReader::new(kernel.clone()),
            kernel,
            configurator,
            swap,
            registry: Mutex::new(Registry::new()),
            label_lock: Mutex::new(()),
            next_set: AtomicU64::new(ADOPTED_SET + 1),
            default_algorithm: config.default_algorithm.clone(),
            swap_timeout: config.swap_timeout(),
        }
    }

    /// Manager talking to the real kernel and system tools
    pub fn from_config(config: &ManagerConfig) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
        let kernel = Arc::new(SysfsKernel::new(config, runner.clone()));
        Self::new(kernel, runner, config)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: u32) -> Result<Arc<DeviceSlot>> {
        self.lock_registry().get(id).ok_or(ZramError::NotFound(id))
    }

    /// Run `f` on a registered device under its write lock
    fn with_device<T>(&self, id: u32, f: impl FnOnce(&mut ZramDevice) -> Result<T>) -> Result<T> {
        let slot = self.slot(id)?;
        let mut guard = slot.write();
        let device = guard.as_mut().ok_or(ZramError::NotFound(id))?;
        f(device)
    }

    /// Create one device per `(size, streams)` pair, all or nothing
    pub fn create_devices(&self, sizes: &[u64], stream_counts: &[u32]) -> Result<Vec<u32>> {
        let configs =
            DeviceAllocator::plan(sizes, stream_counts, self.default_algorithm.as_deref())?;
        self.create_configured(configs)
    }

    /// Like [`create_devices`](Self::create_devices) with a full config per
    /// device. The default algorithm fills in where none is given.
    pub fn create_configured(&self, mut configs: Vec<DeviceConfig>) -> Result<Vec<u32>> {
        DeviceAllocator::validate(&configs)?;
        if let Some(default) = &self.default_algorithm {
            for config in configs.iter_mut().filter(|c| c.algorithm.is_none()) {
                config.algorithm = Some(default.clone());
            }
        }

        let mut registry = self.lock_registry();
        self.gate.ensure_loaded()?;

        let devices = match self.allocator.allocate(&registry, &configs) {
            Ok(devices) => devices,
            Err(e) => {
                if let Err(release_err) = self.gate.release(registry.len()) {
                    warn!("failed to release zram module after rollback: {}", release_err);
                }
                return Err(e);
            }
        };

        let set_id = self.next_set.fetch_add(1, Ordering::Relaxed);
        let mut ids = Vec::with_capacity(devices.len());
        for device in devices {
            ids.push(device.index());
            registry.insert(DeviceSlot::new(device, set_id))?;
        }

        info!("created device set {}: {:?}", set_id, ids);
        Ok(ids)
    }

    /// Destroy the targeted devices.
    ///
    /// Best-effort: the returned list holds every device that could not be
    /// destroyed. The module is released once per emptied device set; a
    /// failure to unload it is logged and does not change the result.
    pub fn destroy_devices(&self, target: DestroyTarget) -> Result<Vec<(u32, ZramError)>> {
        let outcome = self.allocator.destroy(&self.registry, &target);

        let registry = self.lock_registry();
        for set_id in &outcome.emptied_sets {
            if *set_id == ADOPTED_SET {
                continue;
            }
            if let Err(e) = self.gate.release(registry.len()) {
                warn!("failed to release zram module after destroy: {}", e);
            }
        }
        if target == DestroyTarget::All && registry.is_empty() {
            if let Err(e) = self.gate.release_all(0) {
                warn!("failed to unload zram module: {}", e);
            }
        }
        drop(registry);

        if !outcome.failures.is_empty() {
            warn!(
                "{} device(s) could not be destroyed",
                outcome.failures.len()
            );
        }
        Ok(outcome.failures)
    }

    /// Format the device as swap and enable it at `priority`
    pub fn activate(&self, id: u32, priority: i32) -> Result<()> {
        self.activate_with_timeout(id, priority, None, self.swap_timeout)
    }

    /// Activate with a swap label; the label alone is enough to disable it
    pub fn activate_labeled(&self, id: u32, priority: i32, label: &str) -> Result<()> {
        self.activate_with_timeout(id, priority, Some(label), self.swap_timeout)
    }

    pub fn activate_with_timeout(
        &self,
        id: u32,
        priority: i32,
        label: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let label = match label {
            Some(label) => label,
            None => {
                return self.with_device(id, |device| {
                    self.swap.activate(device, priority, None, timeout)
                })
            }
        };

        let _claim = self.label_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(holder) = self.label_holder(label, id) {
            return Err(ZramError::swap(
                format!("LABEL={}", label),
                format!("label already in use by active zram{}", holder),
            ));
        }
        self.with_device(id, |device| {
            self.swap.activate(device, priority, Some(label), timeout)
        })
    }

    /// Another registered device that is active under `label`
    fn label_holder(&self, label: &str, except: u32) -> Option<u32> {
        let slots: Vec<_> = self.lock_registry().slots().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.index() != except)
            .find(|slot| {
                slot.read()
                    .as_ref()
                    .map_or(false, |d| d.is_active() && d.label() == Some(label))
            })
            .map(|slot| slot.index())
    }

    /// Disable swap on the device; a no-op when it is not active
    pub fn deactivate(&self, id: u32) -> Result<()> {
        self.with_device(id, |device| self.swap.deactivate(device, self.swap_timeout))
    }

    /// Re-read counters and swap state from the kernel
    pub fn refresh(&self, id: u32) -> Result<ZramDevice> {
        self.with_device(id, |device| {
            let snapshot = self.stats.refresh(id)?;
            self.swap.reconcile(device)?;
            device.stats = snapshot;
            device.last_refresh = Some(Utc::now());
            debug!(
                "zram{}: reads={} writes={} orig={} compr={}",
                id,
                snapshot.num_reads,
                snapshot.num_writes,
                snapshot.orig_data_size,
                snapshot.compr_data_size
            );
            Ok(device.clone())
        })
    }

    /// Snapshot of one device
    pub fn device(&self, id: u32) -> Result<ZramDevice> {
        let slot = self.slot(id)?;
        let guard = slot.read();
        guard.clone().ok_or(ZramError::NotFound(id))
    }

    /// Snapshots of every registered device in creation order
    pub fn devices(&self) -> Vec<ZramDevice> {
        let slots: Vec<_> = self.lock_registry().slots().cloned().collect();
        slots.iter().filter_map(|slot| slot.read().clone()).collect()
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.lock_registry().indices()
    }

    pub fn module_ref_count(&self) -> usize {
        self.gate.ref_count()
    }

    /// Selected and supported compression algorithms of a device
    pub fn algorithms(&self, id: u32) -> Result<CompAlgorithm> {
        self.slot(id)?;
        self.configurator.algorithms(id)
    }

    /// Current kernel swap listing
    pub fn swaps(&self) -> Result<Vec<SwapEntry>> {
        self.swap.swaps()
    }

    /// Register zram devices that exist in the kernel but not here.
    ///
    /// Adopted devices take no module reference, so destroying them never
    /// unloads the module.
    pub fn adopt_existing(&self) -> Result<Vec<u32>> {
        let mut registry = self.lock_registry();
        if !self.kernel.module_loaded() {
            return Ok(Vec::new());
        }

        let listing = self.swap.swaps()?;
        let mut adopted = Vec::new();

        for index in self.kernel.devices()? {
            if registry.contains(index) {
                continue;
            }

            let mut device = ZramDevice::new(index, self.kernel.device_node(index));
            self.configurator.load_attributes(&mut device)?;
            if is_listed(&listing, device.device_node()) {
                device.mark_active(SwapIdentity::Path(device.device_node().to_path_buf()));
            }
            device.stats = self.stats.refresh(index)?;
            device.last_refresh = Some(Utc::now());

            registry.insert(DeviceSlot::new(device, ADOPTED_SET))?;
            adopted.push(index);
        }

        if !adopted.is_empty() {
            info!("adopted existing zram device(s): {:?}", adopted);
        }
        Ok(adopted)
    }
}

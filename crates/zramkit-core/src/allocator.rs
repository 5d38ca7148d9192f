//! Device slot allocation and teardown
//!
//! The kernel only hands out one device per `hot_add`. A batch is made to
//! look atomic by journaling every side effect and reversing the journal when
//! any step fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::configurator::{DeviceConfig, DeviceConfigurator};
use crate::device::ZramDevice;
use crate::error::{Result, ZramError};
use crate::kernel::ZramKernel;
use crate::registry::{Registry, SetId};
use crate::swap::SwapController;

/// Which devices a destroy request covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyTarget {
    All,
    Devices(Vec<u32>),
}

/// Result of a best-effort teardown
#[derive(Debug, Default)]
pub struct DestroyOutcome {
    /// Devices that could not be destroyed, with the reason
    pub failures: Vec<(u32, ZramError)>,
    /// Device sets with no remaining registered member
    pub emptied_sets: Vec<SetId>,
    pub destroyed: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideEffect {
    HotAdded(u32),
    Configured(u32),
}

/// Journal of kernel side effects performed by one batch
struct Rollback {
    kernel: Arc<dyn ZramKernel>,
    journal: Vec<SideEffect>,
}

impl Rollback {
    fn new(kernel: Arc<dyn ZramKernel>) -> Self {
        Self {
            kernel,
            journal: Vec::new(),
        }
    }

    fn record(&mut self, effect: SideEffect) {
        self.journal.push(effect);
    }

    /// Reverse every recorded effect, newest first; failures are logged
    fn unwind(self) {
        for effect in self.journal.iter().rev() {
            let result = match *effect {
                SideEffect::Configured(index) => self.kernel.reset(index),
                SideEffect::HotAdded(index) => self.kernel.hot_remove(index),
            };
            match result {
                Ok(()) => debug!("rolled back {:?}", effect),
                Err(e) => warn!("rollback of {:?} failed: {}", effect, e),
            }
        }
    }
}

/// Requests device slots from the kernel and gives them back
pub struct DeviceAllocator {
    kernel: Arc<dyn ZramKernel>,
    configurator: Arc<DeviceConfigurator>,
    swap: Arc<SwapController>,
}

impl DeviceAllocator {
    pub fn new(
        kernel: Arc<dyn ZramKernel>,
        configurator: Arc<DeviceConfigurator>,
        swap: Arc<SwapController>,
    ) -> Self {
        Self {
            kernel,
            configurator,
            swap,
        }
    }

    /// Turn the parallel size/stream lists into per-device configs.
    ///
    /// Runs before any kernel interaction.
    pub fn plan(
        sizes: &[u64],
        stream_counts: &[u32],
        algorithm: Option<&str>,
    ) -> Result<Vec<DeviceConfig>> {
        if sizes.is_empty() {
            return Err(ZramError::InvalidArgument(
                "at least one device size is required".to_string(),
            ));
        }
        if sizes.len() != stream_counts.len() {
            return Err(ZramError::InvalidArgument(format!(
                "{} sizes but {} stream counts",
                sizes.len(),
                stream_counts.len()
            )));
        }

        let configs = sizes
            .iter()
            .zip(stream_counts)
            .map(|(&size, &streams)| {
                let config = DeviceConfig::new(size).with_max_streams(streams);
                match algorithm {
                    Some(alg) => config.with_algorithm(alg),
                    None => config,
                }
            })
            .collect::<Vec<_>>();

        Self::validate(&configs)?;
        Ok(configs)
    }

    /// Reject a batch that could never be allocated
    pub fn validate(configs: &[DeviceConfig]) -> Result<()> {
        if configs.is_empty() {
            return Err(ZramError::InvalidArgument(
                "at least one device is required".to_string(),
            ));
        }

        for (position, config) in configs.iter().enumerate() {
            if config.size == 0 {
                return Err(ZramError::InvalidArgument(format!(
                    "size at position {} must be > 0",
                    position
                )));
            }
            if config.max_streams == Some(0) {
                return Err(ZramError::InvalidArgument(format!(
                    "stream count at position {} must be >= 1",
                    position
                )));
            }
        }
        Ok(())
    }

    /// Create and configure one device per config, all or nothing
    pub fn allocate(&self, registry: &Registry, configs: &[DeviceConfig]) -> Result<Vec<ZramDevice>> {
        let mut rollback = Rollback::new(self.kernel.clone());
        let mut devices = Vec::with_capacity(configs.len());

        for (position, config) in configs.iter().enumerate() {
            match self.allocate_one(registry, config, &mut rollback) {
                Ok(device) => devices.push(device),
                Err(cause) => {
                    warn!(
                        "allocation failed at position {}: {}, rolling back",
                        position, cause
                    );
                    rollback.unwind();
                    return Err(ZramError::Allocation {
                        failed_at: position,
                        cause: Box::new(cause),
                    });
                }
            }
        }

        info!("allocated {} zram device(s)", devices.len());
        Ok(devices)
    }

    fn allocate_one(
        &self,
        registry: &Registry,
        config: &DeviceConfig,
        rollback: &mut Rollback,
    ) -> Result<ZramDevice> {
        let index = self.kernel.hot_add()?;
        if registry.contains(index) {
            // The kernel handed out a live index; leave that device alone
            return Err(ZramError::InvalidArgument(format!(
                "kernel returned registered index zram{}",
                index
            )));
        }
        rollback.record(SideEffect::HotAdded(index));
        debug!("hot_add -> zram{}", index);

        let mut device = ZramDevice::new(index, self.kernel.device_node(index));
        rollback.record(SideEffect::Configured(index));
        self.configurator.configure(&mut device, config)?;
        Ok(device)
    }

    /// Tear down the targeted devices, continuing past failures.
    ///
    /// Swap teardown and reset run under the device's own lock only; the
    /// registry lock is taken for the lookup and again around `hot_remove`
    /// and the removal of the entry.
    pub fn destroy(&self, registry: &Mutex<Registry>, target: &DestroyTarget) -> DestroyOutcome {
        let mut outcome = DestroyOutcome::default();

        let slots = {
            let registry = lock(registry);
            match target {
                DestroyTarget::All => registry.slots().rev().cloned().collect::<Vec<_>>(),
                DestroyTarget::Devices(indices) => {
                    let mut slots = Vec::new();
                    for &index in indices {
                        match registry.get(index) {
                            Some(slot) => slots.push(slot),
                            None => outcome.failures.push((index, ZramError::NotFound(index))),
                        }
                    }
                    slots
                }
            }
        };

        for slot in slots {
            let index = slot.index();
            let mut guard = slot.write();

            let device = match guard.as_mut() {
                Some(device) => device,
                None => {
                    // Gone through a concurrent destroy
                    if let DestroyTarget::Devices(_) = target {
                        outcome.failures.push((index, ZramError::NotFound(index)));
                    }
                    continue;
                }
            };

            let result = self.release_swap(device).and_then(|()| {
                let mut registry = lock(registry);
                self.kernel.hot_remove(index)?;
                registry.remove(index);
                Ok(registry.set_members(slot.set_id()) == 0)
            });

            match result {
                Ok(set_emptied) => {
                    *guard = None;
                    outcome.destroyed.push(index);
                    if set_emptied && !outcome.emptied_sets.contains(&slot.set_id()) {
                        outcome.emptied_sets.push(slot.set_id());
                    }
                    info!("zram{} destroyed", index);
                }
                Err(e) => {
                    warn!("failed to destroy zram{}: {}", index, e);
                    outcome.failures.push((index, e));
                }
            }
        }

        outcome
    }

    fn release_swap(&self, device: &mut ZramDevice) -> Result<()> {
        self.swap.reconcile(device)?;
        self.swap.deactivate(device, None)?;
        self.configurator.reset(device)
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolPaths;
    use crate::kernel::Attr;
    use crate::registry::DeviceSlot;
    use crate::testing::FakeSystem;

    const MIB: u64 = 1024 * 1024;

    fn setup() -> (Arc<FakeSystem>, DeviceAllocator) {
        let system = FakeSystem::new();
        system.load_module().unwrap();
        let configurator = Arc::new(DeviceConfigurator::new(system.clone()));
        let swap = Arc::new(SwapController::new(
            system.clone(),
            system.clone(),
            ToolPaths::default(),
        ));
        (system.clone(), DeviceAllocator::new(system, configurator, swap))
    }

    fn register(registry: &Mutex<Registry>, devices: Vec<ZramDevice>, set_id: SetId) {
        let mut registry = registry.lock().unwrap();
        for device in devices {
            registry.insert(DeviceSlot::new(device, set_id)).unwrap();
        }
    }

    #[test]
    fn test_plan_validation() {
        assert!(DeviceAllocator::plan(&[], &[], None).is_err());
        assert!(DeviceAllocator::plan(&[MIB], &[1, 2], None).is_err());
        assert!(DeviceAllocator::plan(&[0], &[1], None).is_err());
        assert!(DeviceAllocator::plan(&[MIB], &[0], None).is_err());

        let plan = DeviceAllocator::plan(&[MIB, 2 * MIB], &[1, 2], Some("lz4")).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].size, 2 * MIB);
        assert_eq!(plan[1].max_streams, Some(2));
        assert_eq!(plan[0].algorithm.as_deref(), Some("lz4"));
    }

    #[test]
    fn test_allocate_batch() {
        let (system, allocator) = setup();
        let registry = Registry::new();
        let plan = DeviceAllocator::plan(&[10 * MIB, 10 * MIB], &[1, 2], None).unwrap();

        let devices = allocator.allocate(&registry, &plan).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].max_comp_streams(), 1);
        assert_eq!(devices[1].max_comp_streams(), 2);
        assert_eq!(system.kernel_devices(), vec![0, 1]);
    }

    #[test]
    fn test_allocate_rolls_back_on_hot_add_failure() {
        let (system, allocator) = setup();
        let registry = Registry::new();
        system.fail_hot_add_after(2);
        let plan = DeviceAllocator::plan(&[MIB, MIB, MIB], &[1, 1, 1], None).unwrap();

        let err = allocator.allocate(&registry, &plan).unwrap_err();

        match err {
            ZramError::Allocation { failed_at, .. } => assert_eq!(failed_at, 2),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(system.kernel_devices().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_allocate_rolls_back_on_configure_failure() {
        let (system, allocator) = setup();
        let registry = Registry::new();
        let plan = DeviceAllocator::plan(&[MIB, MIB], &[1, 1], Some("brotli")).unwrap();

        let err = allocator.allocate(&registry, &plan).unwrap_err();

        match err {
            ZramError::Allocation { failed_at, cause } => {
                assert_eq!(failed_at, 0);
                assert!(cause.to_string().contains("unsupported algorithm"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(system.kernel_devices().is_empty());
    }

    #[test]
    fn test_allocate_rolls_back_on_disksize_write_failure() {
        let (system, allocator) = setup();
        let registry = Registry::new();
        system.fail_write(Attr::DiskSize);
        let plan = DeviceAllocator::plan(&[MIB], &[2], None).unwrap();

        assert!(allocator.allocate(&registry, &plan).is_err());
        assert!(system.kernel_devices().is_empty());
    }

    #[test]
    fn test_destroy_all_in_reverse_order() {
        let (system, allocator) = setup();
        let registry = Mutex::new(Registry::new());
        let plan = DeviceAllocator::plan(&[MIB, MIB], &[1, 2], None).unwrap();
        let devices = allocator.allocate(&registry.lock().unwrap(), &plan).unwrap();
        register(&registry, devices, 1);

        let outcome = allocator.destroy(&registry, &DestroyTarget::All);

        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.destroyed, vec![1, 0]);
        assert_eq!(outcome.emptied_sets, vec![1]);
        assert!(registry.lock().unwrap().is_empty());
        assert!(system.kernel_devices().is_empty());
    }

    #[test]
    fn test_destroy_deactivates_active_devices() {
        let (system, allocator) = setup();
        let registry = Mutex::new(Registry::new());
        let plan = DeviceAllocator::plan(&[10 * MIB], &[1], None).unwrap();
        let mut devices = allocator.allocate(&registry.lock().unwrap(), &plan).unwrap();
        allocator
            .swap
            .activate(&mut devices[0], 1, Some("zram"), None)
            .unwrap();
        register(&registry, devices, 1);

        let outcome = allocator.destroy(&registry, &DestroyTarget::All);

        assert!(outcome.failures.is_empty());
        assert!(system.swap_paths().is_empty());
        assert!(system.commands().contains(&"swapoff -L zram".to_string()));
    }

    #[test]
    fn test_destroy_is_best_effort() {
        let (system, allocator) = setup();
        let registry = Mutex::new(Registry::new());
        let plan = DeviceAllocator::plan(&[MIB, MIB, MIB], &[1, 1, 1], None).unwrap();
        let devices = allocator.allocate(&registry.lock().unwrap(), &plan).unwrap();
        register(&registry, devices, 7);
        system.set_busy(1);

        let outcome = allocator.destroy(&registry, &DestroyTarget::All);

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].0, 1);
        assert_eq!(outcome.destroyed, vec![2, 0]);
        assert!(outcome.emptied_sets.is_empty());
        assert_eq!(registry.lock().unwrap().indices(), vec![1]);
    }

    #[test]
    fn test_destroy_unknown_and_empty_targets() {
        let (_system, allocator) = setup();
        let registry = Mutex::new(Registry::new());

        let outcome = allocator.destroy(&registry, &DestroyTarget::All);
        assert!(outcome.failures.is_empty());

        let outcome = allocator.destroy(&registry, &DestroyTarget::Devices(vec![]));
        assert!(outcome.failures.is_empty());

        let outcome = allocator.destroy(&registry, &DestroyTarget::Devices(vec![9]));
        assert!(matches!(outcome.failures[0], (9, ZramError::NotFound(9))));
    }
}

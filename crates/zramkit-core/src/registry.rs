//! Live device registry
//!
//! Each entry carries its own lock so independent devices can be worked on
//! concurrently; the registry itself sits behind the manager-wide lock.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::ZramDevice;
use crate::error::{Result, ZramError};

/// Identifier of the batch (or adoption) a device came from
pub type SetId = u64;

/// A registered device and its lock. `None` once destroyed.
#[derive(Debug)]
pub struct DeviceSlot {
    index: u32,
    set_id: SetId,
    device: RwLock<Option<ZramDevice>>,
}

impl DeviceSlot {
    pub fn new(device: ZramDevice, set_id: SetId) -> Self {
        Self {
            index: device.index(),
            set_id,
            device: RwLock::new(Some(device)),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_id(&self) -> SetId {
        self.set_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Option<ZramDevice>> {
        self.device.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Option<ZramDevice>> {
        self.device.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Devices in creation order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<Arc<DeviceSlot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.iter().any(|s| s.index() == index)
    }

    pub fn get(&self, index: u32) -> Option<Arc<DeviceSlot>> {
        self.entries.iter().find(|s| s.index() == index).cloned()
    }

    pub fn insert(&mut self, slot: DeviceSlot) -> Result<Arc<DeviceSlot>> {
        if self.contains(slot.index()) {
            return Err(ZramError::InvalidArgument(format!(
                "zram{} is already registered",
                slot.index()
            )));
        }
        let slot = Arc::new(slot);
        self.entries.push(slot.clone());
        Ok(slot)
    }

    /// Only the allocator removes entries
    pub(crate) fn remove(&mut self, index: u32) -> Option<Arc<DeviceSlot>> {
        let position = self.entries.iter().position(|s| s.index() == index)?;
        Some(self.entries.remove(position))
    }

    pub fn indices(&self) -> Vec<u32> {
        self.entries.iter().map(|s| s.index()).collect()
    }

    pub fn slots(&self) -> impl DoubleEndedIterator<Item = &Arc<DeviceSlot>> {
        self.entries.iter()
    }

    /// Number of registered devices that belong to `set_id`
    pub fn set_members(&self, set_id: SetId) -> usize {
        self.entries.iter().filter(|s| s.set_id() == set_id).count()
    }
}

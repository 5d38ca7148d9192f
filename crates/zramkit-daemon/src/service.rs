//! Async front for the device manager
//!
//! Manager calls block on sysfs and external tools, so each one runs on the
//! blocking pool. Calls on different devices proceed in parallel.

use std::sync::Arc;
use thiserror::Error;
use zramkit_core::{DestroyTarget, DeviceConfig, ZramDevice, ZramError, ZramManager};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Zram(#[from] ZramError),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Clone)]
pub struct ZramService {
    manager: Arc<ZramManager>,
}

impl ZramService {
    pub fn new(manager: ZramManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    pub fn manager(&self) -> &Arc<ZramManager> {
        &self.manager
    }

    async fn call<T, F>(&self, f: F) -> ServiceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ZramManager) -> zramkit_core::Result<T> + Send + 'static,
    {
        let manager = self.manager.clone();
        let result = tokio::task::spawn_blocking(move || f(&manager)).await?;
        Ok(result?)
    }

    pub async fn create_devices(&self, configs: Vec<DeviceConfig>) -> ServiceResult<Vec<u32>> {
        self.call(move |m| m.create_configured(configs)).await
    }

    pub async fn destroy_devices(
        &self,
        target: DestroyTarget,
    ) -> ServiceResult<Vec<(u32, ZramError)>> {
        self.call(move |m| m.destroy_devices(target)).await
    }

    pub async fn activate(&self, id: u32, priority: i32, label: Option<String>) -> ServiceResult<()> {
        self.call(move |m| match label {
            Some(label) => m.activate_labeled(id, priority, &label),
            None => m.activate(id, priority),
        })
        .await
    }

    pub async fn deactivate(&self, id: u32) -> ServiceResult<()> {
        self.call(move |m| m.deactivate(id)).await
    }

    pub async fn refresh(&self, id: u32) -> ServiceResult<ZramDevice> {
        self.call(move |m| m.refresh(id)).await
    }

    pub async fn device_ids(&self) -> ServiceResult<Vec<u32>> {
        self.call(|m| Ok(m.device_ids())).await
    }
}

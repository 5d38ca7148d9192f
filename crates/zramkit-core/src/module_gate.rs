//! Reference-counted zram module loading

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::kernel::ZramKernel;

#[derive(Debug, Default)]
struct GateState {
    refs: usize,
    /// Only a module we loaded ourselves is ever unloaded
    loaded_by_us: bool,
}

/// Keeps the zram module loaded while any device set needs it
pub struct ModuleGate {
    kernel: Arc<dyn ZramKernel>,
    state: Mutex<GateState>,
}

impl ModuleGate {
    pub fn new(kernel: Arc<dyn ZramKernel>) -> Self {
        Self {
            kernel,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Take one reference, loading the module on the first one
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.refs == 0 {
            if self.kernel.module_loaded() {
                debug!("zram module already present, not taking ownership");
            } else {
                self.kernel.load_module()?;
                state.loaded_by_us = true;
            }
        }

        state.refs += 1;
        debug!("zram module refs: {}", state.refs);
        Ok(())
    }

    /// Drop one reference; unload once none remain and no device is registered.
    ///
    /// Releasing with no references held is a no-op.
    pub fn release(&self, devices_remaining: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.refs == 0 {
            return Ok(());
        }
        state.refs -= 1;
        debug!("zram module refs: {}", state.refs);

        Self::maybe_unload(&self.kernel, &mut state, devices_remaining)
    }

    /// Drop every reference at once (destroy-all)
    pub fn release_all(&self, devices_remaining: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.refs > 0 {
            info!("releasing {} zram module reference(s)", state.refs);
        }
        state.refs = 0;

        Self::maybe_unload(&self.kernel, &mut state, devices_remaining)
    }

    pub fn ref_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
    }

    fn maybe_unload(
        kernel: &Arc<dyn ZramKernel>,
        state: &mut GateState,
        devices_remaining: usize,
    ) -> Result<()> {
        if state.refs > 0 || !state.loaded_by_us {
            return Ok(());
        }
        if devices_remaining > 0 {
            warn!(
                "zram module kept loaded: {} device(s) still registered",
                devices_remaining
            );
            return Ok(());
        }

        kernel.unload_module()?;
        state.loaded_by_us = false;
        Ok(())
    }
}

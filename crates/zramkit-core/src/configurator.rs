//! Static per-device parameters applied before first use

use std::sync::Arc;
use tracing::{debug, info};

use crate::algorithm::CompAlgorithm;
use crate::device::ZramDevice;
use crate::error::{ConfigReason, Result, ZramError};
use crate::kernel::{Attr, ZramKernel};
use crate::sysfs::parse_u64_attr;

/// Parameters for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub size: u64,
    pub algorithm: Option<String>,
    pub max_streams: Option<u32>,
}

impl DeviceConfig {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            algorithm: None,
            max_streams: None,
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }

    pub fn with_max_streams(mut self, streams: u32) -> Self {
        self.max_streams = Some(streams);
        self
    }
}

/// Writes size, algorithm and stream count through sysfs
pub struct DeviceConfigurator {
    kernel: Arc<dyn ZramKernel>,
}

impl DeviceConfigurator {
    pub fn new(kernel: Arc<dyn ZramKernel>) -> Self {
        Self { kernel }
    }

    /// Configure an unsized device.
    ///
    /// The kernel freezes `comp_algorithm` once `disksize` is written, so the
    /// size goes in last; the one-shot check on `disksize` happens first.
    pub fn configure(&self, device: &mut ZramDevice, config: &DeviceConfig) -> Result<()> {
        let index = device.index();

        if config.size == 0 {
            return Err(ZramError::InvalidArgument(format!(
                "zram{}: size must be > 0",
                index
            )));
        }
        if config.max_streams == Some(0) {
            return Err(ZramError::InvalidArgument(format!(
                "zram{}: stream count must be >= 1",
                index
            )));
        }

        let touches_params = config.algorithm.is_some() || config.max_streams.is_some();
        if device.is_active() && touches_params {
            return Err(ZramError::config(index, ConfigReason::DeviceActive));
        }

        if device.is_configured() || self.kernel.disk_size(index)? > 0 {
            return Err(ZramError::config(index, ConfigReason::AlreadySized));
        }

        if let Some(name) = &config.algorithm {
            let algorithms = self.algorithms(index)?;
            if !algorithms.supports(name) {
                return Err(ZramError::config(
                    index,
                    ConfigReason::UnsupportedAlgorithm(name.clone()),
                ));
            }
            if algorithms.selected() != name {
                self.kernel.write_attr(index, Attr::CompAlgorithm, name)?;
            }
        }

        if let Some(streams) = config.max_streams {
            self.kernel
                .write_attr(index, Attr::MaxCompStreams, &streams.to_string())?;
        }

        self.kernel
            .write_attr(index, Attr::DiskSize, &config.size.to_string())?;

        self.load_attributes(device)?;
        info!(
            "zram{} configured: {} bytes, {}, {} stream(s)",
            index, device.disk_size, device.comp_algorithm, device.max_comp_streams
        );
        Ok(())
    }

    /// Reset the kernel device and the model back to unconfigured
    pub fn reset(&self, device: &mut ZramDevice) -> Result<()> {
        self.kernel.reset(device.index())?;
        device.clear_configuration();
        debug!("zram{} reset", device.index());
        Ok(())
    }

    /// Current algorithm selection with the supported set
    pub fn algorithms(&self, index: u32) -> Result<CompAlgorithm> {
        CompAlgorithm::parse(&self.kernel.read_attr(index, Attr::CompAlgorithm)?)
    }

    /// Mirror size, algorithm and stream count from the kernel into the model
    pub fn load_attributes(&self, device: &mut ZramDevice) -> Result<()> {
        let index = device.index();

        device.disk_size = self.kernel.disk_size(index)?;
        device.comp_algorithm = self.algorithms(index)?.selected().to_string();

        let streams = self.kernel.read_attr(index, Attr::MaxCompStreams)?;
        let streams = parse_u64_attr("max_comp_streams", &streams)?;
        device.max_comp_streams = u32::try_from(streams).map_err(|_| {
            ZramError::Parse(format!("max_comp_streams out of range: {}", streams))
        })?;

        Ok(())
    }
}

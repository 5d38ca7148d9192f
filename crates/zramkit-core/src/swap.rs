//! Swap formatting, activation and deactivation

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{CommandOutput, CommandRunner};
use crate::config::ToolPaths;
use crate::device::{SwapIdentity, ZramDevice};
use crate::error::{Result, ZramError};
use crate::kernel::ZramKernel;
use crate::swaps::{is_listed, parse_swaps, SwapEntry};

/// mkswap stores at most 16 bytes of label
pub const MAX_LABEL_LEN: usize = 16;

/// Turns configured devices into swap space and back
pub struct SwapController {
    kernel: Arc<dyn ZramKernel>,
    runner: Arc<dyn CommandRunner>,
    tools: ToolPaths,
}

impl SwapController {
    pub fn new(kernel: Arc<dyn ZramKernel>, runner: Arc<dyn CommandRunner>, tools: ToolPaths) -> Self {
        Self {
            kernel,
            runner,
            tools,
        }
    }

    /// Current kernel swap listing
    pub fn swaps(&self) -> Result<Vec<SwapEntry>> {
        parse_swaps(&self.kernel.swap_listing()?)
    }

    /// Whether the kernel lists this node as swap right now
    pub fn is_listed(&self, node: &Path) -> Result<bool> {
        Ok(is_listed(&self.swaps()?, node))
    }

    /// Format the device as swap and enable it.
    ///
    /// With a label the device is formatted with that label and enabled by
    /// label, so the label alone is enough to disable it again. `timeout`
    /// bounds both steps together. When it fires, the swap listing decides
    /// whether the device ended up active.
    pub fn activate(
        &self,
        device: &mut ZramDevice,
        priority: i32,
        label: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let node = device.device_node().to_path_buf();
        let target = node.display().to_string();

        if let Some(label) = label {
            validate_label(label)?;
        }
        if !device.is_configured() {
            return Err(ZramError::swap(&target, "device not configured"));
        }
        if device.is_active() || self.is_listed(&node)? {
            return Err(ZramError::swap(&target, "already active"));
        }

        let identity = match label {
            Some(label) => SwapIdentity::Label(label.to_string()),
            None => SwapIdentity::Path(node.clone()),
        };
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut mkswap_args = Vec::new();
        if let Some(label) = label {
            mkswap_args.push("-L".to_string());
            mkswap_args.push(label.to_string());
        }
        mkswap_args.push(target.clone());

        let formatted = self.run_tool(&self.tools.mkswap, &mkswap_args, remaining(deadline));
        self.check_step(device, &identity, &target, "mkswap", formatted)?;

        let mut swapon_args = vec!["-p".to_string(), priority.to_string()];
        swapon_args.extend(identity.args());

        let enabled = self.run_tool(&self.tools.swapon, &swapon_args, remaining(deadline));
        self.check_step(device, &identity, &target, "swapon", enabled)?;

        device.mark_active(identity.clone());
        info!("{} active as swap (priority {}, {})", target, priority, identity);
        Ok(())
    }

    /// Disable swap on the device by the identity it was enabled with.
    ///
    /// Deactivating an inactive device succeeds without running anything.
    pub fn deactivate(&self, device: &mut ZramDevice, timeout: Option<Duration>) -> Result<()> {
        if !device.is_active() {
            debug!("{} already inactive", device.name());
            return Ok(());
        }

        let node = device.device_node().to_path_buf();
        let identity = device.swap_identity();
        let target = identity.to_string();

        match self.run_tool(&self.tools.swapoff, &identity.args(), timeout) {
            Ok(output) if output.success => {}
            Ok(output) => {
                // Someone else may have disabled it already
                if !self.is_listed(&node)? {
                    warn!(
                        "swapoff {} failed but device is no longer swap: {}",
                        target,
                        output.failure_message()
                    );
                } else {
                    return Err(ZramError::swap(&target, output.failure_message()));
                }
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::TimedOut && !self.is_listed(&node)? {
                    warn!("swapoff {} timed out after completing", target);
                } else {
                    return Err(ZramError::swap(&target, format!("swapoff: {}", e)));
                }
            }
        }

        device.mark_inactive();
        info!("{} no longer swap", node.display());
        Ok(())
    }

    /// Re-derive `active` from the swap listing
    pub fn reconcile(&self, device: &mut ZramDevice) -> Result<bool> {
        let listed = self.is_listed(device.device_node())?;
        if listed && !device.is_active() {
            warn!("{} is swap without our activation", device.name());
            device.mark_active(SwapIdentity::Path(device.device_node().to_path_buf()));
        } else if !listed && device.is_active() {
            warn!("{} was removed from swap externally", device.name());
            device.mark_inactive();
        }
        Ok(listed)
    }

    fn run_tool(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<CommandOutput> {
        if timeout == Some(Duration::ZERO) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline already passed"));
        }
        self.runner.run(program, args, timeout)
    }

    /// Map one step's outcome; a timeout reconciles `active` from the listing
    fn check_step(
        &self,
        device: &mut ZramDevice,
        identity: &SwapIdentity,
        target: &str,
        step: &str,
        result: io::Result<CommandOutput>,
    ) -> Result<()> {
        match result {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(ZramError::swap(
                target,
                format!("{} failed: {}", step, output.failure_message()),
            )),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if self.is_listed(device.device_node())? {
                    device.mark_active(identity.clone());
                    warn!("{} timed out but {} is swap now", step, target);
                } else {
                    device.mark_inactive();
                }
                Err(ZramError::swap(target, format!("{} timed out", step)))
            }
            Err(e) => Err(ZramError::swap(target, format!("{}: {}", step, e))),
        }
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(ZramError::InvalidArgument("swap label must not be empty".to_string()));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(ZramError::InvalidArgument(format!(
            "swap label {:?} longer than {} bytes",
            label, MAX_LABEL_LEN
        )));
    }
    if label.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ZramError::InvalidArgument(format!(
            "swap label {:?} contains whitespace",
            label
        )));
    }
    Ok(())
}

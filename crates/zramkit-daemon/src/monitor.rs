use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zramkit_core::{StatsSnapshot, ZramDevice};

use crate::service::ZramService;
use crate::stats::DaemonStats;

/// Periodic refresher for every registered device
///
/// Each round refreshes all devices, warns when a device's I/O counters go
/// backwards or its swap state changed outside the daemon, and rewrites the
/// stats file if one is configured.
pub struct DeviceMonitor {
    service: ZramService,
    interval: Duration,
    stats_file: Option<PathBuf>,
    started: Instant,

    last_seen: HashMap<u32, (StatsSnapshot, bool)>,
    refresh_count: u64,
    regressions: u64,
}

impl DeviceMonitor {
    pub fn new(service: ZramService, interval: Duration, stats_file: Option<PathBuf>) -> Self {
        Self {
            service,
            interval,
            stats_file,
            started: Instant::now(),
            last_seen: HashMap::new(),
            refresh_count: 0,
            regressions: 0,
        }
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    pub fn regressions(&self) -> u64 {
        self.regressions
    }

    /// One refresh round; returns the refreshed devices
    pub async fn tick(&mut self) -> Vec<ZramDevice> {
        self.refresh_count += 1;
        debug!("Starting refresh round #{}", self.refresh_count);

        let ids = match self.service.device_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to list devices: {}", e);
                return Vec::new();
            }
        };

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            match self.service.refresh(id).await {
                Ok(device) => {
                    self.observe(&device);
                    devices.push(device);
                }
                Err(e) => error!("Refresh of zram{} failed: {}", id, e),
            }
        }
        self.last_seen
            .retain(|id, _| devices.iter().any(|d| d.index() == *id));

        if let Some(path) = &self.stats_file {
            let snapshot = DaemonStats::new(
                &devices,
                self.started.elapsed().as_secs(),
                self.refresh_count,
                self.regressions,
            );
            if let Err(e) = snapshot.write_to_file(path) {
                warn!("Failed to write stats to {:?}: {}", path, e);
            }
        }

        devices
    }

    fn observe(&mut self, device: &ZramDevice) {
        let current = (*device.stats(), device.is_active());

        if let Some((previous, was_active)) = self.last_seen.insert(device.index(), current) {
            if current.0.counters_regressed(&previous) {
                self.regressions += 1;
                warn!(
                    "{}: I/O counters went backwards (reads {} -> {}, writes {} -> {})",
                    device.name(),
                    previous.num_reads,
                    current.0.num_reads,
                    previous.num_writes,
                    current.0.num_writes
                );
            }
            if was_active != current.1 {
                warn!(
                    "{}: swap state changed outside the daemon, now {}",
                    device.name(),
                    if current.1 { "active" } else { "inactive" }
                );
            }
        }
    }

    /// Refresh every `interval` until cancelled
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("Refreshing devices every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Monitor stopping after {} round(s)", self.refresh_count);
                    break;
                }
                _ = ticker.tick() => {
                    let devices = self.tick().await;
                    let active = devices.iter().filter(|d| d.is_active()).count();
                    let stored: u64 = devices.iter().map(|d| d.orig_data_size()).sum();
                    let compressed: u64 = devices.iter().map(|d| d.compr_data_size()).sum();
                    debug!(
                        "Stats: devices={}, active={}, stored={}B, compressed={}B",
                        devices.len(),
                        active,
                        stored,
                        compressed
                    );
                }
            }
        }
    }
}

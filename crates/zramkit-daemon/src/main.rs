use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use nix::unistd::Uid;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zramkit_core::{zram_supported, DestroyTarget, ZramManager, VERSION};
use zramkit_daemon::config::LogConfig;
use zramkit_daemon::{Config, DeviceMonitor, ZramService};

/// ZramKit - zram swap device daemon
///
/// Creates the configured zram devices, enables them as swap, keeps their
/// statistics fresh and removes them again on shutdown
#[derive(Parser, Debug)]
#[command(name = "zramkit-daemon")]
#[command(version = VERSION)]
#[command(about = "ZramKit Daemon - zram swap device lifecycle", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/zramkit/config.toml", env = "ZRAMKIT_CONFIG")]
    config: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring up the device table and watch it until SIGINT/SIGTERM
    Run,

    /// Show zram devices currently present in the kernel
    Status,

    /// Validate the configuration file and show the device table
    CheckConfig,

    /// Generate an example configuration file
    GenerateConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        return generate_config(output);
    }

    let (config, from_file) = load_config(&cli.config)?;
    let _guard = init_logging(&config.logging)?;

    info!("ZramKit Daemon v{} starting...", VERSION);
    if from_file {
        info!("Configuration loaded from {:?}", cli.config);
    } else {
        warn!("Configuration file not found: {:?}, using defaults", cli.config);
    }

    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    match cli.command {
        Some(Commands::Run) | None => run_daemon(config).await?,
        Some(Commands::Status) => show_status(&config)?,
        Some(Commands::CheckConfig) => check_config(&config)?,
        Some(Commands::GenerateConfig { .. }) => {}
    }

    Ok(())
}

/// Create and activate the device table, monitor it, tear it down on signal
async fn run_daemon(config: Config) -> Result<()> {
    if !Uid::effective().is_root() {
        return Err(anyhow!("zramkit-daemon run requires root privileges"));
    }

    let service = ZramService::new(ZramManager::from_config(&config.manager));
    let device_configs = config.device_configs().map_err(|e| anyhow!(e))?;

    let ids = if device_configs.is_empty() {
        warn!("Device table is empty, nothing to create");
        Vec::new()
    } else {
        service
            .create_devices(device_configs)
            .await
            .map_err(|e| anyhow!("Failed to create devices: {}", e))?
    };
    info!("Created {} zram device(s): {:?}", ids.len(), ids);

    for (&id, entry) in ids.iter().zip(&config.devices) {
        if !entry.activate {
            continue;
        }
        match service.activate(id, entry.priority, entry.label.clone()).await {
            Ok(()) => info!("zram{} enabled as swap (priority {})", id, entry.priority),
            Err(e) => error!("Failed to activate zram{}: {}", id, e),
        }
    }

    let cancel = CancellationToken::new();
    let mut monitor = DeviceMonitor::new(
        service.clone(),
        Duration::from_secs(config.monitoring.refresh_interval_secs),
        config.monitoring.stats_file.clone(),
    );
    let monitor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.run(cancel).await })
    };

    let waited = shutdown_signal().await;
    cancel.cancel();
    if let Err(e) = monitor_task.await {
        error!("Monitor task failed: {}", e);
    }

    teardown(&service).await?;
    waited
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received, shutting down");
        }
        _ = terminate.recv() => {
            info!("SIGTERM received, shutting down");
        }
    }
    Ok(())
}

async fn teardown(service: &ZramService) -> Result<()> {
    let failures = service
        .destroy_devices(DestroyTarget::All)
        .await
        .map_err(|e| anyhow!("Teardown failed: {}", e))?;

    if failures.is_empty() {
        info!("All zram devices removed");
        return Ok(());
    }

    for (id, e) in &failures {
        error!("Failed to remove zram{}: {}", id, e);
    }
    Err(anyhow!("{} device(s) could not be removed", failures.len()))
}

/// Show devices present in the kernel, including ones not created by us
fn show_status(config: &Config) -> Result<()> {
    if !zram_supported(&config.manager.sys_root) {
        info!("zram module is not loaded");
        return Ok(());
    }

    let manager = ZramManager::from_config(&config.manager);
    manager
        .adopt_existing()
        .map_err(|e| anyhow!("Failed to read zram devices: {}", e))?;

    let devices = manager.devices();
    info!("=== zram devices: {} ===", devices.len());
    for device in &devices {
        info!("{}", device);
        info!(
            "  reads={} writes={} stored={}B compressed={}B ratio={:.2}",
            device.num_reads(),
            device.num_writes(),
            device.orig_data_size(),
            device.compr_data_size(),
            device.stats().compression_ratio()
        );
    }
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    info!("Configuration is valid");
    info!(
        "Refresh interval: {}s, swap timeout: {:?}",
        config.monitoring.refresh_interval_secs,
        config.manager.swap_timeout()
    );

    for (position, entry) in config.devices.iter().enumerate() {
        let size = entry.size_bytes().map_err(|e| anyhow!(e))?;
        info!(
            "device {}: {} ({} bytes), {} stream(s), algorithm {}, priority {}, label {}, activate {}",
            position,
            entry.size,
            size,
            entry.streams,
            entry
                .algorithm
                .as_deref()
                .or(config.manager.default_algorithm.as_deref())
                .unwrap_or("kernel default"),
            entry.priority,
            entry.label.as_deref().unwrap_or("-"),
            entry.activate
        );
    }

    if !zram_supported(&config.manager.sys_root) {
        warn!("zram module is not loaded; it will be loaded on first use");
    }
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    Config::example()
        .save_to_file(output)
        .map_err(|e| anyhow!("Failed to save configuration file: {}", e))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Load configuration from file or use defaults; the flag tells which
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        let config = Config::load_from_file(path)
            .map_err(|e| anyhow!("Failed to load configuration file: {}", e))?;
        Ok((config, true))
    } else {
        Ok((Config::default(), false))
    }
}

/// Initialize logging with stdout and daily rotated file output
fn init_logging(logging: &LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, &logging.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)))
        .init();

    Ok(guard)
}

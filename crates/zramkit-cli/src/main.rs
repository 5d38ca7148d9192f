use anyhow::{anyhow, Result};
use byte_unit::{Byte, UnitType};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use nix::unistd::Uid;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use zramkit_core::{
    DestroyTarget, DeviceConfig, ManagerConfig, ZramDevice, ZramManager, VERSION,
};

#[derive(Parser)]
#[command(name = "zramkit")]
#[command(author = "ZramKit Developers")]
#[command(version = VERSION)]
#[command(about = "zram swap device management - CLI", long_about = None)]
struct Cli {
    /// sysfs mount point
    #[arg(long, global = true, default_value = "/sys", env = "ZRAMKIT_SYS_ROOT")]
    sys_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create zram devices, one per --size
    Create {
        /// Disk size of a device, e.g. 512MiB (repeat for more devices)
        #[arg(short, long = "size", required = true, value_parser = parse_size)]
        sizes: Vec<u64>,

        /// Compression streams per device, in --size order (default: 1 each)
        #[arg(short = 'n', long = "streams")]
        streams: Vec<u32>,

        /// Compression algorithm for every new device
        #[arg(short, long)]
        algorithm: Option<String>,
    },

    /// Remove zram devices
    Destroy {
        /// Device numbers to remove
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<u32>,

        /// Remove every zram device
        #[arg(long)]
        all: bool,
    },

    /// Format a device as swap and enable it
    Activate {
        id: u32,

        /// Swap priority
        #[arg(short, long, default_value_t = 100, allow_negative_numbers = true)]
        priority: i32,

        /// Swap label (at most 16 bytes)
        #[arg(short, long)]
        label: Option<String>,

        /// Give up on mkswap/swapon after this long, e.g. 30s
        #[arg(short, long, value_parser = humantime::parse_duration, default_value = "60s")]
        timeout: Duration,
    },

    /// Disable swap on a device
    Deactivate { id: u32 },

    /// Show zram devices and swap usage
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// Refresh continuously at this interval, e.g. 2s
        #[arg(short, long, value_parser = humantime::parse_duration)]
        watch: Option<Duration>,
    },

    /// Generate shell completions
    Completions { shell: Shell },
}

#[derive(Serialize)]
struct StatusReport {
    devices: Vec<ZramDevice>,
    swap_total: u64,
    swap_used: u64,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let command = cli.command.unwrap_or(Commands::Status {
        json: false,
        watch: None,
    });

    if let Commands::Completions { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "zramkit", &mut std::io::stdout());
        return Ok(());
    }

    let config = ManagerConfig {
        sys_root: cli.sys_root,
        ..ManagerConfig::default()
    };
    config.validate().map_err(|e| anyhow!(e))?;

    let needs_root = !matches!(command, Commands::Status { .. });
    if needs_root && !Uid::effective().is_root() {
        println!("{}", "⚠️  Not running as root, kernel writes will likely fail".yellow());
    }

    let manager = ZramManager::from_config(&config);
    manager
        .adopt_existing()
        .map_err(|e| anyhow!("Failed to read existing zram devices: {}", e))?;

    match command {
        Commands::Create {
            sizes,
            streams,
            algorithm,
        } => create(&manager, sizes, streams, algorithm),
        Commands::Destroy { ids, all } => destroy(&manager, ids, all),
        Commands::Activate {
            id,
            priority,
            label,
            timeout,
        } => activate(&manager, id, priority, label, timeout),
        Commands::Deactivate { id } => {
            manager.deactivate(id)?;
            println!("{}", format!("✅ zram{} is no longer swap", id).green());
            Ok(())
        }
        Commands::Status { json, watch } => match watch {
            Some(interval) => watch_status(&manager, interval),
            None => show_status(&manager, json),
        },
        Commands::Completions { .. } => Ok(()),
    }
}

fn create(
    manager: &ZramManager,
    sizes: Vec<u64>,
    streams: Vec<u32>,
    algorithm: Option<String>,
) -> Result<()> {
    let streams = if streams.is_empty() {
        vec![1; sizes.len()]
    } else {
        streams
    };
    if streams.len() != sizes.len() {
        return Err(anyhow!(
            "{} --size but {} --streams given",
            sizes.len(),
            streams.len()
        ));
    }

    let configs = sizes
        .iter()
        .zip(&streams)
        .map(|(&size, &n)| {
            let config = DeviceConfig::new(size).with_max_streams(n);
            match &algorithm {
                Some(alg) => config.with_algorithm(alg.clone()),
                None => config,
            }
        })
        .collect();

    let ids = manager.create_configured(configs)?;
    for id in ids {
        let device = manager.device(id)?;
        println!(
            "{} {} ({}, {}, {} stream(s))",
            "✅ created".green(),
            device.device_node().display(),
            format_size(device.disk_size()),
            device.comp_algorithm(),
            device.max_comp_streams()
        );
    }
    Ok(())
}

fn destroy(manager: &ZramManager, ids: Vec<u32>, all: bool) -> Result<()> {
    let target = if all {
        DestroyTarget::All
    } else {
        DestroyTarget::Devices(ids.clone())
    };
    let requested = if all { manager.device_ids() } else { ids };

    let failures = manager.destroy_devices(target)?;
    for id in requested {
        if !failures.iter().any(|(failed, _)| *failed == id) {
            println!("{}", format!("✅ zram{} removed", id).green());
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    for (id, e) in &failures {
        println!("{}", format!("❌ zram{}: {}", id, e).red());
    }
    Err(anyhow!("{} device(s) could not be removed", failures.len()))
}

fn activate(
    manager: &ZramManager,
    id: u32,
    priority: i32,
    label: Option<String>,
    timeout: Duration,
) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Formatting zram{} as swap...", id));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = manager.activate_with_timeout(id, priority, label.as_deref(), Some(timeout));
    spinner.finish_and_clear();
    result?;

    let how = match &label {
        Some(label) => format!("LABEL={}", label),
        None => format!("/dev/zram{}", id),
    };
    println!(
        "{}",
        format!("✅ {} enabled as swap (priority {})", how, priority).green()
    );
    Ok(())
}

fn collect_status(manager: &ZramManager) -> StatusReport {
    let devices = manager
        .device_ids()
        .into_iter()
        .filter_map(|id| match manager.refresh(id) {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("{}", format!("⚠️  zram{}: {}", id, e).yellow());
                manager.device(id).ok()
            }
        })
        .collect();

    let mut sys = System::new();
    sys.refresh_memory();

    StatusReport {
        devices,
        swap_total: sys.total_swap(),
        swap_used: sys.used_swap(),
    }
}

fn show_status(manager: &ZramManager, json: bool) -> Result<()> {
    let report = collect_status(manager);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "=== ZramKit Status ===".green().bold());
    if report.devices.is_empty() {
        println!("\n{}", "No zram devices".yellow());
    }

    for device in &report.devices {
        let state = if device.is_active() {
            "● swap".green()
        } else if device.is_configured() {
            "○ idle".yellow()
        } else {
            "○ unconfigured".dimmed()
        };
        println!(
            "\n{} {}",
            device.device_node().display().to_string().cyan().bold(),
            state
        );
        println!("  Size:       {}", format_size(device.disk_size()));
        println!("  Algorithm:  {}", device.comp_algorithm());
        println!("  Streams:    {}", device.max_comp_streams());
        if let Some(label) = device.label() {
            println!("  Label:      {}", label);
        }
        println!(
            "  I/O:        {} reads, {} writes",
            device.num_reads(),
            device.num_writes()
        );
        println!(
            "  Stored:     {} -> {} (ratio {:.2}, {:.1}% saved)",
            format_size(device.orig_data_size()),
            format_size(device.compr_data_size()),
            device.stats().compression_ratio(),
            device.stats().space_savings()
        );
    }

    println!(
        "\nSwap: {} used of {}",
        format_size(report.swap_used),
        format_size(report.swap_total)
    );
    Ok(())
}

fn watch_status(manager: &ZramManager, interval: Duration) -> Result<()> {
    loop {
        // Clear screen
        print!("\x1B[2J\x1B[1;1H");
        show_status(manager, false)?;
        println!(
            "\nRefreshing every {} (Ctrl+C to exit)",
            humantime::format_duration(interval)
        );
        std::thread::sleep(interval);
    }
}

fn parse_size(s: &str) -> Result<u64, String> {
    let bytes = Byte::parse_str(s, true)
        .map_err(|e| format!("invalid size {:?}: {}", s, e))?
        .as_u64();
    if bytes == 0 {
        return Err("size must be > 0".to_string());
    }
    Ok(bytes)
}

fn format_size(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{:.1} {}", adjusted.get_value(), adjusted.get_unit())
}

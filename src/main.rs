//! CLI Entry Point for labsync
//!
//! Headless front-end to the acquisition and sweep engine:
//! - `devices`: list configured instruments and their connection state
//! - `poll`: stream live status snapshots as JSON lines
//! - `sweep`: run a Bode sweep and export it as CSV
//! - `trace`: acquire one analyzer trace, single or averaged, as CSV
//! - `preset`: save, show, list and load parameter presets
//!
//! # Usage
//!
//! ```bash
//! labsync --simulate sweep --start 1000 --stop 1e6 --points 31 --output bode.csv
//! labsync poll --duration 10s
//! labsync trace --averaged -o spectrum.csv
//! labsync preset save bench --set stage0.target_position=12.5
//! labsync preset load bench --apply
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labsync::config::LabsyncConfig;
use labsync::logging::{self, LogFormat};
use labsync::{AcquisitionLoop, PresetStore};
use labsync_core::{DeviceId, ParameterValue, StatusEvent};
use labsync_experiment::{write_points_csv, SweepCoordinator, SweepEvent, SweepOutcome, SweepPoint, SweepRequest};
use labsync_hardware::DeviceRegistry;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "labsync")]
#[command(about = "Headless multi-instrument acquisition and sweep engine", long_about = None)]
struct Cli {
    /// Configuration file (default: config/labsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Attach every device to a simulated instrument
    #[arg(long, global = true)]
    simulate: bool,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured devices
    Devices {
        /// Try to connect every device first
        #[arg(long)]
        connect: bool,
    },

    /// Poll open devices and print status events as JSON lines
    Poll {
        /// Stop after this long (default: until Ctrl+C)
        #[arg(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },

    /// Run a logarithmic frequency sweep
    Sweep {
        /// Start frequency in Hz
        #[arg(long)]
        start: Option<f64>,
        /// Stop frequency in Hz
        #[arg(long)]
        stop: Option<f64>,
        /// Number of points
        #[arg(long)]
        points: Option<usize>,
        /// CSV output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Acquire one spectrum analyzer trace and export it as CSV
    Trace {
        /// Analyzer device id (default: the sweep analyzer)
        #[arg(long)]
        device: Option<String>,
        /// Average over the analyzer's average_count sweeps
        #[arg(long)]
        averaged: bool,
        /// CSV output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Manage parameter presets
    Preset {
        #[command(subcommand)]
        action: PresetAction,
    },
}

#[derive(Subcommand)]
enum PresetAction {
    /// Save the current parameters, optionally after staging some values
    Save {
        /// Preset name
        name: String,
        /// `device.key=value` assignments staged before saving
        #[arg(long = "set")]
        assignments: Vec<String>,
    },
    /// Print a preset
    Show {
        /// Preset name
        name: String,
    },
    /// List stored presets
    List,
    /// Load a preset into memory, optionally pushing it to the instruments
    Load {
        /// Preset name
        name: String,
        /// Connect the devices and apply the loaded values
        #[arg(long)]
        apply: bool,
    },
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LabsyncConfig::load_from(path),
        None => LabsyncConfig::load(),
    }
    .context("Failed to load configuration")?;
    if cli.simulate {
        config.simulate_all();
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let registry = Arc::new(build_registry(&config)?);
    info!(
        application = %config.application.name,
        devices = config.devices.len(),
        simulated = cli.simulate,
        "labsync starting"
    );

    let result = match cli.command {
        Commands::Devices { connect } => list_devices(&registry, connect).await,
        Commands::Poll { duration } => poll(&registry, &config, duration).await,
        Commands::Sweep {
            start,
            stop,
            points,
            output,
        } => {
            let defaults = config.sweep.request();
            let request = SweepRequest {
                start_hz: start.unwrap_or(defaults.start_hz),
                stop_hz: stop.unwrap_or(defaults.stop_hz),
                points: points.unwrap_or(defaults.points),
            };
            sweep(&registry, &config, request, output).await
        }
        Commands::Trace {
            device,
            averaged,
            output,
        } => {
            let id = DeviceId::new(device.unwrap_or_else(|| config.sweep.analyzer.clone()));
            trace(&registry, &id, averaged, output).await
        }
        Commands::Preset { action } => preset(&registry, &config, action).await,
    };

    registry.disconnect_all().await;
    result
}

fn build_registry(config: &LabsyncConfig) -> Result<DeviceRegistry> {
    let registry = DeviceRegistry::new().with_settings(config.registry.settings());
    for device in &config.devices {
        registry
            .register(device.clone())
            .with_context(|| format!("Failed to register device '{}'", device.id))?;
    }
    Ok(registry)
}

async fn connect_all(registry: &DeviceRegistry) {
    for err in registry.connect_all().await {
        warn!(error = %err, "Device unavailable");
    }
}

async fn list_devices(registry: &DeviceRegistry, connect: bool) -> Result<()> {
    if connect {
        connect_all(registry).await;
    }
    println!("{:<12} {:<10} {:<20} {:<28} STATE", "ID", "DRIVER", "CLASS", "RESOURCE");
    for info in registry.list_devices() {
        let resource = if info.simulated {
            format!("{} (sim)", info.resource)
        } else {
            info.resource
        };
        println!(
            "{:<12} {:<10} {:<20} {:<28} {}",
            info.id.as_str(),
            info.driver_type,
            format!("{:?}", info.class),
            resource,
            info.state
        );
    }
    Ok(())
}

async fn poll(registry: &Arc<DeviceRegistry>, config: &LabsyncConfig, duration: Option<Duration>) -> Result<()> {
    connect_all(registry).await;
    if registry.open_devices().is_empty() {
        bail!("No device could be opened");
    }

    let acquisition = AcquisitionLoop::from_config(registry.clone(), &config.acquisition);
    let mut events = acquisition.subscribe();
    let running = acquisition.start();

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Status output fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    running.stop().await;
    Ok(())
}

fn print_event(event: &StatusEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn sweep(
    registry: &Arc<DeviceRegistry>,
    config: &LabsyncConfig,
    request: SweepRequest,
    output: Option<PathBuf>,
) -> Result<()> {
    let settings = config.sweep.settings();
    for id in [&settings.generator, &settings.analyzer] {
        registry
            .connect(id)
            .await
            .with_context(|| format!("Sweep device '{}' unavailable", id))?;
    }

    let coordinator = Arc::new(SweepCoordinator::new(registry.clone(), settings));
    let mut events = coordinator.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SweepEvent::Point { index, total, point } => info!(
                    point = index + 1,
                    total,
                    frequency_hz = point.frequency_hz,
                    amplitude = point.amplitude,
                    "Measured"
                ),
                SweepEvent::Finished { .. } => break,
                SweepEvent::State { .. } => {}
            }
        }
    });

    let running = coordinator.start(request).await.context("Failed to start sweep")?;
    let interrupt = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; aborting after the current point");
                coordinator.abort().await;
            }
        })
    };

    let outcome = running.await.context("Sweep task failed")?;
    interrupt.abort();
    let _ = progress.await;

    let result = coordinator.result().await;
    match &output {
        Some(path) => result
            .export_csv(path)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => result.write_csv(std::io::stdout().lock())?,
    }

    match outcome {
        SweepOutcome::Completed => Ok(()),
        SweepOutcome::Aborted => {
            warn!(points = result.points().len(), "Sweep aborted; partial result kept");
            Ok(())
        }
        SweepOutcome::Failed { reason } => bail!(
            "Sweep failed after {} of {} points: {}",
            result.points().len(),
            result.planned(),
            reason
        ),
    }
}

async fn trace(registry: &DeviceRegistry, id: &DeviceId, averaged: bool, output: Option<PathBuf>) -> Result<()> {
    registry
        .connect(id)
        .await
        .with_context(|| format!("Analyzer '{}' unavailable", id))?;
    let points: Vec<SweepPoint> = registry
        .acquire_trace(id, averaged)
        .await
        .with_context(|| format!("Trace acquisition on '{}' failed", id))?
        .into_iter()
        .map(|(frequency_hz, amplitude)| SweepPoint { frequency_hz, amplitude })
        .collect();

    match &output {
        Some(path) => {
            let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            write_points_csv(&points, std::io::BufWriter::new(file))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), rows = points.len(), averaged, "Exported trace");
        }
        None => write_points_csv(&points, std::io::stdout().lock())?,
    }
    Ok(())
}

async fn preset(registry: &Arc<DeviceRegistry>, config: &LabsyncConfig, action: PresetAction) -> Result<()> {
    let store = PresetStore::from_config(registry.clone(), &config.presets);

    match action {
        PresetAction::Save { name, assignments } => {
            for assignment in &assignments {
                let (device, key, value) = parse_assignment(assignment)?;
                registry
                    .stage_parameter(&device, &key, value)
                    .with_context(|| format!("Cannot stage '{}'", assignment))?;
            }
            let path = store.save(&name).await?;
            println!("Saved {}", path.display());
        }
        PresetAction::Show { name } => {
            let record = store.read(&name).await?;
            print!("{}", record.to_toml()?);
        }
        PresetAction::List => {
            for name in store.list().await? {
                println!("{}", name);
            }
        }
        PresetAction::Load { name, apply } => {
            let record = store.load(&name).await?;
            println!("Loaded '{}' for {} device(s)", record.name, record.devices.len());
            if apply {
                for id in record.devices.keys() {
                    if registry.state(id).is_err() {
                        continue;
                    }
                    registry.connect(id).await?;
                    registry.apply_parameters(id).await?;
                    println!("Applied to {}", id);
                }
            }
        }
    }
    Ok(())
}

/// Split `device.key=value` and infer the value type.
fn parse_assignment(raw: &str) -> Result<(DeviceId, String, ParameterValue)> {
    let (target, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected device.key=value, got '{}'", raw))?;
    let (device, key) = target
        .split_once('.')
        .with_context(|| format!("Expected device.key=value, got '{}'", raw))?;

    let value = value.trim();
    let value = if let Ok(b) = value.parse::<bool>() {
        ParameterValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        ParameterValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ParameterValue::Float(f)
    } else {
        ParameterValue::Text(value.to_string())
    };
    Ok((DeviceId::new(device.trim()), key.trim().to_string(), value))
}

//! Hardware exercise CLI.
//!
//! Discovers every supported controller on the configured backend,
//! reports the fitted stages, and optionally runs a short motion exercise
//! against each device. Intended for bench bring-up and for CI against
//! the simulated backend.
//!
//! # Usage
//!
//! List what is connected:
//! ```bash
//! thormotion-test --list
//! ```
//!
//! Exercise one device:
//! ```bash
//! thormotion-test --select 27123456
//! ```
//!
//! Dry-run the whole flow without hardware:
//! ```bash
//! thormotion-test --simulated
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;

use thorlabs_motion::backend::sim::SimBackend;
use thorlabs_motion::backend::{self, Backend, Direction};
use thorlabs_motion::catalog::controllers::ControllerType;
use thorlabs_motion::config::Settings;
use thorlabs_motion::controller::{create_controller, motor, Controller};
use thorlabs_motion::discovery::{discover_devices_with_stages, DeviceDescriptor, StageDetection};

#[derive(Parser)]
#[command(name = "thormotion-test")]
#[command(about = "Discover and exercise Thorlabs motion controllers", long_about = None)]
struct Cli {
    /// List discovered devices and exit without moving anything
    #[arg(long)]
    list: bool,

    /// Emit the device list as JSON instead of a table (implies --list)
    #[arg(long)]
    json: bool,

    /// Restrict to one controller model, by name (KDC101) or serial prefix (27)
    #[arg(long = "type", value_name = "MODEL")]
    model: Option<String>,

    /// Exercise a single device by serial number
    #[arg(long, value_name = "SERIAL")]
    select: Option<u32>,

    /// Use the simulated backend with a seeded device roster
    #[arg(long)]
    simulated: bool,

    /// Settings file (TOML); environment variables override it
    #[arg(long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).context("Loading settings")?;
    let backend: Arc<dyn Backend> = if cli.simulated {
        seeded_sim_backend()
    } else {
        backend::for_settings(&settings).context("Selecting backend")?
    };

    let model_filter = cli
        .model
        .as_deref()
        .map(parse_model)
        .transpose()?;

    println!("Scanning the {} backend...", backend.kind());
    let mut devices = discover_devices_with_stages(backend.as_ref())
        .await
        .context("Device discovery")?;

    devices.retain(|(device, _)| {
        model_filter.map_or(true, |m| device.controller_type == m)
            && cli.select.map_or(true, |s| device.serial == s)
    });

    if devices.is_empty() {
        bail!("No matching devices found");
    }

    if cli.json {
        let list: Vec<_> = devices
            .iter()
            .map(|(device, detection)| device_json(device, detection))
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    for (device, detection) in &devices {
        print_device(device, detection);
    }
    if cli.list {
        return Ok(());
    }

    let mut failures = 0usize;
    for (device, detection) in &devices {
        println!();
        println!("=== Exercising {} {} ===", device.controller_type, device.serial);
        match exercise_device(backend.clone(), device, detection, &settings).await {
            Ok(()) => println!("=== {} passed ===", device.serial),
            Err(e) => {
                eprintln!("=== {} FAILED: {e:#} ===", device.serial);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} device(s) failed the exercise");
    }
    println!();
    println!("All {} device(s) passed", devices.len());
    Ok(())
}

fn parse_model(value: &str) -> Result<ControllerType> {
    if let Some(controller_type) = ControllerType::from_name(value) {
        return Ok(controller_type);
    }
    if let Ok(prefix) = value.parse::<u32>() {
        if let Some(info) = thorlabs_motion::catalog::controllers::all()
            .iter()
            .find(|info| info.prefix == prefix)
        {
            return Ok(info.controller_type);
        }
    }
    bail!("Unknown controller model '{value}'");
}

fn seeded_sim_backend() -> Arc<dyn Backend> {
    let backend = SimBackend::new();
    backend.add_device(27_123_456, Some("PRM1Z8"));
    backend.add_device(28_000_123, Some("DDS100"));
    backend.add_device(83_845_261, Some("Z825B"));
    backend.add_device(97_101_010, None);
    backend.add_device(29_500_321, None);
    Arc::new(backend)
}

fn device_json(device: &DeviceDescriptor, detection: &StageDetection) -> serde_json::Value {
    let (stage, detail) = match detection {
        StageDetection::Detected { part_number, .. } => ("detected", Some(part_number.clone())),
        StageDetection::Unrecognized { part_number } => ("unrecognized", Some(part_number.clone())),
        StageDetection::NotFitted => ("not_fitted", None),
        StageDetection::NotApplicable => ("not_applicable", None),
        StageDetection::Failed { reason } => ("failed", Some(reason.clone())),
    };
    serde_json::json!({
        "serial": device.serial,
        "type": device.controller_type.to_string(),
        "backend": device.backend.to_string(),
        "channels": device.channels,
        "description": device.description,
        "stage": { "status": stage, "detail": detail },
    })
}

fn print_device(device: &DeviceDescriptor, detection: &StageDetection) {
    let stage = match detection {
        StageDetection::Detected { part_number, .. } => format!("stage {part_number}"),
        StageDetection::Unrecognized { part_number } => {
            format!("unrecognized stage '{part_number}'")
        }
        StageDetection::NotFitted => "no stage fitted".to_string(),
        StageDetection::NotApplicable => "stage from configuration".to_string(),
        StageDetection::Failed { reason } => format!("stage probe failed: {reason}"),
    };
    println!(
        "  {:>9}  {:<7} {:<46} {}",
        device.serial,
        device.controller_type.to_string(),
        device.description,
        stage
    );
}

async fn exercise_device(
    backend: Arc<dyn Backend>,
    device: &DeviceDescriptor,
    detection: &StageDetection,
    settings: &Settings,
) -> Result<()> {
    let controller = create_controller(backend, device.serial, settings)?;
    match controller {
        Controller::Motor(m) => {
            // Detection wins over configuration when both name a stage.
            if let StageDetection::Detected { stage, .. } = detection {
                m.bind_stage(stage);
            }
            exercise_motor(&m).await
        }
        Controller::Inertial(kim) => exercise_inertial(&kim).await,
        Controller::Piezo(p) => exercise_piezo(&p).await,
    }
}

async fn exercise_motor(m: &thorlabs_motion::controller::MotorController) -> Result<()> {
    let stage = m
        .stage_info()
        .context("No stage detected or configured; cannot exercise safely")?;
    // Stay well inside the travel range.
    let target = match stage.travel {
        Some(travel) => travel * 0.05,
        None => 10.0,
    };

    motor::with_connected(m, |m| async move {
        m.identify().await?;
        println!("  homing...");
        m.home(true, None).await?;
        println!("  moving to {target:.3} {}", stage.units.suffix());
        m.move_absolute(target, true, None).await?;
        let position = m.get_position().await?;
        println!("  at {position:.4} {}", stage.units.suffix());
        m.move_relative(-target / 2.0, true, None).await?;
        m.jog(Direction::Forward, None).await?;
        println!("  returning home");
        m.move_absolute(0.0, true, None).await?;
        Ok(())
    })
    .await?;
    Ok(())
}

async fn exercise_inertial(
    kim: &thorlabs_motion::controller::InertialController,
) -> Result<()> {
    kim.connect(None).await?;
    let result = async {
        kim.identify().await?;
        for channel in 1..=2u8 {
            println!("  channel {channel}: jog out and back");
            kim.jog(channel, Direction::Forward, Some(200)).await?;
            kim.jog(channel, Direction::Reverse, Some(200)).await?;
            kim.set_zero(channel).await?;
            kim.move_to(channel, 100, true, None).await?;
            println!(
                "  channel {channel}: at {} steps from zero",
                kim.position(channel).await?
            );
            kim.move_to(channel, 0, true, None).await?;
        }
        Ok::<(), thorlabs_motion::MotionError>(())
    }
    .await;
    kim.stop_all().await;
    kim.disconnect().await?;
    result.map_err(Into::into)
}

async fn exercise_piezo(p: &thorlabs_motion::controller::PiezoController) -> Result<()> {
    p.connect(None).await?;
    let result = async {
        p.identify().await?;
        let (_, max) = p.voltage_range();
        let target = max * 0.2;
        println!("  driving output to {target:.1} V");
        p.set_voltage(target).await?;
        let read_back = p.get_voltage().await?;
        println!("  output reads {read_back:.1} V");
        p.zero().await?;
        Ok::<(), thorlabs_motion::MotionError>(())
    }
    .await;
    p.stop().await;
    p.disconnect().await?;
    result.map_err(Into::into)
}

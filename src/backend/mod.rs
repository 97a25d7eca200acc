//! Vendor backend abstraction.
//!
//! Every controller talks to hardware through the [`Backend`] trait, which
//! models the small capability set all supported vendor stacks share:
//! enumerate, open and close sessions, issue commands, and poll status.
//! Command issuance ([`Backend::send`]) returns once the firmware accepts
//! the command, never when motion completes; completion is observed by
//! polling. [`Backend::poll_status`] is side-effect free and safe to call
//! at high frequency.
//!
//! Three implementations exist:
//!
//! - [`kinesis::KinesisBackend`]: native Kinesis SDK (feature
//!   `kinesis_hardware`),
//! - [`apt::AptBackend`]: legacy APT server (feature `apt_hardware`),
//! - [`sim::SimBackend`]: in-process simulated hardware, always available.
//!
//! The backend is chosen once per process from [`Settings`], via
//! [`for_settings`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{BackendChoice, Settings};
use crate::error::Result;

pub mod apt;
pub mod kinesis;
pub mod sim;

/// Identifies which backend a session or descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native Kinesis SDK.
    Kinesis,
    /// Legacy APT server.
    Apt,
    /// Simulated hardware.
    Simulated,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Kinesis => "kinesis",
            BackendKind::Apt => "apt",
            BackendKind::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

/// Opaque session handle returned by [`Backend::open`].
///
/// Handles are cheap to clone; all per-session state lives inside the
/// backend. A handle becomes invalid after [`Backend::close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Serial number of the opened device.
    pub serial: u32,
    /// Backend-internal session id.
    pub session: u64,
}

/// Jog/move direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward increasing position.
    Forward,
    /// Toward decreasing position.
    Reverse,
}

impl Direction {
    /// +1 for forward, -1 for reverse.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }
}

/// Drive parameters for inertial (stick-slip) channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveParams {
    /// Step rate in steps/s (1..=2000 for KIM101).
    pub step_rate: u32,
    /// Step acceleration in steps/s^2.
    pub step_acceleration: u32,
    /// Maximum drive voltage in volts (85..=125 for KIM101).
    pub max_voltage: u32,
}

impl Default for DriveParams {
    fn default() -> Self {
        Self {
            step_rate: 500,
            step_acceleration: 10_000,
            max_voltage: 112,
        }
    }
}

/// Velocity profile for servo/brushless channels, in encoder units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityParams {
    /// Maximum velocity.
    pub velocity: f64,
    /// Acceleration.
    pub acceleration: f64,
}

/// A raw command accepted by [`Backend::send`].
///
/// Positions and distances are in device units (encoder counts for servo
/// and brushless controllers, drive steps for inertial channels).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the homing sequence.
    Home,
    /// Start an absolute move.
    MoveAbsolute {
        /// Target in device units.
        counts: i64,
    },
    /// Start a relative move.
    MoveRelative {
        /// Signed distance in device units.
        counts: i64,
    },
    /// Start a fixed-size jog.
    Jog {
        /// Jog direction.
        direction: Direction,
        /// Jog size in device units.
        steps: i64,
    },
    /// Start jogging until stopped or a limit is reached.
    JogContinuous {
        /// Jog direction.
        direction: Direction,
    },
    /// Halt motion immediately.
    Stop,
    /// Flash the front panel LED.
    Identify,
    /// Enable drive output on a channel.
    EnableChannel,
    /// Disable drive output on a channel.
    DisableChannel,
    /// Redefine the current position register without moving.
    SetPositionAs {
        /// New position register value in device units.
        counts: i64,
    },
    /// Write inertial drive parameters.
    SetDriveParams(DriveParams),
    /// Set piezo output voltage.
    SetVoltage {
        /// Output voltage in volts.
        volts: f64,
    },
}

impl Command {
    /// Short command name for logging and counters.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Home => "home",
            Command::MoveAbsolute { .. } => "move_absolute",
            Command::MoveRelative { .. } => "move_relative",
            Command::Jog { .. } => "jog",
            Command::JogContinuous { .. } => "jog_continuous",
            Command::Stop => "stop",
            Command::Identify => "identify",
            Command::EnableChannel => "enable_channel",
            Command::DisableChannel => "disable_channel",
            Command::SetPositionAs { .. } => "set_position_as",
            Command::SetDriveParams(_) => "set_drive_params",
            Command::SetVoltage { .. } => "set_voltage",
        }
    }
}

/// Point-in-time hardware status for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusSnapshot {
    /// Position in device units.
    pub position: i64,
    /// Motion in progress.
    pub moving: bool,
    /// Homing sequence in progress.
    pub homing: bool,
    /// Home reference established.
    pub homed: bool,
    /// Drive output enabled.
    pub channel_enabled: bool,
    /// Hardware fault flagged by firmware.
    pub hardware_fault: bool,
    /// Forward limit switch active.
    pub forward_limit: bool,
    /// Reverse limit switch active.
    pub reverse_limit: bool,
    /// Present output voltage, for piezo drivers.
    pub output_voltage: Option<f64>,
}

/// Capability set shared by all vendor stacks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Serial numbers of all connected devices, in hardware order.
    async fn enumerate(&self) -> Result<Vec<u32>>;

    /// Open a session to a device.
    async fn open(&self, serial: u32) -> Result<DeviceHandle>;

    /// Close a session. Idempotent on an already-closed handle.
    async fn close(&self, handle: &DeviceHandle) -> Result<()>;

    /// Issue a command on a channel. Returns on firmware acceptance.
    async fn send(&self, handle: &DeviceHandle, channel: u8, command: Command) -> Result<()>;

    /// Read a status snapshot for a channel. No side effects.
    async fn poll_status(&self, handle: &DeviceHandle, channel: u8) -> Result<StatusSnapshot>;

    /// Read the position register for a channel, in device units.
    async fn read_position(&self, handle: &DeviceHandle, channel: u8) -> Result<i64>;

    /// Read the stage part number from the motor EEPROM, if one is stored.
    async fn read_eeprom(&self, handle: &DeviceHandle) -> Result<Option<String>>;

    /// Read the velocity profile for a channel.
    async fn velocity_params(&self, handle: &DeviceHandle, channel: u8) -> Result<VelocityParams>;

    /// Write the velocity profile for a channel.
    async fn set_velocity_params(
        &self,
        handle: &DeviceHandle,
        channel: u8,
        params: VelocityParams,
    ) -> Result<()>;

    /// Read the inertial drive parameters for a channel.
    async fn drive_params(&self, handle: &DeviceHandle, channel: u8) -> Result<DriveParams>;
}

/// Build the backend selected by `settings.backend`.
///
/// This is the single point of backend selection; it runs once when the
/// process wires itself up.
pub fn for_settings(settings: &Settings) -> Result<Arc<dyn Backend>> {
    match settings.backend {
        BackendChoice::Kinesis => Ok(Arc::new(kinesis::KinesisBackend::new(
            &settings.kinesis_path,
        )?)),
        BackendChoice::Apt => Ok(Arc::new(apt::AptBackend::new()?)),
        BackendChoice::Simulated => Ok(Arc::new(sim::SimBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Forward.sign(), 1);
        assert_eq!(Direction::Reverse.sign(), -1);
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::Stop.name(), "stop");
        assert_eq!(Command::MoveAbsolute { counts: 10 }.name(), "move_absolute");
    }

    #[test]
    fn test_simulated_backend_selection() {
        let settings = Settings::default();
        let backend = for_settings(&settings).unwrap();
        assert_eq!(backend.kind(), BackendKind::Simulated);
    }
}

//! Controller façades and the shared connection state machine.
//!
//! Every controller follows the same lifecycle:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> {HOMING | MOVING} -> CONNECTED
//!                                   |
//!                                 ERROR   (reachable from any connected state)
//! ```
//!
//! Motion commands are legal only in CONNECTED. A blocking motion call polls
//! hardware status at a fixed interval until the axis settles or the
//! deadline elapses; on timeout, one stop command is issued and the
//! controller enters ERROR. `stop()` is legal in every state and never
//! returns an error.
//!
//! Non-blocking motion calls leave the controller in HOMING/MOVING; any
//! status-reading call reconciles the logical state against a fresh
//! hardware snapshot. Nothing polls in the background.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::backend::{Backend, Command, DeviceHandle, StatusSnapshot};
use crate::catalog::controllers::{ControllerType, MotorClass};
use crate::catalog::stages;
use crate::config::Settings;
use crate::error::{MotionError, Result};

pub mod inertial;
pub mod motor;
pub mod piezo;

pub use inertial::InertialController;
pub use motor::MotorController;
pub use piezo::PiezoController;

/// Connection and motion state of a controller or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// No session open.
    Disconnected,
    /// Session being established.
    Connecting,
    /// Connected and idle; motion commands are legal here.
    Connected,
    /// Homing sequence in progress.
    Homing,
    /// Move in progress.
    Moving,
    /// A fault occurred; only `stop()` or `disconnect()` leave this state.
    Error,
}

impl ControllerState {
    /// States in which the controller holds an open session.
    pub fn is_connected(self) -> bool {
        !matches!(self, ControllerState::Disconnected | ControllerState::Connecting)
    }

    /// States that represent motion in progress.
    pub fn is_busy(self) -> bool {
        matches!(self, ControllerState::Homing | ControllerState::Moving)
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerState::Disconnected => "disconnected",
            ControllerState::Connecting => "connecting",
            ControllerState::Connected => "connected",
            ControllerState::Homing => "homing",
            ControllerState::Moving => "moving",
            ControllerState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Shared session plumbing for all controller façades.
///
/// Holds the backend, the open handle, and the poll tunables. The handle
/// mutex serializes raw command issuance: at most one command or query is
/// in flight per device, so a `stop()` from another task interleaves
/// cleanly with a settle poll instead of racing it.
pub(crate) struct DeviceLink {
    backend: Arc<dyn Backend>,
    serial: u32,
    handle: Mutex<Option<DeviceHandle>>,
    poll_interval: Duration,
    default_timeout: Duration,
}

impl DeviceLink {
    pub(crate) fn new(backend: Arc<dyn Backend>, serial: u32, settings: &Settings) -> Self {
        Self {
            backend,
            serial,
            handle: Mutex::new(None),
            poll_interval: settings.poll_interval(),
            default_timeout: settings.default_timeout(),
        }
    }

    pub(crate) fn serial(&self) -> u32 {
        self.serial
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    pub(crate) async fn open(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Err(MotionError::Connection(format!(
                "Device {} is already connected",
                self.serial
            )));
        }
        let handle = self.backend.open(self.serial).await?;
        *guard = Some(handle);
        Ok(())
    }

    /// Close the session. Safe to call when already closed.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            self.backend.close(&handle).await?;
        }
        Ok(())
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    fn not_connected(&self) -> MotionError {
        MotionError::Connection(format!("Device {} is not connected", self.serial))
    }

    /// Issue one command; the handle lock is held for the duration.
    pub(crate) async fn send(&self, channel: u8, command: Command) -> Result<()> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.send(handle, channel, command).await
    }

    pub(crate) async fn poll(&self, channel: u8) -> Result<StatusSnapshot> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.poll_status(handle, channel).await
    }

    pub(crate) async fn read_position(&self, channel: u8) -> Result<i64> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.read_position(handle, channel).await
    }

    pub(crate) async fn read_eeprom(&self) -> Result<Option<String>> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.read_eeprom(handle).await
    }

    pub(crate) async fn velocity_params(&self, channel: u8) -> Result<crate::backend::VelocityParams> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.velocity_params(handle, channel).await
    }

    pub(crate) async fn set_velocity_params(
        &self,
        channel: u8,
        params: crate::backend::VelocityParams,
    ) -> Result<()> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.set_velocity_params(handle, channel, params).await
    }

    pub(crate) async fn drive_params(&self, channel: u8) -> Result<crate::backend::DriveParams> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.not_connected())?;
        self.backend.drive_params(handle, channel).await
    }
}

/// Two consecutive settled polls are required before motion counts as
/// complete; a single quiet sample can be a sampling artifact between
/// profile segments.
const SETTLE_DEBOUNCE: u32 = 2;

/// Poll one channel until motion completes, the deadline elapses, or an
/// external `stop()` takes the state cell out of `busy`.
///
/// Settled means the firmware motion flags are clear and the position has
/// moved less than one device unit since the previous poll, on
/// [`SETTLE_DEBOUNCE`] consecutive polls.
///
/// On timeout: exactly one stop command goes to hardware, the state cell is
/// set to [`ControllerState::Error`], and [`MotionError::Timeout`] is
/// returned. Hardware faults reported mid-poll take the same error path
/// without the stop.
pub(crate) async fn wait_settled(
    link: &DeviceLink,
    channel: u8,
    state: &RwLock<ControllerState>,
    busy: ControllerState,
    deadline: Duration,
) -> Result<StatusSnapshot> {
    let start = Instant::now();
    let mut consecutive_settled = 0u32;
    let mut last_position: Option<i64> = None;

    loop {
        // An external stop() already returned the state to CONNECTED;
        // report the last known status as a clean completion.
        if *state.read().await != busy {
            return link.poll(channel).await;
        }

        let status = link.poll(channel).await?;

        if status.hardware_fault {
            *state.write().await = ControllerState::Error;
            return Err(MotionError::Movement(format!(
                "Hardware fault on device {} channel {channel}",
                link.serial()
            )));
        }

        let position_stable = last_position
            .map(|p| (p - status.position).abs() <= 1)
            .unwrap_or(false);
        last_position = Some(status.position);

        if !status.moving && !status.homing && position_stable {
            consecutive_settled += 1;
        } else {
            consecutive_settled = 0;
        }

        if consecutive_settled >= SETTLE_DEBOUNCE {
            return Ok(status);
        }

        if start.elapsed() > deadline {
            let elapsed = start.elapsed().as_secs_f64();
            warn!(
                "Device {} channel {channel} did not settle within {elapsed:.1} s, stopping",
                link.serial()
            );
            if let Err(e) = link.send(channel, Command::Stop).await {
                warn!("Stop after timeout failed on {}: {e}", link.serial());
            }
            *state.write().await = ControllerState::Error;
            return Err(MotionError::Timeout { elapsed });
        }

        tokio::time::sleep(link.poll_interval()).await;
    }
}

/// Read a copyable value out of a sync cell, surviving poisoning.
pub(crate) fn read_cell<T: Copy>(cell: &std::sync::RwLock<T>) -> T {
    *cell.read().unwrap_or_else(|e| e.into_inner())
}

/// Write a sync cell, surviving poisoning.
pub(crate) fn write_cell<T>(cell: &std::sync::RwLock<T>, value: T) {
    *cell.write().unwrap_or_else(|e| e.into_inner()) = value;
}

/// Leave the busy state if no stop or fault got there first.
pub(crate) async fn finish_motion(state: &RwLock<ControllerState>, busy: ControllerState) {
    let mut guard = state.write().await;
    if *guard == busy {
        *guard = ControllerState::Connected;
    }
}

/// A controller of any supported model.
pub enum Controller {
    /// Single-channel servo or brushless motor controller.
    Motor(MotorController),
    /// Four-channel piezo inertial controller.
    Inertial(InertialController),
    /// Voltage-driven piezo controller.
    Piezo(PiezoController),
}

impl Controller {
    /// Model of the underlying controller.
    pub fn controller_type(&self) -> ControllerType {
        match self {
            Controller::Motor(c) => c.controller_type(),
            Controller::Inertial(_) => ControllerType::Kim101,
            Controller::Piezo(c) => c.controller_type(),
        }
    }

    /// Serial number of the underlying controller.
    pub fn serial(&self) -> u32 {
        match self {
            Controller::Motor(c) => c.serial(),
            Controller::Inertial(c) => c.serial(),
            Controller::Piezo(c) => c.serial(),
        }
    }
}

/// Build the controller façade matching a serial number.
///
/// The model comes from the serial prefix; an unrecognized prefix is a
/// configuration error. Stage bindings come from `settings.controllers`;
/// an incompatible binding is applied anyway with a logged warning, since
/// the registry may lag behind real lab setups.
pub fn create_controller(
    backend: Arc<dyn Backend>,
    serial: u32,
    settings: &Settings,
) -> Result<Controller> {
    let controller_type = ControllerType::from_serial(serial).ok_or_else(|| {
        MotionError::Configuration(format!(
            "Serial {serial} has no recognized controller prefix"
        ))
    })?;

    debug!("Creating {controller_type} controller for serial {serial}");

    match controller_type.info().motor_class {
        MotorClass::DcServo | MotorClass::Brushless => {
            let motor = MotorController::new(backend, serial, controller_type, settings);
            if let Some(stage_name) = configured_stage(settings, serial, 1) {
                bind_stage_checked(&stage_name, controller_type, |stage| {
                    motor.bind_stage(stage)
                });
            }
            Ok(Controller::Motor(motor))
        }
        MotorClass::Inertial => {
            let inertial = InertialController::new(backend, serial, settings);
            for channel in 1..=controller_type.channel_count() {
                if let Some(stage_name) = configured_stage(settings, serial, channel) {
                    bind_stage_checked(&stage_name, controller_type, |stage| {
                        inertial.bind_stage(channel, stage)
                    });
                }
            }
            Ok(Controller::Inertial(inertial))
        }
        MotorClass::Piezo => {
            let piezo = PiezoController::new(backend, serial, controller_type, settings);
            if let Some(stage_name) = configured_stage(settings, serial, 1) {
                bind_stage_checked(&stage_name, controller_type, |stage| {
                    piezo.bind_stage(stage)
                });
            }
            Ok(Controller::Piezo(piezo))
        }
    }
}

fn configured_stage(settings: &Settings, serial: u32, channel: u8) -> Option<String> {
    settings
        .channel_config(serial, channel)
        .and_then(|c| c.stage.clone())
}

fn bind_stage_checked<F>(stage_name: &str, controller_type: ControllerType, bind: F)
where
    F: FnOnce(&'static stages::StageDescriptor),
{
    match stages::resolve(stage_name) {
        Some(stage) => {
            if !stage.compatible_with(controller_type) {
                warn!(
                    "Stage {} is not listed as compatible with {controller_type}; binding anyway",
                    stage.part_number
                );
            }
            bind(stage);
        }
        None => warn!("Configured stage '{stage_name}' is not in the catalog; ignoring"),
    }
}

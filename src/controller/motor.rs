//! Single-channel motor controller façade (KDC101, KBD101, TDC001).
//!
//! Positions at this level are in stage units (degrees or millimeters);
//! the bound [`StageDescriptor`] supplies the conversion to encoder counts.
//! Without a stage binding, position-addressed operations fail with a
//! configuration error before any hardware command is issued. `home`,
//! `stop`, and `identify` work unbound.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::{Backend, Command, Direction, StatusSnapshot, VelocityParams};
use crate::catalog::controllers::ControllerType;
use crate::catalog::stages::StageDescriptor;
use crate::config::Settings;
use crate::controller::{
    finish_motion, read_cell, wait_settled, write_cell, ControllerState, DeviceLink,
};
use crate::error::{MotionError, Result};
use std::future::Future;
use std::time::Duration;

/// Status report for a motor controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorStatus {
    /// Logical controller state after reconciliation.
    pub state: ControllerState,
    /// Position in stage units, when a stage is bound.
    pub position: Option<f64>,
    /// Home reference established.
    pub homed: bool,
    /// Hardware snapshot the report was built from.
    pub snapshot: StatusSnapshot,
}

/// Façade for one single-channel servo or brushless controller.
pub struct MotorController {
    link: DeviceLink,
    controller_type: ControllerType,
    state: RwLock<ControllerState>,
    stage: std::sync::RwLock<Option<&'static StageDescriptor>>,
    velocity_cache: std::sync::RwLock<Option<VelocityParams>>,
}

/// Motor controllers are single-channel; the channel index is fixed.
const CHANNEL: u8 = 1;

impl MotorController {
    /// Create an unconnected façade. No hardware is touched.
    pub fn new(
        backend: Arc<dyn Backend>,
        serial: u32,
        controller_type: ControllerType,
        settings: &Settings,
    ) -> Self {
        Self {
            link: DeviceLink::new(backend, serial, settings),
            controller_type,
            state: RwLock::new(ControllerState::Disconnected),
            stage: std::sync::RwLock::new(None),
            velocity_cache: std::sync::RwLock::new(None),
        }
    }

    /// Serial number of this controller.
    pub fn serial(&self) -> u32 {
        self.link.serial()
    }

    /// Model of this controller.
    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    /// Current logical state, without touching hardware.
    pub async fn state(&self) -> ControllerState {
        *self.state.read().await
    }

    /// Bind a stage descriptor, enabling unit conversion.
    pub fn bind_stage(&self, stage: &'static StageDescriptor) {
        debug!(
            "Binding stage {} to {} {}",
            stage.part_number,
            self.controller_type,
            self.serial()
        );
        write_cell(&self.stage, Some(stage));
    }

    /// The bound stage descriptor, if any.
    pub fn stage_info(&self) -> Option<&'static StageDescriptor> {
        read_cell(&self.stage)
    }

    fn stage_required(&self) -> Result<&'static StageDescriptor> {
        self.stage_info().ok_or_else(|| {
            MotionError::Configuration(format!(
                "No stage bound to {} {}; position units are undefined",
                self.controller_type,
                self.serial()
            ))
        })
    }

    /// Open a session to the controller, bounded by `timeout` or the
    /// settings default.
    ///
    /// Legal from DISCONNECTED. A vendor stack that stops answering cannot
    /// wedge the caller: when the deadline elapses the open attempt is
    /// abandoned and the controller returns to DISCONNECTED.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.is_connected() {
                return Err(MotionError::Connection(format!(
                    "Device {} is already connected",
                    self.serial()
                )));
            }
            *state = ControllerState::Connecting;
        }

        let deadline = self.link.timeout_or_default(timeout);
        match tokio::time::timeout(deadline, self.link.open()).await {
            Ok(Ok(())) => {
                *self.state.write().await = ControllerState::Connected;
                info!("Connected to {} {}", self.controller_type, self.serial());
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.write().await = ControllerState::Disconnected;
                Err(e)
            }
            Err(_) => {
                *self.state.write().await = ControllerState::Disconnected;
                Err(MotionError::Connection(format!(
                    "Connecting to {} timed out after {:.1} s",
                    self.serial(),
                    deadline.as_secs_f64()
                )))
            }
        }
    }

    /// Close the session. Legal from every state; idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.link.close().await?;
        *self.state.write().await = ControllerState::Disconnected;
        debug!("Disconnected from {}", self.serial());
        Ok(())
    }

    /// Flash the front panel LED.
    ///
    /// Legal whenever a session is open, including during motion.
    pub async fn identify(&self) -> Result<()> {
        match *self.state.read().await {
            ControllerState::Disconnected | ControllerState::Connecting => {
                Err(MotionError::Connection(format!(
                    "Device {} is not connected",
                    self.serial()
                )))
            }
            ControllerState::Error => Err(MotionError::Movement(format!(
                "Device {} is in the error state; stop() or disconnect() first",
                self.serial()
            ))),
            _ => self.link.send(CHANNEL, Command::Identify).await,
        }
    }

    /// Motion commands are legal only in CONNECTED; any other state is a
    /// movement error ("not ready"), including DISCONNECTED.
    async fn require_idle(&self) -> Result<()> {
        match *self.state.read().await {
            ControllerState::Connected => Ok(()),
            ControllerState::Error => Err(MotionError::Movement(format!(
                "Device {} is in the error state; stop() or disconnect() first",
                self.serial()
            ))),
            state => Err(MotionError::Movement(format!(
                "Device {} is not ready ({state})",
                self.serial()
            ))),
        }
    }

    async fn begin_motion(&self, busy: ControllerState, command: Command) -> Result<()> {
        self.require_idle().await?;
        *self.state.write().await = busy;
        if let Err(e) = self.link.send(CHANNEL, command).await {
            *self.state.write().await = ControllerState::Error;
            return Err(e);
        }
        Ok(())
    }

    async fn run_motion(
        &self,
        busy: ControllerState,
        command: Command,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.begin_motion(busy, command).await?;
        if !wait {
            return Ok(());
        }
        let deadline = self.link.timeout_or_default(timeout);
        wait_settled(&self.link, CHANNEL, &self.state, busy, deadline).await?;
        finish_motion(&self.state, busy).await;
        Ok(())
    }

    /// Run the homing sequence.
    ///
    /// With `wait`, blocks until the home reference is established or the
    /// deadline elapses. Without, returns after command acceptance and
    /// leaves the controller in HOMING.
    pub async fn home(&self, wait: bool, timeout: Option<Duration>) -> Result<()> {
        info!("Homing {} {}", self.controller_type, self.serial());
        self.run_motion(ControllerState::Homing, Command::Home, wait, timeout)
            .await
    }

    /// Move to an absolute position in stage units.
    pub async fn move_absolute(
        &self,
        position: f64,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let stage = self.stage_required()?;
        stage.check_travel(position)?;
        let counts = stage.to_counts(position)?;
        debug!(
            "Move {} to {position:.4} {} ({counts} counts)",
            self.serial(),
            stage.units.suffix()
        );
        self.run_motion(
            ControllerState::Moving,
            Command::MoveAbsolute { counts },
            wait,
            timeout,
        )
        .await
    }

    /// Move by a signed distance in stage units.
    pub async fn move_relative(
        &self,
        distance: f64,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let stage = self.stage_required()?;
        let counts = stage.to_counts(distance)?;
        self.run_motion(
            ControllerState::Moving,
            Command::MoveRelative { counts },
            wait,
            timeout,
        )
        .await
    }

    /// Jog by one step in the given direction, blocking until settled.
    ///
    /// The step defaults to the stage's jog step.
    pub async fn jog(&self, direction: Direction, step: Option<f64>) -> Result<()> {
        let stage = self.stage_required()?;
        let step_units = step.unwrap_or(stage.jog_step_default);
        if step_units <= 0.0 {
            return Err(MotionError::Configuration(format!(
                "Jog step must be positive, got {step_units}"
            )));
        }
        let steps = stage.to_counts(step_units)?;
        self.run_motion(
            ControllerState::Moving,
            Command::Jog { direction, steps },
            true,
            None,
        )
        .await
    }

    /// Halt motion immediately. Never fails.
    ///
    /// From HOMING/MOVING/ERROR a successful halt returns the controller to
    /// CONNECTED. A failed halt command degrades to ERROR with a logged
    /// warning. A no-op when disconnected.
    pub async fn stop(&self) {
        if !self.link.is_open().await {
            return;
        }
        match self.link.send(CHANNEL, Command::Stop).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                if state.is_busy() || *state == ControllerState::Error {
                    *state = ControllerState::Connected;
                }
            }
            Err(e) => {
                warn!("Stop failed on {}: {e}", self.serial());
                *self.state.write().await = ControllerState::Error;
            }
        }
    }

    /// Reconcile the logical state against one fresh hardware snapshot.
    ///
    /// After a non-blocking motion call this is how HOMING/MOVING resolve
    /// back to CONNECTED. Also invoked implicitly by the status readers.
    pub async fn poll_once(&self) -> Result<StatusSnapshot> {
        let snapshot = self.link.poll(CHANNEL).await?;
        let mut state = self.state.write().await;
        if snapshot.hardware_fault {
            *state = ControllerState::Error;
        } else if state.is_busy() && !snapshot.moving && !snapshot.homing {
            *state = ControllerState::Connected;
        }
        Ok(snapshot)
    }

    /// Current position in stage units.
    pub async fn get_position(&self) -> Result<f64> {
        let stage = self.stage_required()?;
        let snapshot = self.poll_once().await?;
        stage.to_units(snapshot.position)
    }

    /// Full status report, reconciling the state machine on the way.
    pub async fn get_status(&self) -> Result<MotorStatus> {
        let snapshot = self.poll_once().await?;
        let position = match self.stage_info() {
            Some(stage) => Some(stage.to_units(snapshot.position)?),
            None => None,
        };
        Ok(MotorStatus {
            state: *self.state.read().await,
            position,
            homed: snapshot.homed,
            snapshot,
        })
    }

    /// Whether the home reference is established.
    pub async fn is_homed(&self) -> Result<bool> {
        Ok(self.poll_once().await?.homed)
    }

    /// Velocity profile, read from hardware and cached.
    pub async fn get_velocity_params(&self) -> Result<VelocityParams> {
        let params = self.link.velocity_params(CHANNEL).await?;
        write_cell(&self.velocity_cache, Some(params));
        Ok(params)
    }

    /// Set the maximum velocity, clamped to the stage ceiling when bound.
    pub async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if velocity <= 0.0 {
            return Err(MotionError::Configuration(format!(
                "Velocity must be positive, got {velocity}"
            )));
        }
        let mut velocity = velocity;
        if let Some(max) = self.stage_info().and_then(|s| s.velocity_max) {
            if velocity > max {
                warn!(
                    "Velocity {velocity} exceeds stage maximum {max} on {}; clamping",
                    self.serial()
                );
                velocity = max;
            }
        }
        let mut params = match read_cell(&self.velocity_cache) {
            Some(params) => params,
            None => self.get_velocity_params().await?,
        };
        params.velocity = velocity;
        self.link.set_velocity_params(CHANNEL, params).await?;
        write_cell(&self.velocity_cache, Some(params));
        Ok(())
    }

    /// Set the acceleration, clamped to the stage ceiling when bound.
    pub async fn set_acceleration(&self, acceleration: f64) -> Result<()> {
        if acceleration <= 0.0 {
            return Err(MotionError::Configuration(format!(
                "Acceleration must be positive, got {acceleration}"
            )));
        }
        let mut acceleration = acceleration;
        if let Some(max) = self.stage_info().and_then(|s| s.acceleration_max) {
            if acceleration > max {
                warn!(
                    "Acceleration {acceleration} exceeds stage maximum {max} on {}; clamping",
                    self.serial()
                );
                acceleration = max;
            }
        }
        let mut params = match read_cell(&self.velocity_cache) {
            Some(params) => params,
            None => self.get_velocity_params().await?,
        };
        params.acceleration = acceleration;
        self.link.set_velocity_params(CHANNEL, params).await?;
        write_cell(&self.velocity_cache, Some(params));
        Ok(())
    }

    /// Read the stage part number stored in the motor EEPROM.
    pub async fn read_stage_eeprom(&self) -> Result<Option<String>> {
        self.link.read_eeprom().await
    }
}

/// Run `body` against a connected controller, disconnecting on every exit
/// path, including errors from `connect` itself being propagated before
/// `body` runs.
pub async fn with_connected<'a, T, Fut>(
    motor: &'a MotorController,
    body: impl FnOnce(&'a MotorController) -> Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>> + 'a,
{
    motor.connect(None).await?;
    let result = body(motor).await;
    let disconnect_result = motor.disconnect().await;
    match result {
        Ok(value) => {
            disconnect_result?;
            Ok(value)
        }
        // The body error wins over a secondary disconnect failure.
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimFaults};
    use crate::catalog::stages;

    fn fast_settings() -> Settings {
        Settings {
            poll_interval_ms: 2,
            ..Settings::default()
        }
    }

    fn motor_with_sim(serial: u32) -> (Arc<SimBackend>, MotorController) {
        let backend = Arc::new(SimBackend::new());
        backend.add_device(serial, Some("PRM1Z8"));
        let motor = MotorController::new(
            backend.clone(),
            serial,
            ControllerType::Kdc101,
            &fast_settings(),
        );
        (backend, motor)
    }

    #[tokio::test]
    async fn test_connect_disconnect_lifecycle() {
        let (_backend, motor) = motor_with_sim(27_000_001);
        assert_eq!(motor.state().await, ControllerState::Disconnected);

        motor.connect(None).await.unwrap();
        assert_eq!(motor.state().await, ControllerState::Connected);

        // Double connect is rejected.
        assert!(motor.connect(None).await.is_err());

        motor.disconnect().await.unwrap();
        assert_eq!(motor.state().await, ControllerState::Disconnected);
        // Disconnect is idempotent.
        motor.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_move_requires_stage_binding() {
        let backend = Arc::new(SimBackend::new());
        backend.add_device(27_000_002, None);
        let motor = MotorController::new(
            backend.clone(),
            27_000_002,
            ControllerType::Kdc101,
            &fast_settings(),
        );
        motor.connect(None).await.unwrap();

        let err = motor.move_absolute(10.0, true, None).await.unwrap_err();
        assert!(matches!(err, MotionError::Configuration(_)));
        // The precondition failure must not reach hardware.
        assert_eq!(backend.total_sends(27_000_002), 0);
    }

    #[tokio::test]
    async fn test_home_then_move() {
        let (backend, motor) = motor_with_sim(27_000_003);
        motor.bind_stage(stages::resolve("PRM1Z8").unwrap());
        motor.connect(None).await.unwrap();

        motor.home(true, None).await.unwrap();
        assert!(motor.is_homed().await.unwrap());
        assert_eq!(motor.state().await, ControllerState::Connected);

        motor.move_absolute(45.0, true, None).await.unwrap();
        let position = motor.get_position().await.unwrap();
        assert!((position - 45.0).abs() < 1.0 / 1919.64);

        assert_eq!(backend.send_count(27_000_003, "home"), 1);
        assert_eq!(backend.send_count(27_000_003, "move_absolute"), 1);
    }

    #[tokio::test]
    async fn test_non_blocking_move_reconciles_lazily() {
        let (_backend, motor) = motor_with_sim(27_000_004);
        motor.bind_stage(stages::resolve("PRM1Z8").unwrap());
        motor.connect(None).await.unwrap();

        motor.move_absolute(10.0, false, None).await.unwrap();
        assert_eq!(motor.state().await, ControllerState::Moving);

        // A second motion command while busy is rejected without hardware
        // traffic.
        let err = motor.move_absolute(20.0, true, None).await.unwrap_err();
        assert!(matches!(err, MotionError::Movement(_)));

        // Once the simulated axis arrives, any status read reconciles.
        tokio::time::sleep(Duration::from_millis(30)).await;
        motor.poll_once().await.unwrap();
        assert_eq!(motor.state().await, ControllerState::Connected);
    }

    #[tokio::test]
    async fn test_travel_limit_is_checked_before_send() {
        let backend = Arc::new(SimBackend::new());
        backend.add_device(27_000_005, None);
        let motor = MotorController::new(
            backend.clone(),
            27_000_005,
            ControllerType::Kdc101,
            &fast_settings(),
        );
        motor.bind_stage(stages::resolve("Z825B").unwrap());
        motor.connect(None).await.unwrap();

        assert!(motor.move_absolute(30.0, true, None).await.is_err());
        assert_eq!(backend.total_sends(27_000_005), 0);
    }

    #[tokio::test]
    async fn test_scoped_connection_disconnects_on_error() {
        let (_backend, motor) = motor_with_sim(27_000_006);
        motor.bind_stage(stages::resolve("PRM1Z8").unwrap());

        let result: Result<()> = with_connected(&motor, |m| async move {
            m.home(true, None).await?;
            Err(MotionError::Movement("synthetic failure".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(motor.state().await, ControllerState::Disconnected);
    }

    #[tokio::test]
    async fn test_identify_is_legal_while_moving() {
        let (backend, motor) = motor_with_sim(27_000_008);
        motor.bind_stage(stages::resolve("PRM1Z8").unwrap());
        backend.set_faults(
            27_000_008,
            SimFaults {
                never_settle: true,
                ..SimFaults::default()
            },
        );
        motor.connect(None).await.unwrap();

        motor.move_absolute(10.0, false, None).await.unwrap();
        assert_eq!(motor.state().await, ControllerState::Moving);

        motor.identify().await.unwrap();
        assert_eq!(backend.send_count(27_000_008, "identify"), 1);

        motor.stop().await;
    }

    #[tokio::test]
    async fn test_velocity_params_round_trip() {
        let (_backend, motor) = motor_with_sim(27_000_007);
        motor.bind_stage(stages::resolve("PRM1Z8").unwrap());
        motor.connect(None).await.unwrap();

        motor.set_velocity(20.0).await.unwrap();
        let params = motor.get_velocity_params().await.unwrap();
        assert!((params.velocity - 20.0).abs() < f64::EPSILON);

        // Above the PRM1Z8 ceiling of 25 deg/s the request is clamped.
        motor.set_velocity(100.0).await.unwrap();
        let params = motor.get_velocity_params().await.unwrap();
        assert!((params.velocity - 25.0).abs() < f64::EPSILON);

        assert!(motor.set_velocity(-1.0).await.is_err());
    }
}

//! Four-channel piezo inertial controller façade (KIM101).
//!
//! One device session is shared by four logically independent channels.
//! Each channel has its own state machine, zero reference, and stage
//! binding; a blocking wait on one channel never blocks commands on the
//! others. What is serialized is raw command issuance: the shared handle
//! admits one in-flight hardware transaction at a time.
//!
//! Inertial actuators are open loop. Positions are drive-step counts, and
//! `set_zero` is purely logical: it records the current raw step count as
//! the channel's reference without sending anything to hardware or moving
//! the actuator. `redefine_position` is the hardware-register counterpart
//! for workflows that want the device's own counter rewritten.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::backend::{Backend, Command, Direction, DriveParams};
use crate::catalog::stages::StageDescriptor;
use crate::config::Settings;
use crate::controller::{
    finish_motion, read_cell, wait_settled, write_cell, ControllerState, DeviceLink,
};
use crate::error::{MotionError, Result};

/// Number of channels on a KIM101.
pub const CHANNEL_COUNT: u8 = 4;

/// KIM101 drive voltage limits in volts.
const VOLTAGE_RANGE: (u32, u32) = (85, 125);

/// Status report for one inertial channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Logical channel state after reconciliation.
    pub state: ControllerState,
    /// Drive output enabled.
    pub enabled: bool,
    /// Raw hardware step count.
    pub raw_position: i64,
    /// Step count relative to the logical zero reference.
    pub position: i64,
    /// Motion in progress.
    pub moving: bool,
}

struct ChannelCell {
    state: RwLock<ControllerState>,
    zero: std::sync::RwLock<i64>,
    stage: std::sync::RwLock<Option<&'static StageDescriptor>>,
}

impl ChannelCell {
    fn new() -> Self {
        Self {
            state: RwLock::new(ControllerState::Disconnected),
            zero: std::sync::RwLock::new(0),
            stage: std::sync::RwLock::new(None),
        }
    }
}

/// Façade for one KIM101 inertial motor controller.
pub struct InertialController {
    link: DeviceLink,
    device_state: RwLock<ControllerState>,
    channels: [ChannelCell; CHANNEL_COUNT as usize],
}

impl InertialController {
    /// Create an unconnected façade. No hardware is touched.
    pub fn new(backend: Arc<dyn Backend>, serial: u32, settings: &Settings) -> Self {
        Self {
            link: DeviceLink::new(backend, serial, settings),
            device_state: RwLock::new(ControllerState::Disconnected),
            channels: [
                ChannelCell::new(),
                ChannelCell::new(),
                ChannelCell::new(),
                ChannelCell::new(),
            ],
        }
    }

    /// Serial number of this controller.
    pub fn serial(&self) -> u32 {
        self.link.serial()
    }

    fn cell(&self, channel: u8) -> Result<&ChannelCell> {
        if channel == 0 || channel > CHANNEL_COUNT {
            return Err(MotionError::Configuration(format!(
                "KIM101 channels are 1..={CHANNEL_COUNT}, got {channel}"
            )));
        }
        Ok(&self.channels[channel as usize - 1])
    }

    /// Bind a stage descriptor to one channel.
    pub fn bind_stage(&self, channel: u8, stage: &'static StageDescriptor) {
        if let Ok(cell) = self.cell(channel) {
            debug!(
                "Binding stage {} to KIM101 {} channel {channel}",
                stage.part_number,
                self.serial()
            );
            write_cell(&cell.stage, Some(stage));
        }
    }

    /// The stage bound to one channel, if any.
    pub fn stage_info(&self, channel: u8) -> Result<Option<&'static StageDescriptor>> {
        Ok(read_cell(&self.cell(channel)?.stage))
    }

    /// Device-level connection state.
    pub async fn state(&self) -> ControllerState {
        *self.device_state.read().await
    }

    /// Logical state of one channel.
    pub async fn channel_state(&self, channel: u8) -> Result<ControllerState> {
        Ok(*self.cell(channel)?.state.read().await)
    }

    /// Open the shared device session and mark all channels idle, bounded
    /// by `timeout` or the settings default.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.device_state.write().await;
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
                *self.device_state.write().await = ControllerState::Connected;
                for cell in &self.channels {
                    *cell.state.write().await = ControllerState::Connected;
                }
                info!("Connected to KIM101 {}", self.serial());
                Ok(())
            }
            Ok(Err(e)) => {
                *self.device_state.write().await = ControllerState::Disconnected;
                Err(e)
            }
            Err(_) => {
                *self.device_state.write().await = ControllerState::Disconnected;
                Err(MotionError::Connection(format!(
                    "Connecting to {} timed out after {:.1} s",
                    self.serial(),
                    deadline.as_secs_f64()
                )))
            }
        }
    }

    /// Close the shared session. All channels return to DISCONNECTED.
    pub async fn disconnect(&self) -> Result<()> {
        self.link.close().await?;
        *self.device_state.write().await = ControllerState::Disconnected;
        for cell in &self.channels {
            *cell.state.write().await = ControllerState::Disconnected;
        }
        debug!("Disconnected from KIM101 {}", self.serial());
        Ok(())
    }

    /// Flash the front panel LED.
    pub async fn identify(&self) -> Result<()> {
        self.require_device_connected().await?;
        self.link.send(1, Command::Identify).await
    }

    async fn require_device_connected(&self) -> Result<()> {
        if self.device_state.read().await.is_connected() {
            Ok(())
        } else {
            Err(MotionError::Connection(format!(
                "Device {} is not connected",
                self.serial()
            )))
        }
    }

    /// Motion commands are legal only on an idle connected channel; any
    /// other state, including a disconnected device, is a movement error.
    async fn require_channel_idle(&self, channel: u8) -> Result<&ChannelCell> {
        let cell = self.cell(channel)?;
        if !self.device_state.read().await.is_connected() {
            return Err(MotionError::Movement(format!(
                "Device {} is not ready (disconnected)",
                self.serial()
            )));
        }
        match *cell.state.read().await {
            ControllerState::Connected => Ok(cell),
            ControllerState::Error => Err(MotionError::Movement(format!(
                "Channel {channel} of {} is in the error state; stop() first",
                self.serial()
            ))),
            state => Err(MotionError::Movement(format!(
                "Channel {channel} of {} is not ready ({state})",
                self.serial()
            ))),
        }
    }

    async fn run_channel_motion(
        &self,
        channel: u8,
        command: Command,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let cell = self.require_channel_idle(channel).await?;
        *cell.state.write().await = ControllerState::Moving;
        if let Err(e) = self.link.send(channel, command).await {
            *cell.state.write().await = ControllerState::Error;
            return Err(e);
        }
        if !wait {
            return Ok(());
        }
        let deadline = self.link.timeout_or_default(timeout);
        wait_settled(
            &self.link,
            channel,
            &cell.state,
            ControllerState::Moving,
            deadline,
        )
        .await?;
        finish_motion(&cell.state, ControllerState::Moving).await;
        Ok(())
    }

    /// Jog one channel by a step count, blocking until settled.
    ///
    /// The step defaults to the bound stage's jog step (100 steps for PIA
    /// actuators) or 100 when unbound.
    pub async fn jog(&self, channel: u8, direction: Direction, steps: Option<i64>) -> Result<()> {
        let default_steps = self
            .stage_info(channel)?
            .map(|s| s.jog_step_default as i64)
            .unwrap_or(100);
        let steps = steps.unwrap_or(default_steps);
        if steps <= 0 {
            return Err(MotionError::Configuration(format!(
                "Jog step count must be positive, got {steps}"
            )));
        }
        self.run_channel_motion(channel, Command::Jog { direction, steps }, true, None)
            .await
    }

    /// Start continuous jogging on one channel. Returns immediately; the
    /// channel stays MOVING until `stop` or a limit.
    pub async fn jog_continuous(&self, channel: u8, direction: Direction) -> Result<()> {
        self.run_channel_motion(channel, Command::JogContinuous { direction }, false, None)
            .await
    }

    /// Move one channel to an absolute logical position in steps.
    ///
    /// The logical position is relative to the channel's zero reference.
    pub async fn move_to(
        &self,
        channel: u8,
        position: i64,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let zero = read_cell(&self.cell(channel)?.zero);
        let counts = position + zero;
        self.run_channel_motion(channel, Command::MoveAbsolute { counts }, wait, timeout)
            .await
    }

    /// Move one channel by a signed step count.
    pub async fn move_by(
        &self,
        channel: u8,
        steps: i64,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.run_channel_motion(channel, Command::MoveRelative { counts: steps }, wait, timeout)
            .await
    }

    /// Halt one channel immediately. Never fails.
    pub async fn stop(&self, channel: u8) {
        let Ok(cell) = self.cell(channel) else {
            return;
        };
        if !self.link.is_open().await {
            return;
        }
        match self.link.send(channel, Command::Stop).await {
            Ok(()) => {
                let mut state = cell.state.write().await;
                if state.is_busy() || *state == ControllerState::Error {
                    *state = ControllerState::Connected;
                }
            }
            Err(e) => {
                warn!("Stop failed on {} channel {channel}: {e}", self.serial());
                *cell.state.write().await = ControllerState::Error;
            }
        }
    }

    /// Halt all four channels.
    pub async fn stop_all(&self) {
        futures::future::join_all((1..=CHANNEL_COUNT).map(|channel| self.stop(channel))).await;
    }

    /// Record the current raw step count as the channel's zero reference.
    ///
    /// Logical bookkeeping only: no hardware command is issued and the
    /// actuator does not move.
    pub async fn set_zero(&self, channel: u8) -> Result<()> {
        self.require_device_connected().await?;
        let raw = self.link.read_position(channel).await?;
        write_cell(&self.cell(channel)?.zero, raw);
        debug!(
            "Zero reference of {} channel {channel} set to raw {raw}",
            self.serial()
        );
        Ok(())
    }

    /// Rewrite the device's own position register without moving.
    ///
    /// The channel's logical zero reference is cleared, so logical and raw
    /// positions coincide afterwards.
    pub async fn redefine_position(&self, channel: u8, counts: i64) -> Result<()> {
        let cell = self.require_channel_idle(channel).await?;
        self.link
            .send(channel, Command::SetPositionAs { counts })
            .await?;
        write_cell(&cell.zero, 0);
        Ok(())
    }

    /// Logical position of one channel: raw steps minus the zero reference.
    pub async fn position(&self, channel: u8) -> Result<i64> {
        self.require_device_connected().await?;
        let zero = read_cell(&self.cell(channel)?.zero);
        let raw = self.reconcile(channel).await?.position;
        Ok(raw - zero)
    }

    /// Logical position converted to millimeters via the stage step size.
    pub async fn position_mm(&self, channel: u8) -> Result<f64> {
        let step_size = self
            .stage_info(channel)?
            .and_then(|s| s.step_size)
            .ok_or_else(|| {
                MotionError::Configuration(format!(
                    "Channel {channel} of {} has no stage with a step size",
                    self.serial()
                ))
            })?;
        Ok(self.position(channel).await? as f64 * step_size)
    }

    /// Enable drive output on one channel.
    pub async fn enable_channel(&self, channel: u8) -> Result<()> {
        self.require_device_connected().await?;
        self.cell(channel)?;
        self.link.send(channel, Command::EnableChannel).await
    }

    /// Disable drive output on one channel.
    pub async fn disable_channel(&self, channel: u8) -> Result<()> {
        self.require_device_connected().await?;
        self.cell(channel)?;
        self.link.send(channel, Command::DisableChannel).await
    }

    /// Write drive parameters for one channel, validated against the
    /// KIM101 voltage range and the stage's step-rate ceiling.
    pub async fn set_drive_params(&self, channel: u8, params: DriveParams) -> Result<()> {
        self.require_device_connected().await?;
        let cell = self.cell(channel)?;

        if params.max_voltage < VOLTAGE_RANGE.0 || params.max_voltage > VOLTAGE_RANGE.1 {
            return Err(MotionError::Configuration(format!(
                "Drive voltage {} V outside {}..={} V",
                params.max_voltage, VOLTAGE_RANGE.0, VOLTAGE_RANGE.1
            )));
        }
        if params.step_rate == 0 {
            return Err(MotionError::Configuration(
                "Step rate must be positive".to_string(),
            ));
        }
        if let Some(max_rate) = read_cell(&cell.stage).and_then(|s| s.step_rate_max) {
            if params.step_rate > max_rate {
                return Err(MotionError::Configuration(format!(
                    "Step rate {} exceeds stage maximum {max_rate}",
                    params.step_rate
                )));
            }
        }

        self.link
            .send(channel, Command::SetDriveParams(params))
            .await
    }

    /// Read drive parameters for one channel.
    pub async fn drive_params(&self, channel: u8) -> Result<DriveParams> {
        self.require_device_connected().await?;
        self.cell(channel)?;
        self.link.drive_params(channel).await
    }

    /// Jog continuously until motion stops at a physical limit.
    ///
    /// Open-loop actuators have no limit switches the firmware reports
    /// uniformly, so "limit reached" is observed as motion ceasing while
    /// the jog is still commanded. If the deadline elapses first, one stop
    /// is issued and a timeout error is returned.
    pub async fn move_to_limit(
        &self,
        channel: u8,
        direction: Direction,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let cell = self.require_channel_idle(channel).await?;
        *cell.state.write().await = ControllerState::Moving;
        if let Err(e) = self
            .link
            .send(channel, Command::JogContinuous { direction })
            .await
        {
            *cell.state.write().await = ControllerState::Error;
            return Err(e);
        }

        let deadline = self.link.timeout_or_default(timeout);
        let start = Instant::now();
        loop {
            if *cell.state.read().await != ControllerState::Moving {
                // Externally stopped; treat as a clean exit.
                return Ok(());
            }
            let status = self.link.poll(channel).await?;
            if !status.moving || status.forward_limit || status.reverse_limit {
                self.stop(channel).await;
                return Ok(());
            }
            if start.elapsed() > deadline {
                let elapsed = start.elapsed().as_secs_f64();
                warn!(
                    "Limit search on {} channel {channel} timed out after {elapsed:.1} s",
                    self.serial()
                );
                if let Err(e) = self.link.send(channel, Command::Stop).await {
                    warn!("Stop after timeout failed on {}: {e}", self.serial());
                }
                *cell.state.write().await = ControllerState::Error;
                return Err(MotionError::Timeout { elapsed });
            }
            tokio::time::sleep(self.link.poll_interval()).await;
        }
    }

    async fn reconcile(&self, channel: u8) -> Result<crate::backend::StatusSnapshot> {
        let snapshot = self.link.poll(channel).await?;
        let cell = self.cell(channel)?;
        let mut state = cell.state.write().await;
        if snapshot.hardware_fault {
            *state = ControllerState::Error;
        } else if state.is_busy() && !snapshot.moving {
            *state = ControllerState::Connected;
        }
        Ok(snapshot)
    }

    /// Full status report for one channel.
    pub async fn status(&self, channel: u8) -> Result<ChannelStatus> {
        self.require_device_connected().await?;
        let snapshot = self.reconcile(channel).await?;
        let cell = self.cell(channel)?;
        let zero = read_cell(&cell.zero);
        Ok(ChannelStatus {
            state: *cell.state.read().await,
            enabled: snapshot.channel_enabled,
            raw_position: snapshot.position,
            position: snapshot.position - zero,
            moving: snapshot.moving,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;

    fn fast_settings() -> Settings {
        Settings {
            poll_interval_ms: 2,
            default_timeout_s: 1.0,
            ..Settings::default()
        }
    }

    fn kim_with_sim(serial: u32) -> (Arc<SimBackend>, InertialController) {
        let backend = Arc::new(SimBackend::new());
        backend.add_device(serial, None);
        let kim = InertialController::new(backend.clone(), serial, &fast_settings());
        (backend, kim)
    }

    #[tokio::test]
    async fn test_channel_validation() {
        let (_backend, kim) = kim_with_sim(97_000_001);
        kim.connect(None).await.unwrap();

        assert!(kim.jog(0, Direction::Forward, None).await.is_err());
        assert!(kim.jog(5, Direction::Forward, None).await.is_err());
        assert!(kim.channel_state(4).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_zero_is_logical_only() {
        let (backend, kim) = kim_with_sim(97_000_002);
        kim.connect(None).await.unwrap();
        backend.set_position(97_000_002, 2, 500);

        let before = backend.total_sends(97_000_002);
        kim.set_zero(2).await.unwrap();
        // No hardware command may be issued by set_zero.
        assert_eq!(backend.total_sends(97_000_002), before);

        assert_eq!(kim.position(2).await.unwrap(), 0);
        let status = kim.status(2).await.unwrap();
        assert_eq!(status.raw_position, 500);
        assert_eq!(status.position, 0);
    }

    #[tokio::test]
    async fn test_move_to_respects_zero_reference() {
        let (_backend, kim) = kim_with_sim(97_000_003);
        kim.connect(None).await.unwrap();

        kim.move_by(1, 300, true, None).await.unwrap();
        kim.set_zero(1).await.unwrap();

        // Logical 100 is raw 400.
        kim.move_to(1, 100, true, None).await.unwrap();
        let status = kim.status(1).await.unwrap();
        assert_eq!(status.raw_position, 400);
        assert_eq!(status.position, 100);
    }

    #[tokio::test]
    async fn test_redefine_position_rewrites_register() {
        let (backend, kim) = kim_with_sim(97_000_004);
        kim.connect(None).await.unwrap();
        backend.set_position(97_000_004, 1, 750);

        kim.redefine_position(1, 0).await.unwrap();
        assert_eq!(backend.send_count(97_000_004, "set_position_as"), 1);
        assert_eq!(kim.position(1).await.unwrap(), 0);
        let status = kim.status(1).await.unwrap();
        assert_eq!(status.raw_position, 0);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let (_backend, kim) = kim_with_sim(97_000_005);
        kim.connect(None).await.unwrap();

        // Channel 1 jogs continuously and stays busy.
        kim.jog_continuous(1, Direction::Forward).await.unwrap();
        assert_eq!(
            kim.channel_state(1).await.unwrap(),
            ControllerState::Moving
        );

        // Channel 2 completes a blocking move meanwhile.
        kim.move_to(2, 50, true, None).await.unwrap();
        assert_eq!(
            kim.channel_state(2).await.unwrap(),
            ControllerState::Connected
        );
        assert_eq!(
            kim.channel_state(1).await.unwrap(),
            ControllerState::Moving
        );

        kim.stop(1).await;
        assert_eq!(
            kim.channel_state(1).await.unwrap(),
            ControllerState::Connected
        );
    }

    #[tokio::test]
    async fn test_disconnected_motion_is_a_movement_error() {
        let (backend, kim) = kim_with_sim(97_000_008);

        let err = kim.move_to(1, 10, true, None).await.unwrap_err();
        assert!(matches!(err, MotionError::Movement(_)));
        let err = kim.jog(2, Direction::Forward, None).await.unwrap_err();
        assert!(matches!(err, MotionError::Movement(_)));
        assert_eq!(backend.total_sends(97_000_008), 0);
    }

    #[tokio::test]
    async fn test_busy_channel_rejects_commands_without_sends() {
        let (backend, kim) = kim_with_sim(97_000_006);
        kim.connect(None).await.unwrap();

        kim.jog_continuous(3, Direction::Reverse).await.unwrap();
        let sends_before = backend.total_sends(97_000_006);

        let err = kim.move_to(3, 10, true, None).await.unwrap_err();
        assert!(matches!(err, MotionError::Movement(_)));
        assert_eq!(backend.total_sends(97_000_006), sends_before);

        kim.stop(3).await;
    }

    #[tokio::test]
    async fn test_drive_param_validation() {
        let (backend, kim) = kim_with_sim(97_000_007);
        kim.connect(None).await.unwrap();
        kim.bind_stage(1, crate::catalog::stages::resolve("PIA13").unwrap());

        let sends_before = backend.total_sends(97_000_007);

        // Voltage outside 85..=125 V is rejected before any send.
        let err = kim
            .set_drive_params(
                1,
                DriveParams {
                    step_rate: 500,
                    step_acceleration: 10_000,
                    max_voltage: 130,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::Configuration(_)));

        // Step rate above the PIA13 ceiling of 2000 steps/s is rejected.
        let err = kim
            .set_drive_params(
                1,
                DriveParams {
                    step_rate: 2500,
                    step_acceleration: 10_000,
                    max_voltage: 110,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::Configuration(_)));
        assert_eq!(backend.total_sends(97_000_007), sends_before);

        let params = DriveParams {
            step_rate: 1000,
            step_acceleration: 20_000,
            max_voltage: 110,
        };
        kim.set_drive_params(1, params).await.unwrap();
        assert_eq!(kim.drive_params(1).await.unwrap(), params);
    }
}

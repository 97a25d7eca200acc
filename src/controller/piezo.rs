//! Voltage-driven piezo controller façade (KPZ101 and TPZ001).
//!
//! These drivers command an output voltage rather than a position. Without
//! a strain-gauge reader in the loop there is no closed-loop position, so
//! the primary surface is voltage: set, clamp, read back, and zero. When a
//! bound stage defines a travel and the device has a position register
//! (strain-gauge feedback fitted), `set_position`/`get_position` expose it
//! in stage units.
//!
//! Voltage commands apply near-instantaneously; there is no settling loop
//! and no HOMING or MOVING state for these devices.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::{Backend, Command};
use crate::catalog::controllers::ControllerType;
use crate::catalog::stages::StageDescriptor;
use crate::config::Settings;
use crate::controller::{read_cell, write_cell, ControllerState, DeviceLink};
use crate::error::{MotionError, Result};

/// Output channel; KPZ101 and TPZ001 are single-channel.
const CHANNEL: u8 = 1;

/// Output range assumed when no stage is bound. 75 V is the lowest range
/// either driver supports, so it is always safe.
const DEFAULT_VOLTAGE_RANGE: (f64, f64) = (0.0, 75.0);

/// Status report for a piezo driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiezoStatus {
    /// Logical controller state.
    pub state: ControllerState,
    /// Present output voltage, if the driver reports one.
    pub output_voltage: Option<f64>,
    /// Drive output enabled.
    pub enabled: bool,
}

/// Façade for one voltage-driven piezo controller.
pub struct PiezoController {
    link: DeviceLink,
    controller_type: ControllerType,
    state: RwLock<ControllerState>,
    stage: std::sync::RwLock<Option<&'static StageDescriptor>>,
}

impl PiezoController {
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

    /// Current logical state.
    pub async fn state(&self) -> ControllerState {
        *self.state.read().await
    }

    /// Bind an actuator descriptor, fixing the voltage range and travel.
    pub fn bind_stage(&self, stage: &'static StageDescriptor) {
        debug!(
            "Binding actuator {} to {} {}",
            stage.part_number,
            self.controller_type,
            self.serial()
        );
        write_cell(&self.stage, Some(stage));
    }

    /// The bound actuator descriptor, if any.
    pub fn stage_info(&self) -> Option<&'static StageDescriptor> {
        read_cell(&self.stage)
    }

    /// Output voltage range: the bound actuator's, or 0..75 V unbound.
    pub fn voltage_range(&self) -> (f64, f64) {
        self.stage_info()
            .and_then(|s| s.voltage_range)
            .unwrap_or(DEFAULT_VOLTAGE_RANGE)
    }

    /// Open a session to the device, bounded by `timeout` or the settings
    /// default.
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

    /// Close the session. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        self.link.close().await?;
        *self.state.write().await = ControllerState::Disconnected;
        debug!("Disconnected from {}", self.serial());
        Ok(())
    }

    /// Flash the front panel LED.
    pub async fn identify(&self) -> Result<()> {
        self.require_connected().await?;
        self.link.send(CHANNEL, Command::Identify).await
    }

    async fn require_connected(&self) -> Result<()> {
        match *self.state.read().await {
            ControllerState::Connected => Ok(()),
            ControllerState::Error => Err(MotionError::Movement(format!(
                "Device {} is in the error state; stop() or disconnect() first",
                self.serial()
            ))),
            _ => Err(MotionError::Connection(format!(
                "Device {} is not connected",
                self.serial()
            ))),
        }
    }

    async fn send_voltage(&self, volts: f64) -> Result<()> {
        self.require_connected().await?;
        if let Err(e) = self.link.send(CHANNEL, Command::SetVoltage { volts }).await {
            *self.state.write().await = ControllerState::Error;
            return Err(e);
        }
        Ok(())
    }

    /// Set the output voltage. Values outside the actuator's range are
    /// rejected without touching hardware.
    pub async fn set_voltage(&self, volts: f64) -> Result<()> {
        let (min, max) = self.voltage_range();
        if volts < min || volts > max {
            return Err(MotionError::Configuration(format!(
                "Voltage {volts:.1} V outside output range {min:.0}..={max:.0} V"
            )));
        }
        self.send_voltage(volts).await
    }

    /// Set the output voltage, clamping to the actuator's range instead of
    /// rejecting. Clamping is logged.
    pub async fn set_voltage_clamped(&self, volts: f64) -> Result<f64> {
        let (min, max) = self.voltage_range();
        let clamped = volts.clamp(min, max);
        if clamped != volts {
            warn!(
                "Clamping requested voltage {volts:.1} V to {clamped:.1} V on {}",
                self.serial()
            );
        }
        self.send_voltage(clamped).await?;
        Ok(clamped)
    }

    /// Read back the present output voltage.
    pub async fn get_voltage(&self) -> Result<f64> {
        self.require_connected().await?;
        let snapshot = self.link.poll(CHANNEL).await?;
        snapshot.output_voltage.ok_or_else(|| {
            MotionError::Communication(format!(
                "Device {} does not report an output voltage",
                self.serial()
            ))
        })
    }

    /// Drive the output to 0 V.
    pub async fn zero(&self) -> Result<()> {
        self.send_voltage(0.0).await
    }

    /// Command a position in stage units, for actuators with strain-gauge
    /// feedback. Requires a bound stage with a known travel.
    pub async fn set_position(&self, position: f64) -> Result<()> {
        let stage = self.stage_required()?;
        stage.check_travel(position)?;
        self.require_connected().await?;
        // Feedback loops take device units scaled over the travel span.
        let counts = (position * 32_767.0 / stage.travel.unwrap_or(1.0)).round() as i64;
        if let Err(e) = self
            .link
            .send(CHANNEL, Command::MoveAbsolute { counts })
            .await
        {
            *self.state.write().await = ControllerState::Error;
            return Err(e);
        }
        Ok(())
    }

    /// Read the strain-gauge position in stage units.
    pub async fn get_position(&self) -> Result<f64> {
        let stage = self.stage_required()?;
        self.require_connected().await?;
        let counts = self.link.read_position(CHANNEL).await?;
        Ok(counts as f64 * stage.travel.unwrap_or(1.0) / 32_767.0)
    }

    fn stage_required(&self) -> Result<&'static StageDescriptor> {
        self.stage_info().ok_or_else(|| {
            MotionError::Configuration(format!(
                "No actuator bound to {}; position control needs a travel range",
                self.serial()
            ))
        })
    }

    /// Drop the output to 0 V and clear the error state. Never fails.
    pub async fn stop(&self) {
        if !self.link.is_open().await {
            return;
        }
        match self.link.send(CHANNEL, Command::SetVoltage { volts: 0.0 }).await {
            Ok(()) => {
                let mut state = self.state.write().await;
                if *state == ControllerState::Error {
                    *state = ControllerState::Connected;
                }
            }
            Err(e) => {
                warn!("Output zero failed on {}: {e}", self.serial());
                *self.state.write().await = ControllerState::Error;
            }
        }
    }

    /// Status report.
    pub async fn get_status(&self) -> Result<PiezoStatus> {
        self.require_connected().await?;
        let snapshot = self.link.poll(CHANNEL).await?;
        Ok(PiezoStatus {
            state: *self.state.read().await,
            output_voltage: snapshot.output_voltage,
            enabled: snapshot.channel_enabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::catalog::stages;

    fn kpz_with_sim(serial: u32) -> (Arc<SimBackend>, PiezoController) {
        let backend = Arc::new(SimBackend::new());
        backend.add_device(serial, None);
        let piezo = PiezoController::new(
            backend.clone(),
            serial,
            ControllerType::Kpz101,
            &Settings::default(),
        );
        (backend, piezo)
    }

    #[tokio::test]
    async fn test_voltage_round_trip() {
        let (_backend, piezo) = kpz_with_sim(29_000_001);
        piezo.connect(None).await.unwrap();

        piezo.set_voltage(42.5).await.unwrap();
        assert!((piezo.get_voltage().await.unwrap() - 42.5).abs() < 1e-9);

        piezo.zero().await.unwrap();
        assert_eq!(piezo.get_voltage().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_voltage_range_enforced() {
        let (backend, piezo) = kpz_with_sim(29_000_002);
        piezo.connect(None).await.unwrap();

        // Unbound devices assume the conservative 75 V range.
        let before = backend.total_sends(29_000_002);
        let err = piezo.set_voltage(80.0).await.unwrap_err();
        assert!(matches!(err, MotionError::Configuration(_)));
        assert_eq!(backend.total_sends(29_000_002), before);

        // A 150 V actuator widens the range.
        piezo.bind_stage(stages::resolve("PAZ015").unwrap());
        piezo.set_voltage(80.0).await.unwrap();
        assert!(piezo.set_voltage(151.0).await.is_err());
    }

    #[tokio::test]
    async fn test_voltage_clamping() {
        let (_backend, piezo) = kpz_with_sim(29_000_003);
        piezo.connect(None).await.unwrap();

        let applied = piezo.set_voltage_clamped(120.0).await.unwrap();
        assert_eq!(applied, 75.0);
        assert_eq!(piezo.get_voltage().await.unwrap(), 75.0);

        let applied = piezo.set_voltage_clamped(-5.0).await.unwrap();
        assert_eq!(applied, 0.0);
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let (_backend, piezo) = kpz_with_sim(29_000_004);
        assert!(matches!(
            piezo.set_voltage(10.0).await.unwrap_err(),
            MotionError::Connection(_)
        ));
        assert!(matches!(
            piezo.get_voltage().await.unwrap_err(),
            MotionError::Connection(_)
        ));
    }

    #[tokio::test]
    async fn test_position_requires_stage() {
        let (backend, piezo) = kpz_with_sim(29_000_005);
        backend.set_motion_rate(29_000_005, 1e12);
        piezo.connect(None).await.unwrap();

        assert!(matches!(
            piezo.set_position(0.001).await.unwrap_err(),
            MotionError::Configuration(_)
        ));

        piezo.bind_stage(stages::resolve("PK4FA7P1").unwrap());
        piezo.set_position(0.0035).await.unwrap();
        let read = piezo.get_position().await.unwrap();
        assert!((read - 0.0035).abs() < 1e-6);

        // Beyond the 7 um travel.
        assert!(piezo.set_position(0.008).await.is_err());
    }
}

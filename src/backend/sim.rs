//! Simulated backend.
//!
//! In-process stand-in for real controller hardware, used by unit and
//! integration tests and by the CLI runner's `--simulated` mode. Devices
//! follow a simple kinematic model: a commanded move sets a target and the
//! position ramps toward it at a configurable rate, advanced lazily on
//! every status query. No timers or background tasks run.
//!
//! Fault injection covers the failure paths the real stacks exhibit:
//! sessions that refuse to open, EEPROM reads that fail, commands the
//! firmware rejects, and motion that never settles.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::{
    Backend, BackendKind, Command, DeviceHandle, DriveParams, StatusSnapshot, VelocityParams,
};
use crate::catalog::controllers::ControllerType;
use crate::error::{MotionError, Result};

/// Fault injection switches for one simulated device.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFaults {
    /// `open` fails as if the device were absent.
    pub fail_open: bool,
    /// `open` hangs as if the vendor stack were wedged.
    pub stall_open: bool,
    /// EEPROM reads fail as a communication error.
    pub fail_eeprom: bool,
    /// Every `send` is rejected by the firmware.
    pub fail_send: bool,
    /// Motion never completes; the moving flag stays set.
    pub never_settle: bool,
    /// The device appears twice in enumeration.
    pub enumerate_twice: bool,
}

#[derive(Debug, Clone)]
struct SimChannel {
    position: f64,
    target: f64,
    moving: bool,
    homing: bool,
    homed: bool,
    enabled: bool,
    drive: DriveParams,
    output_voltage: f64,
    last_tick: Instant,
}

impl SimChannel {
    fn new() -> Self {
        Self {
            position: 0.0,
            target: 0.0,
            moving: false,
            homing: false,
            homed: false,
            enabled: true,
            drive: DriveParams::default(),
            output_voltage: 0.0,
            last_tick: Instant::now(),
        }
    }

    /// Advance the kinematic model by the wall time since the last query.
    fn advance(&mut self, rate: f64, never_settle: bool) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        if !self.moving {
            return;
        }

        let step = rate * dt;
        let delta = self.target - self.position;

        if never_settle {
            // Creep toward the target without ever arriving.
            self.position += delta.signum() * (step * 0.01).min(delta.abs() * 0.5);
            return;
        }

        if delta.abs() <= step {
            self.position = self.target;
            self.moving = false;
            if self.homing {
                self.homing = false;
                self.homed = true;
            }
        } else {
            self.position += delta.signum() * step;
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            position: self.position.round() as i64,
            moving: self.moving,
            homing: self.homing,
            homed: self.homed,
            channel_enabled: self.enabled,
            hardware_fault: false,
            forward_limit: false,
            reverse_limit: false,
            output_voltage: Some(self.output_voltage),
        }
    }
}

#[derive(Debug)]
struct SimDevice {
    channels: Vec<SimChannel>,
    eeprom: Option<String>,
    faults: SimFaults,
    velocity: VelocityParams,
    motion_rate: f64,
    sessions: HashSet<u64>,
    open_count: usize,
}

struct SimState {
    devices: HashMap<u32, SimDevice>,
    roster: Vec<u32>,
    log: Vec<(u32, u8, Command)>,
}

/// Simulated multi-device backend.
pub struct SimBackend {
    state: Mutex<SimState>,
    next_session: AtomicU64,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Create an empty simulated backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                devices: HashMap::new(),
                roster: Vec::new(),
                log: Vec::new(),
            }),
            next_session: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A poisoned lock only means a test thread panicked mid-update;
        // the simulated state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a device. Channel count follows the serial prefix; unknown
    /// prefixes get a single channel.
    pub fn add_device(&self, serial: u32, eeprom: Option<&str>) {
        let channels = ControllerType::from_serial(serial)
            .map(|t| t.channel_count())
            .unwrap_or(1) as usize;

        let mut state = self.lock();
        state.devices.insert(
            serial,
            SimDevice {
                channels: (0..channels).map(|_| SimChannel::new()).collect(),
                eeprom: eeprom.map(str::to_string),
                faults: SimFaults::default(),
                velocity: VelocityParams {
                    velocity: 100_000.0,
                    acceleration: 10_000.0,
                },
                // Fast by default so settle loops finish quickly.
                motion_rate: 2_000_000.0,
                sessions: HashSet::new(),
                open_count: 0,
            },
        );
        if !state.roster.contains(&serial) {
            state.roster.push(serial);
        }
    }

    /// Set fault injection switches for a device.
    pub fn set_faults(&self, serial: u32, faults: SimFaults) {
        if let Some(dev) = self.lock().devices.get_mut(&serial) {
            dev.faults = faults;
        }
    }

    /// Set the motion rate in device units per second.
    pub fn set_motion_rate(&self, serial: u32, units_per_s: f64) {
        if let Some(dev) = self.lock().devices.get_mut(&serial) {
            dev.motion_rate = units_per_s.max(1.0);
        }
    }

    /// Preset the position register of a channel.
    pub fn set_position(&self, serial: u32, channel: u8, counts: i64) {
        if let Some(dev) = self.lock().devices.get_mut(&serial) {
            if let Some(ch) = dev.channels.get_mut(channel.saturating_sub(1) as usize) {
                ch.position = counts as f64;
                ch.target = counts as f64;
            }
        }
    }

    /// Whether any session to the device is currently open.
    pub fn is_open(&self, serial: u32) -> bool {
        self.lock()
            .devices
            .get(&serial)
            .is_some_and(|d| !d.sessions.is_empty())
    }

    /// How many times the device has been opened since creation.
    pub fn open_count(&self, serial: u32) -> usize {
        self.lock()
            .devices
            .get(&serial)
            .map_or(0, |d| d.open_count)
    }

    /// All commands attempted on a device, in issue order.
    pub fn sent(&self, serial: u32) -> Vec<(u8, Command)> {
        self.lock()
            .log
            .iter()
            .filter(|(s, _, _)| *s == serial)
            .map(|(_, ch, cmd)| (*ch, cmd.clone()))
            .collect()
    }

    /// Number of commands with the given name attempted on a device.
    pub fn send_count(&self, serial: u32, name: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|(s, _, cmd)| *s == serial && cmd.name() == name)
            .count()
    }

    /// Total commands attempted on a device.
    pub fn total_sends(&self, serial: u32) -> usize {
        self.lock().log.iter().filter(|(s, _, _)| *s == serial).count()
    }

    fn check_handle<'a>(
        state: &'a mut SimState,
        handle: &DeviceHandle,
    ) -> Result<&'a mut SimDevice> {
        let dev = state.devices.get_mut(&handle.serial).ok_or_else(|| {
            MotionError::Connection(format!("No simulated device {}", handle.serial))
        })?;
        if !dev.sessions.contains(&handle.session) {
            return Err(MotionError::Connection(format!(
                "Session to {} is not open",
                handle.serial
            )));
        }
        Ok(dev)
    }

    fn channel_mut(dev: &mut SimDevice, serial: u32, channel: u8) -> Result<&mut SimChannel> {
        let count = dev.channels.len();
        if channel == 0 || channel as usize > count {
            return Err(MotionError::Configuration(format!(
                "Device {serial} has channels 1..={count}, got {channel}"
            )));
        }
        Ok(&mut dev.channels[channel as usize - 1])
    }
}

#[async_trait]
impl Backend for SimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn enumerate(&self) -> Result<Vec<u32>> {
        let state = self.lock();
        let mut serials = Vec::new();
        for serial in &state.roster {
            serials.push(*serial);
            if state
                .devices
                .get(serial)
                .is_some_and(|d| d.faults.enumerate_twice)
            {
                serials.push(*serial);
            }
        }
        Ok(serials)
    }

    async fn open(&self, serial: u32) -> Result<DeviceHandle> {
        let stalled = self
            .lock()
            .devices
            .get(&serial)
            .is_some_and(|d| d.faults.stall_open);
        if stalled {
            // Never resolves on its own; the caller's timeout has to fire.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        let dev = state
            .devices
            .get_mut(&serial)
            .ok_or_else(|| MotionError::Connection(format!("No simulated device {serial}")))?;
        if dev.faults.fail_open {
            return Err(MotionError::Connection(format!(
                "Device {serial} did not respond"
            )));
        }
        dev.sessions.insert(session);
        dev.open_count += 1;
        Ok(DeviceHandle { serial, session })
    }

    async fn close(&self, handle: &DeviceHandle) -> Result<()> {
        if let Some(dev) = self.lock().devices.get_mut(&handle.serial) {
            dev.sessions.remove(&handle.session);
        }
        Ok(())
    }

    async fn send(&self, handle: &DeviceHandle, channel: u8, command: Command) -> Result<()> {
        let mut state = self.lock();
        state.log.push((handle.serial, channel, command.clone()));

        let serial = handle.serial;
        let dev = Self::check_handle(&mut state, handle)?;
        if dev.faults.fail_send {
            return Err(MotionError::Communication(format!(
                "Device {serial} rejected {}",
                command.name()
            )));
        }

        let rate = dev.motion_rate;
        let never_settle = dev.faults.never_settle;

        match command {
            Command::Identify => {}
            Command::SetVoltage { volts } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.output_voltage = volts;
            }
            Command::SetDriveParams(params) => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.drive = params;
            }
            Command::EnableChannel => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.enabled = true;
            }
            Command::DisableChannel => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.enabled = false;
            }
            Command::SetPositionAs { counts } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.position = counts as f64;
                ch.target = counts as f64;
            }
            Command::Stop => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.moving = false;
                ch.homing = false;
                ch.target = ch.position;
            }
            Command::Home => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.homed = false;
                ch.homing = true;
                ch.moving = true;
                ch.target = 0.0;
            }
            Command::MoveAbsolute { counts } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.target = counts as f64;
                ch.moving = true;
            }
            Command::MoveRelative { counts } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.target = ch.position + counts as f64;
                ch.moving = true;
            }
            Command::Jog { direction, steps } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.target = ch.position + (direction.sign() * steps) as f64;
                ch.moving = true;
            }
            Command::JogContinuous { direction } => {
                let ch = Self::channel_mut(dev, serial, channel)?;
                ch.advance(rate, never_settle);
                ch.target = (direction.sign() as f64) * 1e12;
                ch.moving = true;
            }
        }
        Ok(())
    }

    async fn poll_status(&self, handle: &DeviceHandle, channel: u8) -> Result<StatusSnapshot> {
        let mut state = self.lock();
        let serial = handle.serial;
        let dev = Self::check_handle(&mut state, handle)?;
        let rate = dev.motion_rate;
        let never_settle = dev.faults.never_settle;
        let ch = Self::channel_mut(dev, serial, channel)?;
        ch.advance(rate, never_settle);
        Ok(ch.snapshot())
    }

    async fn read_position(&self, handle: &DeviceHandle, channel: u8) -> Result<i64> {
        Ok(self.poll_status(handle, channel).await?.position)
    }

    async fn read_eeprom(&self, handle: &DeviceHandle) -> Result<Option<String>> {
        let mut state = self.lock();
        let serial = handle.serial;
        let dev = Self::check_handle(&mut state, handle)?;
        if dev.faults.fail_eeprom {
            return Err(MotionError::Communication(format!(
                "EEPROM read failed on {serial}"
            )));
        }
        Ok(dev.eeprom.clone())
    }

    async fn velocity_params(&self, handle: &DeviceHandle, _channel: u8) -> Result<VelocityParams> {
        let mut state = self.lock();
        let dev = Self::check_handle(&mut state, handle)?;
        Ok(dev.velocity)
    }

    async fn set_velocity_params(
        &self,
        handle: &DeviceHandle,
        _channel: u8,
        params: VelocityParams,
    ) -> Result<()> {
        let mut state = self.lock();
        let dev = Self::check_handle(&mut state, handle)?;
        dev.velocity = params;
        Ok(())
    }

    async fn drive_params(&self, handle: &DeviceHandle, channel: u8) -> Result<DriveParams> {
        let mut state = self.lock();
        let serial = handle.serial;
        let dev = Self::check_handle(&mut state, handle)?;
        let ch = Self::channel_mut(dev, serial, channel)?;
        Ok(ch.drive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Direction;
    use std::time::Duration;

    #[tokio::test]
    async fn test_move_settles_at_target() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, None);
        let handle = backend.open(27_000_001).await.unwrap();

        backend
            .send(&handle, 1, Command::MoveAbsolute { counts: 5000 })
            .await
            .unwrap();

        // Immediately after issue the channel reports motion.
        let status = backend.poll_status(&handle, 1).await.unwrap();
        assert!(status.moving);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = backend.poll_status(&handle, 1).await.unwrap();
        assert!(!status.moving);
        assert_eq!(status.position, 5000);
    }

    #[tokio::test]
    async fn test_home_sets_homed_flag() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, None);
        let handle = backend.open(27_000_001).await.unwrap();
        backend.set_position(27_000_001, 1, 3000);

        backend.send(&handle, 1, Command::Home).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = backend.poll_status(&handle, 1).await.unwrap();
        assert!(status.homed);
        assert!(!status.homing);
        assert_eq!(status.position, 0);
    }

    #[tokio::test]
    async fn test_never_settle_fault() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, None);
        backend.set_faults(
            27_000_001,
            SimFaults {
                never_settle: true,
                ..SimFaults::default()
            },
        );
        let handle = backend.open(27_000_001).await.unwrap();

        backend
            .send(&handle, 1, Command::MoveAbsolute { counts: 100 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let status = backend.poll_status(&handle, 1).await.unwrap();
        assert!(status.moving);
    }

    #[tokio::test]
    async fn test_jog_moves_relative() {
        let backend = SimBackend::new();
        backend.add_device(97_000_001, None);
        let handle = backend.open(97_000_001).await.unwrap();
        backend.set_position(97_000_001, 3, 100);

        backend
            .send(
                &handle,
                3,
                Command::Jog {
                    direction: Direction::Reverse,
                    steps: 40,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.read_position(&handle, 3).await.unwrap(), 60);
        // Other channels stay put.
        assert_eq!(backend.read_position(&handle, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kim_serial_gets_four_channels() {
        let backend = SimBackend::new();
        backend.add_device(97_000_001, None);
        let handle = backend.open(97_000_001).await.unwrap();

        assert!(backend.poll_status(&handle, 4).await.is_ok());
        assert!(backend.poll_status(&handle, 5).await.is_err());
        assert!(backend.poll_status(&handle, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection_paths() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, Some("PRM1Z8"));
        backend.set_faults(
            27_000_001,
            SimFaults {
                fail_open: true,
                ..SimFaults::default()
            },
        );
        assert!(backend.open(27_000_001).await.is_err());

        backend.set_faults(
            27_000_001,
            SimFaults {
                fail_eeprom: true,
                ..SimFaults::default()
            },
        );
        let handle = backend.open(27_000_001).await.unwrap();
        assert!(backend.read_eeprom(&handle).await.is_err());

        backend.set_faults(27_000_001, SimFaults::default());
        assert_eq!(
            backend.read_eeprom(&handle).await.unwrap().as_deref(),
            Some("PRM1Z8")
        );
    }

    #[tokio::test]
    async fn test_command_log_counts_attempts() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, None);
        backend.set_faults(
            27_000_001,
            SimFaults {
                fail_send: true,
                ..SimFaults::default()
            },
        );
        let handle = backend.open(27_000_001).await.unwrap();

        assert!(backend.send(&handle, 1, Command::Stop).await.is_err());
        // Rejected sends still count as attempts.
        assert_eq!(backend.send_count(27_000_001, "stop"), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_rejected() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, None);
        let handle = backend.open(27_000_001).await.unwrap();
        backend.close(&handle).await.unwrap();

        assert!(backend.poll_status(&handle, 1).await.is_err());
        assert!(!backend.is_open(27_000_001));
        assert_eq!(backend.open_count(27_000_001), 1);
    }
}

//! Legacy APT server backend (feature `apt_hardware`).
//!
//! Covers the controllers the Kinesis SDK dropped, most importantly the
//! TPZ001, plus older KDC101/TDC001/KPZ101 installs still driven through
//! ActiveX. The APT server is a process-wide singleton: `APTInit` runs
//! once when the backend is built and `APTCleanUp` on drop. Devices are
//! addressed by serial number directly; there is no per-device handle on
//! the vendor side, so sessions are tracked here.
//!
//! APT motor calls take positions in real-world units (millimeters or
//! degrees) as floats, while this crate's device units are integer counts.
//! The conversion factor is per-device and comes from the stage catalog;
//! callers that bind a stage should mirror its `counts_per_unit` into the
//! backend via [`AptBackend::set_unit_scale`]. Unscaled devices default to
//! one count per unit.
//!
//! Without the feature the type exists but [`AptBackend::new`] fails with
//! [`MotionError::FeatureNotEnabled`].

use async_trait::async_trait;
#[cfg(feature = "apt_hardware")]
use log::debug;

use crate::backend::{
    Backend, BackendKind, Command, DeviceHandle, DriveParams, StatusSnapshot, VelocityParams,
};
use crate::error::{MotionError, Result};

#[cfg(feature = "apt_hardware")]
use std::collections::HashMap;
#[cfg(feature = "apt_hardware")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "apt_hardware")]
use std::sync::{Mutex, RwLock};

/// Backend over the legacy APT server.
pub struct AptBackend {
    #[cfg(feature = "apt_hardware")]
    sessions: Mutex<HashMap<u64, ffi::Session>>,
    #[cfg(feature = "apt_hardware")]
    next_session: AtomicU64,
    #[cfg(feature = "apt_hardware")]
    unit_scale: RwLock<HashMap<u32, f64>>,
}

impl AptBackend {
    /// Initialize the APT server and build a backend over it.
    pub fn new() -> Result<Self> {
        #[cfg(feature = "apt_hardware")]
        {
            ffi::init()?;
            debug!("APT server initialized");
            Ok(Self {
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                unit_scale: RwLock::new(HashMap::new()),
            })
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    /// Set the counts-per-unit scale for one device, aligning catalog
    /// counts with the APT server's real-unit floats.
    #[cfg(feature = "apt_hardware")]
    pub fn set_unit_scale(&self, serial: u32, counts_per_unit: f64) {
        self.unit_scale
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(serial, counts_per_unit.max(f64::MIN_POSITIVE));
    }

    #[cfg(feature = "apt_hardware")]
    fn scale(&self, serial: u32) -> f64 {
        self.unit_scale
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&serial)
            .copied()
            .unwrap_or(1.0)
    }

    #[cfg(feature = "apt_hardware")]
    fn session(&self, handle: &DeviceHandle) -> Result<ffi::Session> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(&handle.session) {
            Some(s) if s.serial == handle.serial => Ok(*s),
            _ => Err(MotionError::Connection(format!(
                "No open APT session for device {}",
                handle.serial
            ))),
        }
    }

    #[cfg(feature = "apt_hardware")]
    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| MotionError::Communication(format!("APT I/O task panicked: {e}")))?
    }
}

#[cfg(feature = "apt_hardware")]
impl Drop for AptBackend {
    fn drop(&mut self) {
        ffi::cleanup();
    }
}

#[async_trait]
impl Backend for AptBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Apt
    }

    async fn enumerate(&self) -> Result<Vec<u32>> {
        #[cfg(feature = "apt_hardware")]
        {
            Self::blocking(ffi::enumerate).await
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn open(&self, serial: u32) -> Result<DeviceHandle> {
        #[cfg(feature = "apt_hardware")]
        {
            let kind = ffi::DeviceClass::for_serial(serial)?;
            Self::blocking(move || ffi::open(serial)).await?;

            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session, ffi::Session { serial, kind });
            debug!("Opened APT session {session} to {serial}");
            Ok(DeviceHandle { serial, session })
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = serial;
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn close(&self, handle: &DeviceHandle) -> Result<()> {
        #[cfg(feature = "apt_hardware")]
        {
            // The APT server keeps devices initialized process-wide, so
            // closing just invalidates the session.
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle.session);
            Ok(())
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = handle;
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn send(&self, handle: &DeviceHandle, channel: u8, command: Command) -> Result<()> {
        #[cfg(feature = "apt_hardware")]
        {
            let session = self.session(handle)?;
            let scale = self.scale(handle.serial);
            Self::blocking(move || ffi::send(session, channel, command, scale)).await
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel, command);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn poll_status(&self, handle: &DeviceHandle, channel: u8) -> Result<StatusSnapshot> {
        #[cfg(feature = "apt_hardware")]
        {
            let session = self.session(handle)?;
            let scale = self.scale(handle.serial);
            Self::blocking(move || ffi::poll_status(session, channel, scale)).await
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn read_position(&self, handle: &DeviceHandle, channel: u8) -> Result<i64> {
        #[cfg(feature = "apt_hardware")]
        {
            Ok(self.poll_status(handle, channel).await?.position)
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn read_eeprom(&self, handle: &DeviceHandle) -> Result<Option<String>> {
        #[cfg(feature = "apt_hardware")]
        {
            // The APT interface has no stage EEPROM query; stages must be
            // assigned in configuration.
            self.session(handle)?;
            debug!("APT backend cannot read the stage EEPROM of {}", handle.serial);
            Ok(None)
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = handle;
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn velocity_params(&self, handle: &DeviceHandle, channel: u8) -> Result<VelocityParams> {
        #[cfg(feature = "apt_hardware")]
        {
            let session = self.session(handle)?;
            let scale = self.scale(handle.serial);
            Self::blocking(move || ffi::velocity_params(session, channel, scale)).await
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn set_velocity_params(
        &self,
        handle: &DeviceHandle,
        channel: u8,
        params: VelocityParams,
    ) -> Result<()> {
        #[cfg(feature = "apt_hardware")]
        {
            let session = self.session(handle)?;
            let scale = self.scale(handle.serial);
            Self::blocking(move || ffi::set_velocity_params(session, channel, params, scale)).await
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel, params);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }

    async fn drive_params(&self, handle: &DeviceHandle, channel: u8) -> Result<DriveParams> {
        #[cfg(feature = "apt_hardware")]
        {
            let _ = channel;
            Err(MotionError::Configuration(format!(
                "Device {} has no inertial drive parameters",
                handle.serial
            )))
        }

        #[cfg(not(feature = "apt_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        }
    }
}

/// Raw APT server bindings.
///
/// The server reports motors and piezos through separate call families,
/// `MOT_` and `PZ_`; the class is fixed by the serial prefix at open time.
#[cfg(feature = "apt_hardware")]
#[allow(unsafe_code)]
mod ffi {
    use std::ffi::{c_float, c_long};

    use super::{Command, MotionError, Result, StatusSnapshot, VelocityParams};
    use crate::backend::Direction;
    use crate::catalog::controllers::{ControllerType, MotorClass};

    const STATUS_LIMIT_CW: c_long = 0x0000_0001;
    const STATUS_LIMIT_CCW: c_long = 0x0000_0002;
    const STATUS_MOVING_CW: c_long = 0x0000_0010;
    const STATUS_MOVING_CCW: c_long = 0x0000_0020;
    const STATUS_JOGGING_CW: c_long = 0x0000_0040;
    const STATUS_JOGGING_CCW: c_long = 0x0000_0080;
    const STATUS_HOMING: c_long = 0x0000_0200;
    const STATUS_HOMED: c_long = 0x0000_0400;
    const STATUS_ENABLED: c_long = 0x8000_0000u32 as c_long;

    const MOVE_FWD: c_long = 1;
    const MOVE_REV: c_long = 2;

    #[link(name = "apt")]
    extern "C" {
        fn APTInit() -> c_long;
        fn APTCleanUp() -> c_long;
        fn GetNumHWUnitsEx(hw_type: c_long, num_units: *mut c_long) -> c_long;
        fn GetHWSerialNumEx(hw_type: c_long, index: c_long, serial: *mut c_long) -> c_long;
        fn InitHWDevice(serial: c_long) -> c_long;

        fn MOT_Identify(serial: c_long) -> c_long;
        fn MOT_MoveHome(serial: c_long, wait: bool) -> c_long;
        fn MOT_MoveAbsoluteEx(serial: c_long, position: c_float, wait: bool) -> c_long;
        fn MOT_MoveRelativeEx(serial: c_long, distance: c_float, wait: bool) -> c_long;
        fn MOT_MoveVelocity(serial: c_long, direction: c_long) -> c_long;
        fn MOT_StopProfiled(serial: c_long) -> c_long;
        fn MOT_EnableHWChannel(serial: c_long) -> c_long;
        fn MOT_DisableHWChannel(serial: c_long) -> c_long;
        fn MOT_GetPosition(serial: c_long, position: *mut c_float) -> c_long;
        fn MOT_GetStatusBits(serial: c_long, bits: *mut c_long) -> c_long;
        fn MOT_GetVelParams(
            serial: c_long,
            min_velocity: *mut c_float,
            acceleration: *mut c_float,
            max_velocity: *mut c_float,
        ) -> c_long;
        fn MOT_SetVelParams(
            serial: c_long,
            min_velocity: c_float,
            acceleration: c_float,
            max_velocity: c_float,
        ) -> c_long;

        fn PZ_Identify(serial: c_long) -> c_long;
        fn PZ_SetOutputVolts(serial: c_long, volts: c_float) -> c_long;
        fn PZ_GetOutputVolts(serial: c_long, volts: *mut c_float) -> c_long;
        fn PZ_SetPosOutput(serial: c_long, position: c_float) -> c_long;
        fn PZ_GetPosOutput(serial: c_long, position: *mut c_float) -> c_long;
    }

    /// Which APT call family serves a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) enum DeviceClass {
        Motor,
        Piezo,
    }

    impl DeviceClass {
        pub(super) fn for_serial(serial: u32) -> Result<DeviceClass> {
            let controller_type = ControllerType::from_serial(serial).ok_or_else(|| {
                MotionError::Configuration(format!(
                    "Serial {serial} does not match a supported controller"
                ))
            })?;
            let info = controller_type.info();
            if info.apt_hw_type.is_none() {
                return Err(MotionError::Configuration(format!(
                    "{controller_type} is not served by the APT server; use the kinesis backend"
                )));
            }
            match info.motor_class {
                MotorClass::Piezo => Ok(DeviceClass::Piezo),
                _ => Ok(DeviceClass::Motor),
            }
        }
    }

    /// One open APT session.
    #[derive(Debug, Clone, Copy)]
    pub(super) struct Session {
        pub(super) serial: u32,
        pub(super) kind: DeviceClass,
    }

    fn check(op: &str, serial: u32, code: c_long) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(MotionError::Communication(format!(
                "APT {op} failed on {serial} with code {code}"
            )))
        }
    }

    pub(super) fn init() -> Result<()> {
        let code = unsafe { APTInit() };
        if code == 0 {
            Ok(())
        } else {
            Err(MotionError::Connection(format!(
                "APTInit failed with code {code}"
            )))
        }
    }

    pub(super) fn cleanup() {
        unsafe {
            APTCleanUp();
        }
    }

    pub(super) fn enumerate() -> Result<Vec<u32>> {
        let mut serials = Vec::new();
        for info in crate::catalog::controllers::all() {
            let Some(hw_type) = info.apt_hw_type else {
                continue;
            };
            let mut count: c_long = 0;
            let code = unsafe { GetNumHWUnitsEx(hw_type as c_long, &mut count) };
            if code != 0 {
                return Err(MotionError::Communication(format!(
                    "GetNumHWUnitsEx({hw_type}) failed with code {code}"
                )));
            }
            for index in 0..count {
                let mut serial: c_long = 0;
                let code = unsafe { GetHWSerialNumEx(hw_type as c_long, index, &mut serial) };
                if code != 0 {
                    return Err(MotionError::Communication(format!(
                        "GetHWSerialNumEx({hw_type}, {index}) failed with code {code}"
                    )));
                }
                if serial > 0 {
                    serials.push(serial as u32);
                }
            }
        }
        Ok(serials)
    }

    pub(super) fn open(serial: u32) -> Result<()> {
        let code = unsafe { InitHWDevice(serial as c_long) };
        if code == 0 {
            Ok(())
        } else {
            Err(MotionError::Connection(format!(
                "InitHWDevice failed on {serial} with code {code}"
            )))
        }
    }

    fn require_single_channel(channel: u8) -> Result<()> {
        if channel != 1 {
            return Err(MotionError::Configuration(format!(
                "Channel {channel} on a single-channel controller"
            )));
        }
        Ok(())
    }

    pub(super) fn send(session: Session, channel: u8, command: Command, scale: f64) -> Result<()> {
        require_single_channel(channel)?;
        let serial = session.serial;
        let s = serial as c_long;
        let to_units = |counts: i64| (counts as f64 / scale) as c_float;

        let code = unsafe {
            match (session.kind, &command) {
                (DeviceClass::Motor, Command::Identify) => MOT_Identify(s),
                (DeviceClass::Motor, Command::Home) => MOT_MoveHome(s, false),
                (DeviceClass::Motor, Command::MoveAbsolute { counts }) => {
                    MOT_MoveAbsoluteEx(s, to_units(*counts), false)
                }
                (DeviceClass::Motor, Command::MoveRelative { counts }) => {
                    MOT_MoveRelativeEx(s, to_units(*counts), false)
                }
                (DeviceClass::Motor, Command::Jog { direction, steps }) => {
                    // APT has no one-shot jog; a fixed jog is a relative
                    // move of the jog distance.
                    MOT_MoveRelativeEx(s, to_units(*steps * direction.sign()), false)
                }
                (DeviceClass::Motor, Command::JogContinuous { direction }) => {
                    let dir = match direction {
                        Direction::Forward => MOVE_FWD,
                        Direction::Reverse => MOVE_REV,
                    };
                    MOT_MoveVelocity(s, dir)
                }
                (DeviceClass::Motor, Command::Stop) => MOT_StopProfiled(s),
                (DeviceClass::Motor, Command::EnableChannel) => MOT_EnableHWChannel(s),
                (DeviceClass::Motor, Command::DisableChannel) => MOT_DisableHWChannel(s),

                (DeviceClass::Piezo, Command::Identify) => PZ_Identify(s),
                (DeviceClass::Piezo, Command::SetVoltage { volts }) => {
                    PZ_SetOutputVolts(s, *volts as c_float)
                }
                (DeviceClass::Piezo, Command::MoveAbsolute { counts }) => {
                    PZ_SetPosOutput(s, to_units(*counts))
                }
                (DeviceClass::Piezo, Command::Stop) => PZ_SetOutputVolts(s, 0.0),

                _ => {
                    return Err(MotionError::Configuration(format!(
                        "Command {} is not supported by device {serial}",
                        command.name()
                    )))
                }
            }
        };
        check(command.name(), serial, code)
    }

    pub(super) fn poll_status(session: Session, channel: u8, scale: f64) -> Result<StatusSnapshot> {
        require_single_channel(channel)?;
        let serial = session.serial;
        let s = serial as c_long;

        match session.kind {
            DeviceClass::Motor => {
                let mut bits: c_long = 0;
                let mut position: c_float = 0.0;
                unsafe {
                    check("get_status", serial, MOT_GetStatusBits(s, &mut bits))?;
                    check("get_position", serial, MOT_GetPosition(s, &mut position))?;
                }
                Ok(StatusSnapshot {
                    position: (position as f64 * scale).round() as i64,
                    moving: bits
                        & (STATUS_MOVING_CW
                            | STATUS_MOVING_CCW
                            | STATUS_JOGGING_CW
                            | STATUS_JOGGING_CCW)
                        != 0,
                    homing: bits & STATUS_HOMING != 0,
                    homed: bits & STATUS_HOMED != 0,
                    channel_enabled: bits & STATUS_ENABLED != 0,
                    hardware_fault: false,
                    forward_limit: bits & STATUS_LIMIT_CW != 0,
                    reverse_limit: bits & STATUS_LIMIT_CCW != 0,
                    output_voltage: None,
                })
            }
            DeviceClass::Piezo => {
                let mut volts: c_float = 0.0;
                let mut position: c_float = 0.0;
                unsafe {
                    check("get_volts", serial, PZ_GetOutputVolts(s, &mut volts))?;
                    check("get_pos", serial, PZ_GetPosOutput(s, &mut position))?;
                }
                Ok(StatusSnapshot {
                    position: (position as f64 * scale).round() as i64,
                    channel_enabled: true,
                    output_voltage: Some(volts as f64),
                    ..StatusSnapshot::default()
                })
            }
        }
    }

    pub(super) fn velocity_params(
        session: Session,
        channel: u8,
        scale: f64,
    ) -> Result<VelocityParams> {
        require_single_channel(channel)?;
        if session.kind != DeviceClass::Motor {
            return Err(MotionError::Configuration(format!(
                "Device {} has no velocity profile",
                session.serial
            )));
        }
        let mut min_velocity: c_float = 0.0;
        let mut acceleration: c_float = 0.0;
        let mut max_velocity: c_float = 0.0;
        let code = unsafe {
            MOT_GetVelParams(
                session.serial as c_long,
                &mut min_velocity,
                &mut acceleration,
                &mut max_velocity,
            )
        };
        check("get_vel_params", session.serial, code)?;
        Ok(VelocityParams {
            velocity: max_velocity as f64 * scale,
            acceleration: acceleration as f64 * scale,
        })
    }

    pub(super) fn set_velocity_params(
        session: Session,
        channel: u8,
        params: VelocityParams,
        scale: f64,
    ) -> Result<()> {
        require_single_channel(channel)?;
        if session.kind != DeviceClass::Motor {
            return Err(MotionError::Configuration(format!(
                "Device {} has no velocity profile",
                session.serial
            )));
        }
        let code = unsafe {
            MOT_SetVelParams(
                session.serial as c_long,
                0.0,
                (params.acceleration / scale) as c_float,
                (params.velocity / scale) as c_float,
            )
        };
        check("set_vel_params", session.serial, code)
    }
}

#[cfg(all(test, not(feature = "apt_hardware")))]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_feature() {
        assert!(matches!(
            AptBackend::new(),
            Err(MotionError::FeatureNotEnabled("apt_hardware"))
        ));
    }
}

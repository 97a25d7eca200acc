//! Native Kinesis SDK backend (feature `kinesis_hardware`).
//!
//! Wraps the vendor C API. Every controller family ships its own function
//! prefix (`CC_` for K-Cube DC servos and the TDC001, `BMC_` for brushless
//! K-Cubes, `KIM_` for inertial K-Cubes, `PCC_` for piezo K-Cubes), so
//! calls dispatch on the family derived from the serial prefix. All SDK
//! calls block and run on Tokio's blocking executor.
//!
//! Without the feature the type still exists so backend selection compiles
//! everywhere, but [`KinesisBackend::new`] fails with
//! [`MotionError::FeatureNotEnabled`].

use async_trait::async_trait;
use log::debug;

use crate::backend::{
    Backend, BackendKind, Command, DeviceHandle, DriveParams, StatusSnapshot, VelocityParams,
};
use crate::error::{MotionError, Result};

#[cfg(feature = "kinesis_hardware")]
use std::collections::HashMap;
#[cfg(feature = "kinesis_hardware")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "kinesis_hardware")]
use std::sync::Mutex;

/// Backend over the native Kinesis SDK.
pub struct KinesisBackend {
    #[allow(dead_code)]
    sdk_path: String,
    #[cfg(feature = "kinesis_hardware")]
    sessions: Mutex<HashMap<u64, ffi::Session>>,
    #[cfg(feature = "kinesis_hardware")]
    next_session: AtomicU64,
}

impl KinesisBackend {
    /// Create a backend bound to the SDK installation at `sdk_path`.
    pub fn new(sdk_path: &str) -> Result<Self> {
        #[cfg(feature = "kinesis_hardware")]
        {
            debug!("Kinesis backend using SDK at '{sdk_path}'");
            Ok(Self {
                sdk_path: sdk_path.to_string(),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            })
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            debug!("Kinesis backend requested for '{sdk_path}' without SDK support");
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    #[cfg(feature = "kinesis_hardware")]
    fn session(&self, handle: &DeviceHandle) -> Result<ffi::Session> {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match sessions.get(&handle.session) {
            Some(s) if s.serial == handle.serial => Ok(*s),
            _ => Err(MotionError::Connection(format!(
                "No open Kinesis session for device {}",
                handle.serial
            ))),
        }
    }

    #[cfg(feature = "kinesis_hardware")]
    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| MotionError::Communication(format!("Kinesis I/O task panicked: {e}")))?
    }
}

#[async_trait]
impl Backend for KinesisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kinesis
    }

    async fn enumerate(&self) -> Result<Vec<u32>> {
        #[cfg(feature = "kinesis_hardware")]
        {
            Self::blocking(ffi::enumerate).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn open(&self, serial: u32) -> Result<DeviceHandle> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let family = ffi::Family::for_serial(serial)?;
            Self::blocking(move || ffi::open(family, serial)).await?;

            let session = self.next_session.fetch_add(1, Ordering::Relaxed);
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session, ffi::Session { serial, family });
            debug!("Opened Kinesis session {session} to {serial}");
            Ok(DeviceHandle { serial, session })
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = serial;
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn close(&self, handle: &DeviceHandle) -> Result<()> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let removed = self
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&handle.session);
            match removed {
                Some(session) => Self::blocking(move || ffi::close(session)).await,
                None => Ok(()),
            }
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = handle;
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn send(&self, handle: &DeviceHandle, channel: u8, command: Command) -> Result<()> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::send(session, channel, command)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel, command);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn poll_status(&self, handle: &DeviceHandle, channel: u8) -> Result<StatusSnapshot> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::poll_status(session, channel)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn read_position(&self, handle: &DeviceHandle, channel: u8) -> Result<i64> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::read_position(session, channel)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn read_eeprom(&self, handle: &DeviceHandle) -> Result<Option<String>> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::read_stage_definition(session)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = handle;
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn velocity_params(&self, handle: &DeviceHandle, channel: u8) -> Result<VelocityParams> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::velocity_params(session, channel)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn set_velocity_params(
        &self,
        handle: &DeviceHandle,
        channel: u8,
        params: VelocityParams,
    ) -> Result<()> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::set_velocity_params(session, channel, params)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel, params);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }

    async fn drive_params(&self, handle: &DeviceHandle, channel: u8) -> Result<DriveParams> {
        #[cfg(feature = "kinesis_hardware")]
        {
            let session = self.session(handle)?;
            Self::blocking(move || ffi::drive_params(session, channel)).await
        }

        #[cfg(not(feature = "kinesis_hardware"))]
        {
            let _ = (handle, channel);
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        }
    }
}

/// Raw SDK bindings and family dispatch.
///
/// Return codes are 0 on success; anything else maps to a communication
/// error carrying the code. Status bit masks are shared across families.
#[cfg(feature = "kinesis_hardware")]
#[allow(unsafe_code)]
mod ffi {
    use std::ffi::{c_char, c_int, c_long, c_short, c_ulong, CString};

    use super::{
        Command, DriveParams, MotionError, Result, StatusSnapshot, VelocityParams,
    };
    use crate::backend::Direction;
    use crate::catalog::controllers::ControllerType;

    const STATUS_LIMIT_CW: c_ulong = 0x0000_0001;
    const STATUS_LIMIT_CCW: c_ulong = 0x0000_0002;
    const STATUS_MOVING_CW: c_ulong = 0x0000_0010;
    const STATUS_MOVING_CCW: c_ulong = 0x0000_0020;
    const STATUS_JOGGING_CW: c_ulong = 0x0000_0040;
    const STATUS_JOGGING_CCW: c_ulong = 0x0000_0080;
    const STATUS_HOMING: c_ulong = 0x0000_0200;
    const STATUS_HOMED: c_ulong = 0x0000_0400;
    const STATUS_ENABLED: c_ulong = 0x8000_0000;

    const MOT_FORWARDS: c_short = 1;
    const MOT_BACKWARDS: c_short = 2;

    const DEVICE_LIST_BUF: usize = 512;
    const STAGE_DEF_BUF: usize = 64;

    #[link(name = "thorlabs.motioncontrol.deviceserver")]
    extern "C" {
        fn TLI_BuildDeviceList() -> c_short;
        fn TLI_GetDeviceListExt(receive_buffer: *mut c_char, size: c_ulong) -> c_short;
    }

    #[link(name = "thorlabs.motioncontrol.kcube.dcservo")]
    extern "C" {
        fn CC_Open(serial: *const c_char) -> c_short;
        fn CC_Close(serial: *const c_char);
        fn CC_Identify(serial: *const c_char);
        fn CC_Home(serial: *const c_char) -> c_short;
        fn CC_MoveToPosition(serial: *const c_char, index: c_int) -> c_short;
        fn CC_MoveRelative(serial: *const c_char, displacement: c_int) -> c_short;
        fn CC_SetJogStepSize(serial: *const c_char, step_size: c_ulong) -> c_short;
        fn CC_MoveJog(serial: *const c_char, direction: c_short) -> c_short;
        fn CC_MoveAtVelocity(serial: *const c_char, direction: c_short) -> c_short;
        fn CC_StopImmediate(serial: *const c_char) -> c_short;
        fn CC_EnableChannel(serial: *const c_char) -> c_short;
        fn CC_DisableChannel(serial: *const c_char) -> c_short;
        fn CC_SetPositionCounter(serial: *const c_char, count: c_long) -> c_short;
        fn CC_GetPosition(serial: *const c_char) -> c_int;
        fn CC_RequestStatusBits(serial: *const c_char) -> c_short;
        fn CC_GetStatusBits(serial: *const c_char) -> c_ulong;
        fn CC_GetVelParams(
            serial: *const c_char,
            acceleration: *mut c_int,
            max_velocity: *mut c_int,
        ) -> c_short;
        fn CC_SetVelParams(
            serial: *const c_char,
            acceleration: c_int,
            max_velocity: c_int,
        ) -> c_short;
        fn CC_GetStageDefinition(
            serial: *const c_char,
            part_number: *mut c_char,
            size: c_ulong,
        ) -> c_short;
    }

    #[link(name = "thorlabs.motioncontrol.kcube.brushlessmotor")]
    extern "C" {
        fn BMC_Open(serial: *const c_char) -> c_short;
        fn BMC_Close(serial: *const c_char);
        fn BMC_Identify(serial: *const c_char);
        fn BMC_Home(serial: *const c_char) -> c_short;
        fn BMC_MoveToPosition(serial: *const c_char, index: c_int) -> c_short;
        fn BMC_MoveRelative(serial: *const c_char, displacement: c_int) -> c_short;
        fn BMC_SetJogStepSize(serial: *const c_char, step_size: c_ulong) -> c_short;
        fn BMC_MoveJog(serial: *const c_char, direction: c_short) -> c_short;
        fn BMC_MoveAtVelocity(serial: *const c_char, direction: c_short) -> c_short;
        fn BMC_StopImmediate(serial: *const c_char) -> c_short;
        fn BMC_EnableChannel(serial: *const c_char) -> c_short;
        fn BMC_DisableChannel(serial: *const c_char) -> c_short;
        fn BMC_SetPositionCounter(serial: *const c_char, count: c_long) -> c_short;
        fn BMC_GetPosition(serial: *const c_char) -> c_int;
        fn BMC_RequestStatusBits(serial: *const c_char) -> c_short;
        fn BMC_GetStatusBits(serial: *const c_char) -> c_ulong;
        fn BMC_GetVelParams(
            serial: *const c_char,
            acceleration: *mut c_int,
            max_velocity: *mut c_int,
        ) -> c_short;
        fn BMC_SetVelParams(
            serial: *const c_char,
            acceleration: c_int,
            max_velocity: c_int,
        ) -> c_short;
        fn BMC_GetStageDefinition(
            serial: *const c_char,
            part_number: *mut c_char,
            size: c_ulong,
        ) -> c_short;
    }

    #[link(name = "thorlabs.motioncontrol.kcube.inertialmotor")]
    extern "C" {
        fn KIM_Open(serial: *const c_char) -> c_short;
        fn KIM_Close(serial: *const c_char);
        fn KIM_Identify(serial: *const c_char);
        fn KIM_Enable(serial: *const c_char) -> c_short;
        fn KIM_Disable(serial: *const c_char) -> c_short;
        fn KIM_MoveAbsolute(serial: *const c_char, channel: c_short, position: c_int) -> c_short;
        fn KIM_MoveRelative(serial: *const c_char, channel: c_short, step: c_int) -> c_short;
        fn KIM_MoveJog(serial: *const c_char, channel: c_short, direction: c_short) -> c_short;
        fn KIM_MoveStop(serial: *const c_char, channel: c_short) -> c_short;
        fn KIM_SetPosition(serial: *const c_char, channel: c_short, position: c_int) -> c_short;
        fn KIM_GetCurrentPosition(serial: *const c_char, channel: c_short) -> c_int;
        fn KIM_RequestStatus(serial: *const c_char) -> c_short;
        fn KIM_GetStatusBits(serial: *const c_char, channel: c_short) -> c_ulong;
        fn KIM_SetDriveOPParameters(
            serial: *const c_char,
            channel: c_short,
            max_voltage: c_short,
            step_rate: c_int,
            step_acceleration: c_int,
        ) -> c_short;
        fn KIM_GetDriveOPParameters(
            serial: *const c_char,
            channel: c_short,
            max_voltage: *mut c_short,
            step_rate: *mut c_int,
            step_acceleration: *mut c_int,
        ) -> c_short;
    }

    #[link(name = "thorlabs.motioncontrol.kcube.piezo")]
    extern "C" {
        fn PCC_Open(serial: *const c_char) -> c_short;
        fn PCC_Close(serial: *const c_char);
        fn PCC_Identify(serial: *const c_char);
        fn PCC_Enable(serial: *const c_char) -> c_short;
        fn PCC_Disable(serial: *const c_char) -> c_short;
        fn PCC_SetOutputVoltage(serial: *const c_char, volts: c_short) -> c_short;
        fn PCC_GetOutputVoltage(serial: *const c_char) -> c_short;
        fn PCC_GetMaxOutputVoltage(serial: *const c_char) -> c_short;
        fn PCC_SetPosition(serial: *const c_char, position: c_short) -> c_short;
        fn PCC_GetPosition(serial: *const c_char) -> c_short;
        fn PCC_RequestStatusBits(serial: *const c_char) -> c_short;
        fn PCC_GetStatusBits(serial: *const c_char) -> c_ulong;
    }

    /// Function family a serial prefix maps to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) enum Family {
        /// `CC_` K-Cube DC servo interface, also used by the TDC001.
        Cc,
        /// `BMC_` brushless interface.
        Bmc,
        /// `KIM_` inertial interface.
        Kim,
        /// `PCC_` piezo interface.
        Pcc,
    }

    impl Family {
        pub(super) fn for_serial(serial: u32) -> Result<Family> {
            let controller_type = ControllerType::from_serial(serial).ok_or_else(|| {
                MotionError::Configuration(format!(
                    "Serial {serial} does not match a supported controller"
                ))
            })?;
            match controller_type {
                ControllerType::Kdc101 | ControllerType::Tdc001 => Ok(Family::Cc),
                ControllerType::Kbd101 => Ok(Family::Bmc),
                ControllerType::Kim101 => Ok(Family::Kim),
                ControllerType::Kpz101 => Ok(Family::Pcc),
                ControllerType::Tpz001 => Err(MotionError::Configuration(
                    "TPZ001 is not served by the Kinesis SDK; use the apt backend".to_string(),
                )),
            }
        }
    }

    /// One open SDK connection.
    #[derive(Debug, Clone, Copy)]
    pub(super) struct Session {
        pub(super) serial: u32,
        pub(super) family: Family,
    }

    fn serial_cstr(serial: u32) -> CString {
        // Decimal digits never contain an interior NUL.
        CString::new(serial.to_string()).unwrap_or_default()
    }

    fn check(op: &str, serial: u32, code: c_short) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(MotionError::Communication(format!(
                "Kinesis {op} failed on {serial} with code {code}"
            )))
        }
    }

    fn direction_arg(direction: Direction) -> c_short {
        match direction {
            Direction::Forward => MOT_FORWARDS,
            Direction::Reverse => MOT_BACKWARDS,
        }
    }

    fn require_single_channel(family: Family, channel: u8) -> Result<()> {
        if family != Family::Kim && channel != 1 {
            return Err(MotionError::Configuration(format!(
                "Channel {channel} on a single-channel controller"
            )));
        }
        Ok(())
    }

    fn unsupported(session: Session, command: &Command) -> MotionError {
        MotionError::Configuration(format!(
            "Command {} is not supported by device {}",
            command.name(),
            session.serial
        ))
    }

    pub(super) fn enumerate() -> Result<Vec<u32>> {
        let code = unsafe { TLI_BuildDeviceList() };
        if code != 0 {
            return Err(MotionError::Communication(format!(
                "TLI_BuildDeviceList failed with code {code}"
            )));
        }

        let mut buf = vec![0 as c_char; DEVICE_LIST_BUF];
        let code = unsafe { TLI_GetDeviceListExt(buf.as_mut_ptr(), buf.len() as c_ulong) };
        if code != 0 {
            return Err(MotionError::Communication(format!(
                "TLI_GetDeviceListExt failed with code {code}"
            )));
        }

        let bytes: Vec<u8> = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let list = String::from_utf8_lossy(&bytes);
        Ok(list
            .split(',')
            .filter_map(|s| s.trim().parse::<u32>().ok())
            .collect())
    }

    pub(super) fn open(family: Family, serial: u32) -> Result<()> {
        let cstr = serial_cstr(serial);
        let code = unsafe {
            match family {
                Family::Cc => CC_Open(cstr.as_ptr()),
                Family::Bmc => BMC_Open(cstr.as_ptr()),
                Family::Kim => KIM_Open(cstr.as_ptr()),
                Family::Pcc => PCC_Open(cstr.as_ptr()),
            }
        };
        if code != 0 {
            return Err(MotionError::Connection(format!(
                "Kinesis open failed on {serial} with code {code}"
            )));
        }
        Ok(())
    }

    pub(super) fn close(session: Session) -> Result<()> {
        let cstr = serial_cstr(session.serial);
        unsafe {
            match session.family {
                Family::Cc => CC_Close(cstr.as_ptr()),
                Family::Bmc => BMC_Close(cstr.as_ptr()),
                Family::Kim => KIM_Close(cstr.as_ptr()),
                Family::Pcc => PCC_Close(cstr.as_ptr()),
            }
        }
        Ok(())
    }

    pub(super) fn send(session: Session, channel: u8, command: Command) -> Result<()> {
        require_single_channel(session.family, channel)?;
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let p = cstr.as_ptr();
        let ch = channel as c_short;

        let code = unsafe {
            match (session.family, &command) {
                (Family::Cc, Command::Identify) => {
                    CC_Identify(p);
                    0
                }
                (Family::Cc, Command::Home) => CC_Home(p),
                (Family::Cc, Command::MoveAbsolute { counts }) => {
                    CC_MoveToPosition(p, *counts as c_int)
                }
                (Family::Cc, Command::MoveRelative { counts }) => {
                    CC_MoveRelative(p, *counts as c_int)
                }
                (Family::Cc, Command::Jog { direction, steps }) => {
                    let code = CC_SetJogStepSize(p, *steps as c_ulong);
                    if code == 0 {
                        CC_MoveJog(p, direction_arg(*direction))
                    } else {
                        code
                    }
                }
                (Family::Cc, Command::JogContinuous { direction }) => {
                    CC_MoveAtVelocity(p, direction_arg(*direction))
                }
                (Family::Cc, Command::Stop) => CC_StopImmediate(p),
                (Family::Cc, Command::EnableChannel) => CC_EnableChannel(p),
                (Family::Cc, Command::DisableChannel) => CC_DisableChannel(p),
                (Family::Cc, Command::SetPositionAs { counts }) => {
                    CC_SetPositionCounter(p, *counts as c_long)
                }

                (Family::Bmc, Command::Identify) => {
                    BMC_Identify(p);
                    0
                }
                (Family::Bmc, Command::Home) => BMC_Home(p),
                (Family::Bmc, Command::MoveAbsolute { counts }) => {
                    BMC_MoveToPosition(p, *counts as c_int)
                }
                (Family::Bmc, Command::MoveRelative { counts }) => {
                    BMC_MoveRelative(p, *counts as c_int)
                }
                (Family::Bmc, Command::Jog { direction, steps }) => {
                    let code = BMC_SetJogStepSize(p, *steps as c_ulong);
                    if code == 0 {
                        BMC_MoveJog(p, direction_arg(*direction))
                    } else {
                        code
                    }
                }
                (Family::Bmc, Command::JogContinuous { direction }) => {
                    BMC_MoveAtVelocity(p, direction_arg(*direction))
                }
                (Family::Bmc, Command::Stop) => BMC_StopImmediate(p),
                (Family::Bmc, Command::EnableChannel) => BMC_EnableChannel(p),
                (Family::Bmc, Command::DisableChannel) => BMC_DisableChannel(p),
                (Family::Bmc, Command::SetPositionAs { counts }) => {
                    BMC_SetPositionCounter(p, *counts as c_long)
                }

                (Family::Kim, Command::Identify) => {
                    KIM_Identify(p);
                    0
                }
                (Family::Kim, Command::MoveAbsolute { counts }) => {
                    KIM_MoveAbsolute(p, ch, *counts as c_int)
                }
                (Family::Kim, Command::MoveRelative { counts }) => {
                    KIM_MoveRelative(p, ch, *counts as c_int)
                }
                (Family::Kim, Command::Jog { direction, steps }) => {
                    // The KIM jog is relative by a signed step count.
                    KIM_MoveRelative(p, ch, (*steps * direction.sign()) as c_int)
                }
                (Family::Kim, Command::JogContinuous { direction }) => {
                    KIM_MoveJog(p, ch, direction_arg(*direction))
                }
                (Family::Kim, Command::Stop) => KIM_MoveStop(p, ch),
                (Family::Kim, Command::EnableChannel) => KIM_Enable(p),
                (Family::Kim, Command::DisableChannel) => KIM_Disable(p),
                (Family::Kim, Command::SetPositionAs { counts }) => {
                    KIM_SetPosition(p, ch, *counts as c_int)
                }
                (Family::Kim, Command::SetDriveParams(params)) => KIM_SetDriveOPParameters(
                    p,
                    ch,
                    params.max_voltage as c_short,
                    params.step_rate as c_int,
                    params.step_acceleration as c_int,
                ),

                (Family::Pcc, Command::Identify) => {
                    PCC_Identify(p);
                    0
                }
                (Family::Pcc, Command::SetVoltage { volts }) => {
                    // Output is commanded as a fraction of the hardware
                    // range, 32767 = full scale. The max readback is in
                    // tenths of a volt.
                    let max = PCC_GetMaxOutputVoltage(p) as f64 / 10.0;
                    if max <= 0.0 {
                        return Err(MotionError::Communication(format!(
                            "Device {serial} reports no output range"
                        )));
                    }
                    PCC_SetOutputVoltage(p, (volts / max * 32_767.0).round() as c_short)
                }
                (Family::Pcc, Command::MoveAbsolute { counts }) => {
                    PCC_SetPosition(p, *counts as c_short)
                }
                (Family::Pcc, Command::Stop) => PCC_SetOutputVoltage(p, 0),
                (Family::Pcc, Command::EnableChannel) => PCC_Enable(p),
                (Family::Pcc, Command::DisableChannel) => PCC_Disable(p),

                _ => return Err(unsupported(session, &command)),
            }
        };
        check(command.name(), serial, code)
    }

    pub(super) fn poll_status(session: Session, channel: u8) -> Result<StatusSnapshot> {
        require_single_channel(session.family, channel)?;
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let p = cstr.as_ptr();
        let ch = channel as c_short;

        let (bits, position, output_voltage) = unsafe {
            match session.family {
                Family::Cc => {
                    check("request_status", serial, CC_RequestStatusBits(p))?;
                    (CC_GetStatusBits(p), CC_GetPosition(p) as i64, None)
                }
                Family::Bmc => {
                    check("request_status", serial, BMC_RequestStatusBits(p))?;
                    (BMC_GetStatusBits(p), BMC_GetPosition(p) as i64, None)
                }
                Family::Kim => {
                    check("request_status", serial, KIM_RequestStatus(p))?;
                    (
                        KIM_GetStatusBits(p, ch),
                        KIM_GetCurrentPosition(p, ch) as i64,
                        None,
                    )
                }
                Family::Pcc => {
                    check("request_status", serial, PCC_RequestStatusBits(p))?;
                    let max = PCC_GetMaxOutputVoltage(p) as f64 / 10.0;
                    let volts = PCC_GetOutputVoltage(p) as f64 / 32_767.0 * max;
                    (PCC_GetStatusBits(p), PCC_GetPosition(p) as i64, Some(volts))
                }
            }
        };

        Ok(StatusSnapshot {
            position,
            moving: bits
                & (STATUS_MOVING_CW | STATUS_MOVING_CCW | STATUS_JOGGING_CW | STATUS_JOGGING_CCW)
                != 0,
            homing: bits & STATUS_HOMING != 0,
            homed: bits & STATUS_HOMED != 0,
            channel_enabled: bits & STATUS_ENABLED != 0,
            hardware_fault: false,
            forward_limit: bits & STATUS_LIMIT_CW != 0,
            reverse_limit: bits & STATUS_LIMIT_CCW != 0,
            output_voltage,
        })
    }

    pub(super) fn read_position(session: Session, channel: u8) -> Result<i64> {
        Ok(poll_status(session, channel)?.position)
    }

    pub(super) fn read_stage_definition(session: Session) -> Result<Option<String>> {
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let mut buf = vec![0 as c_char; STAGE_DEF_BUF];

        let code = unsafe {
            match session.family {
                Family::Cc => {
                    CC_GetStageDefinition(cstr.as_ptr(), buf.as_mut_ptr(), buf.len() as c_ulong)
                }
                Family::Bmc => {
                    BMC_GetStageDefinition(cstr.as_ptr(), buf.as_mut_ptr(), buf.len() as c_ulong)
                }
                Family::Kim | Family::Pcc => {
                    return Err(MotionError::Configuration(format!(
                        "Device {serial} has no stage EEPROM"
                    )))
                }
            }
        };
        check("stage_definition", serial, code)?;

        let bytes: Vec<u8> = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let part = String::from_utf8_lossy(&bytes).trim().to_string();
        Ok(if part.is_empty() { None } else { Some(part) })
    }

    pub(super) fn velocity_params(session: Session, channel: u8) -> Result<VelocityParams> {
        require_single_channel(session.family, channel)?;
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let mut acceleration: c_int = 0;
        let mut velocity: c_int = 0;

        let code = unsafe {
            match session.family {
                Family::Cc => CC_GetVelParams(cstr.as_ptr(), &mut acceleration, &mut velocity),
                Family::Bmc => BMC_GetVelParams(cstr.as_ptr(), &mut acceleration, &mut velocity),
                Family::Kim | Family::Pcc => {
                    return Err(MotionError::Configuration(format!(
                        "Device {serial} has no velocity profile"
                    )))
                }
            }
        };
        check("get_vel_params", serial, code)?;
        Ok(VelocityParams {
            velocity: velocity as f64,
            acceleration: acceleration as f64,
        })
    }

    pub(super) fn set_velocity_params(
        session: Session,
        channel: u8,
        params: VelocityParams,
    ) -> Result<()> {
        require_single_channel(session.family, channel)?;
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let acceleration = params.acceleration.round() as c_int;
        let velocity = params.velocity.round() as c_int;

        let code = unsafe {
            match session.family {
                Family::Cc => CC_SetVelParams(cstr.as_ptr(), acceleration, velocity),
                Family::Bmc => BMC_SetVelParams(cstr.as_ptr(), acceleration, velocity),
                Family::Kim | Family::Pcc => {
                    return Err(MotionError::Configuration(format!(
                        "Device {serial} has no velocity profile"
                    )))
                }
            }
        };
        check("set_vel_params", serial, code)
    }

    pub(super) fn drive_params(session: Session, channel: u8) -> Result<DriveParams> {
        if session.family != Family::Kim {
            return Err(MotionError::Configuration(format!(
                "Device {} has no inertial drive parameters",
                session.serial
            )));
        }
        let serial = session.serial;
        let cstr = serial_cstr(serial);
        let mut max_voltage: c_short = 0;
        let mut step_rate: c_int = 0;
        let mut step_acceleration: c_int = 0;

        let code = unsafe {
            KIM_GetDriveOPParameters(
                cstr.as_ptr(),
                channel as c_short,
                &mut max_voltage,
                &mut step_rate,
                &mut step_acceleration,
            )
        };
        check("get_drive_params", serial, code)?;
        Ok(DriveParams {
            step_rate: step_rate.max(0) as u32,
            step_acceleration: step_acceleration.max(0) as u32,
            max_voltage: max_voltage.max(0) as u32,
        })
    }
}

#[cfg(all(test, not(feature = "kinesis_hardware")))]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_feature() {
        assert!(matches!(
            KinesisBackend::new("/opt/thorlabs/kinesis"),
            Err(MotionError::FeatureNotEnabled("kinesis_hardware"))
        ));
    }
}

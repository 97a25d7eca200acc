//! Device discovery and stage auto-detection.
//!
//! Discovery asks the backend for every serial number it can see, keeps
//! the ones whose prefix matches a supported controller, and reports them
//! in ascending serial order. Detection goes one step further for servo
//! and brushless controllers: the motor's EEPROM stores the fitted
//! stage's part number, so a transient session is opened per device, the
//! EEPROM read, and the part number resolved against the stage catalog.
//!
//! Probing never aborts a scan. A device that cannot be opened or whose
//! EEPROM read fails is reported as [`StageDetection::Failed`] and the
//! scan continues with the next device.

use log::{debug, info, warn};

use crate::backend::{Backend, BackendKind};
use crate::catalog::controllers::ControllerType;
use crate::catalog::stages::{self, StageDescriptor};
use crate::error::Result;

/// One discovered controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Serial number.
    pub serial: u32,
    /// Controller model derived from the serial prefix.
    pub controller_type: ControllerType,
    /// Backend that reported the device.
    pub backend: BackendKind,
    /// Number of motion channels.
    pub channels: u8,
    /// Human-readable controller description.
    pub description: &'static str,
}

/// Outcome of probing one device for a fitted stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageDetection {
    /// EEPROM names a stage the catalog knows.
    Detected {
        /// Part number as stored in the EEPROM.
        part_number: String,
        /// Matching catalog entry.
        stage: &'static StageDescriptor,
    },
    /// EEPROM names a stage the catalog does not know.
    Unrecognized {
        /// Part number as stored in the EEPROM.
        part_number: String,
    },
    /// EEPROM holds no stage definition.
    NotFitted,
    /// This controller class has no stage EEPROM to probe.
    NotApplicable,
    /// The probe itself failed; the device may be in use elsewhere.
    Failed {
        /// Why the probe failed.
        reason: String,
    },
}

/// Enumerate all supported controllers visible to `backend`.
///
/// Serials with an unknown prefix are skipped. Duplicates some vendor
/// stacks report are collapsed, and results come back in ascending serial
/// order.
pub async fn discover_devices(backend: &dyn Backend) -> Result<Vec<DeviceDescriptor>> {
    let mut serials = backend.enumerate().await?;
    serials.sort_unstable();
    serials.dedup();

    let mut devices = Vec::with_capacity(serials.len());
    for serial in serials {
        let Some(controller_type) = ControllerType::from_serial(serial) else {
            debug!("Skipping serial {serial} with unsupported prefix");
            continue;
        };
        let info = controller_type.info();
        devices.push(DeviceDescriptor {
            serial,
            controller_type,
            backend: backend.kind(),
            channels: info.channels,
            description: info.description,
        });
    }
    info!(
        "Discovered {} controller(s) on the {} backend",
        devices.len(),
        backend.kind()
    );
    Ok(devices)
}

/// Enumerate controllers and probe each homing-capable one for its stage.
pub async fn discover_devices_with_stages(
    backend: &dyn Backend,
) -> Result<Vec<(DeviceDescriptor, StageDetection)>> {
    let devices = discover_devices(backend).await?;
    let mut results = Vec::with_capacity(devices.len());
    for device in devices {
        let detection = if device.controller_type.supports_homing() {
            probe_stage(backend, device.serial).await
        } else {
            StageDetection::NotApplicable
        };
        results.push((device, detection));
    }
    Ok(results)
}

async fn probe_stage(backend: &dyn Backend, serial: u32) -> StageDetection {
    let handle = match backend.open(serial).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Cannot open {serial} for stage detection: {e}");
            return StageDetection::Failed {
                reason: e.to_string(),
            };
        }
    };

    let eeprom = backend.read_eeprom(&handle).await;
    if let Err(e) = backend.close(&handle).await {
        warn!("Closing probe session to {serial} failed: {e}");
    }

    match eeprom {
        Ok(Some(part_number)) => match stages::resolve(&part_number) {
            Some(stage) => {
                debug!("Device {serial} reports stage {part_number}");
                StageDetection::Detected { part_number, stage }
            }
            None => {
                warn!("Device {serial} reports unknown stage '{part_number}'");
                StageDetection::Unrecognized { part_number }
            }
        },
        Ok(None) => StageDetection::NotFitted,
        Err(e) => {
            warn!("EEPROM read failed on {serial}: {e}");
            StageDetection::Failed {
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimFaults};

    #[tokio::test]
    async fn test_discovery_sorts_and_identifies() {
        let backend = SimBackend::new();
        backend.add_device(97_000_010, None);
        backend.add_device(27_000_002, Some("PRM1Z8"));
        backend.add_device(28_000_005, Some("DDS100"));

        let devices = discover_devices(&backend).await.unwrap();
        assert_eq!(
            devices.iter().map(|d| d.serial).collect::<Vec<_>>(),
            vec![27_000_002, 28_000_005, 97_000_010]
        );
        assert_eq!(devices[0].controller_type, ControllerType::Kdc101);
        assert_eq!(devices[2].channels, 4);
        assert!(devices.iter().all(|d| d.backend == BackendKind::Simulated));
    }

    #[tokio::test]
    async fn test_discovery_skips_unknown_prefix_and_duplicates() {
        let backend = SimBackend::new();
        backend.add_device(55_000_001, None);
        backend.add_device(27_000_001, None);
        backend.set_faults(
            27_000_001,
            SimFaults {
                enumerate_twice: true,
                ..SimFaults::default()
            },
        );

        let devices = discover_devices(&backend).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, 27_000_001);
    }

    #[tokio::test]
    async fn test_stage_detection_outcomes() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, Some("Z825B"));
        backend.add_device(83_000_001, Some("NOSUCHSTAGE"));
        backend.add_device(27_000_002, None);
        backend.add_device(97_000_001, Some("PIA13"));

        let results = discover_devices_with_stages(&backend).await.unwrap();
        let by_serial = |serial: u32| {
            results
                .iter()
                .find(|(d, _)| d.serial == serial)
                .map(|(_, det)| det.clone())
                .unwrap()
        };

        assert!(matches!(
            by_serial(27_000_001),
            StageDetection::Detected { ref part_number, stage }
                if part_number == "Z825B" && stage.part_number == "Z825B"
        ));
        assert!(matches!(
            by_serial(83_000_001),
            StageDetection::Unrecognized { ref part_number } if part_number == "NOSUCHSTAGE"
        ));
        assert_eq!(by_serial(27_000_002), StageDetection::NotFitted);
        // Inertial controllers have no stage EEPROM.
        assert_eq!(by_serial(97_000_001), StageDetection::NotApplicable);
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_abort_scan() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, Some("PRM1Z8"));
        backend.add_device(27_000_002, Some("PRM1Z8"));
        backend.set_faults(
            27_000_001,
            SimFaults {
                fail_eeprom: true,
                ..SimFaults::default()
            },
        );

        let results = discover_devices_with_stages(&backend).await.unwrap();
        assert!(matches!(results[0].1, StageDetection::Failed { .. }));
        assert!(matches!(results[1].1, StageDetection::Detected { .. }));
    }

    #[tokio::test]
    async fn test_probe_sessions_are_transient() {
        let backend = SimBackend::new();
        backend.add_device(27_000_001, Some("Z825B"));

        discover_devices_with_stages(&backend).await.unwrap();
        assert_eq!(backend.open_count(27_000_001), 1);
        assert!(!backend.is_open(27_000_001));

        // A failed EEPROM read still closes the probe session.
        backend.set_faults(
            27_000_001,
            SimFaults {
                fail_eeprom: true,
                ..SimFaults::default()
            },
        );
        discover_devices_with_stages(&backend).await.unwrap();
        assert_eq!(backend.open_count(27_000_001), 2);
        assert!(!backend.is_open(27_000_001));
    }
}

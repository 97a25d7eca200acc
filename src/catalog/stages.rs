//! Stage and actuator database.
//!
//! Master source of stage definitions: travel, units, encoder resolution,
//! velocity and acceleration ceilings, jog defaults, and which controllers
//! may drive each stage. Values come from Thorlabs product documentation.
//!
//! To add a stage, add an entry to [`STAGES`] with the datasheet values and
//! list it under the controllers that can drive it.
//!
//! Encoder-backed stages carry `counts_per_unit`, the factor between
//! physical units (degrees or millimeters) and encoder counts. Open-loop
//! actuators (PIA inertial, voltage piezos) have no encoder; their
//! `counts_per_unit` is `None` and positioning is step- or voltage-based.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::controllers::ControllerType;
use crate::error::{MotionError, Result};

/// Position units a stage is specified in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageUnits {
    /// Rotation stages.
    Degrees,
    /// Linear stages and actuators.
    Millimeters,
    /// Open-loop inertial actuators counted in drive steps.
    Steps,
    /// Voltage-driven piezos without feedback.
    Volts,
}

impl StageUnits {
    /// Short unit suffix for display ("deg", "mm", "steps", "V").
    pub fn suffix(self) -> &'static str {
        match self {
            StageUnits::Degrees => "deg",
            StageUnits::Millimeters => "mm",
            StageUnits::Steps => "steps",
            StageUnits::Volts => "V",
        }
    }
}

/// Full specification for one stage model.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    /// Stage part number, e.g. "PRM1Z8".
    pub part_number: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Controllers that can drive this stage.
    pub compatible_controllers: &'static [ControllerType],
    /// Total travel in `units`; `None` for unlimited or mount-dependent.
    pub travel: Option<f64>,
    /// Units positions are expressed in.
    pub units: StageUnits,
    /// Continuous rotation (no travel limits).
    pub continuous_rotation: bool,
    /// Encoder counts per unit; `None` for open-loop actuators.
    pub counts_per_unit: Option<f64>,
    /// Maximum velocity in units/s, where meaningful.
    pub velocity_max: Option<f64>,
    /// Maximum acceleration in units/s^2, where meaningful.
    pub acceleration_max: Option<f64>,
    /// Default jog step in `units` (steps for inertial actuators).
    pub jog_step_default: f64,
    /// Nominal step size in mm for inertial actuators.
    pub step_size: Option<f64>,
    /// Maximum step rate in steps/s for inertial actuators.
    pub step_rate_max: Option<u32>,
    /// Maximum step acceleration in steps/s^2 for inertial actuators.
    pub step_acceleration_max: Option<u32>,
    /// Output voltage range for voltage-driven piezos.
    pub voltage_range: Option<(f64, f64)>,
}

impl StageDescriptor {
    /// Whether `controller` may drive this stage.
    pub fn compatible_with(&self, controller: ControllerType) -> bool {
        self.compatible_controllers.contains(&controller)
    }

    /// Convert a position in stage units to encoder counts.
    ///
    /// Fails with a configuration error for open-loop stages.
    pub fn to_counts(&self, position: f64) -> Result<i64> {
        let factor = self.counts_per_unit.ok_or_else(|| {
            MotionError::Configuration(format!(
                "Stage {} has no encoder; positions are not count-addressable",
                self.part_number
            ))
        })?;
        Ok((position * factor).round() as i64)
    }

    /// Convert encoder counts back to stage units.
    pub fn to_units(&self, counts: i64) -> Result<f64> {
        let factor = self.counts_per_unit.ok_or_else(|| {
            MotionError::Configuration(format!(
                "Stage {} has no encoder; positions are not count-addressable",
                self.part_number
            ))
        })?;
        Ok(counts as f64 / factor)
    }

    /// Check a target position against the travel range.
    ///
    /// Continuous-rotation stages and stages without a published travel
    /// accept any target.
    pub fn check_travel(&self, position: f64) -> Result<()> {
        if self.continuous_rotation {
            return Ok(());
        }
        if let Some(travel) = self.travel {
            if position < 0.0 || position > travel {
                return Err(MotionError::Configuration(format!(
                    "Position {:.4} {} outside travel range 0..{} {} of {}",
                    position,
                    self.units.suffix(),
                    travel,
                    self.units.suffix(),
                    self.part_number
                )));
            }
        }
        Ok(())
    }
}

const DC_SERVO: &[ControllerType] = &[ControllerType::Kdc101, ControllerType::Tdc001];
const BRUSHLESS: &[ControllerType] = &[ControllerType::Kbd101];
const INERTIAL: &[ControllerType] = &[ControllerType::Kim101];
const PIEZO: &[ControllerType] = &[ControllerType::Kpz101, ControllerType::Tpz001];

fn rotation_mount(
    part_number: &'static str,
    description: &'static str,
    velocity_max: f64,
    acceleration_max: f64,
    counts_per_degree: f64,
) -> StageDescriptor {
    StageDescriptor {
        part_number,
        description,
        compatible_controllers: DC_SERVO,
        travel: Some(360.0),
        units: StageUnits::Degrees,
        continuous_rotation: true,
        counts_per_unit: Some(counts_per_degree),
        velocity_max: Some(velocity_max),
        acceleration_max: Some(acceleration_max),
        jog_step_default: 1.0,
        step_size: None,
        step_rate_max: None,
        step_acceleration_max: None,
        voltage_range: None,
    }
}

fn linear_stage(
    part_number: &'static str,
    description: &'static str,
    travel: f64,
    velocity_max: f64,
    acceleration_max: f64,
    jog_step_default: f64,
    counts_per_mm: f64,
) -> StageDescriptor {
    StageDescriptor {
        part_number,
        description,
        compatible_controllers: DC_SERVO,
        travel: Some(travel),
        units: StageUnits::Millimeters,
        continuous_rotation: false,
        counts_per_unit: Some(counts_per_mm),
        velocity_max: Some(velocity_max),
        acceleration_max: Some(acceleration_max),
        jog_step_default,
        step_size: None,
        step_rate_max: None,
        step_acceleration_max: None,
        voltage_range: None,
    }
}

fn direct_drive_stage(part_number: &'static str, description: &'static str, travel: f64) -> StageDescriptor {
    StageDescriptor {
        part_number,
        description,
        compatible_controllers: BRUSHLESS,
        travel: Some(travel),
        units: StageUnits::Millimeters,
        continuous_rotation: false,
        counts_per_unit: Some(20_000.0),
        velocity_max: Some(500.0),
        acceleration_max: Some(5000.0),
        jog_step_default: 1.0,
        step_size: None,
        step_rate_max: None,
        step_acceleration_max: None,
        voltage_range: None,
    }
}

fn inertial_actuator(
    part_number: &'static str,
    description: &'static str,
    travel: Option<f64>,
    units: StageUnits,
) -> StageDescriptor {
    StageDescriptor {
        part_number,
        description,
        compatible_controllers: INERTIAL,
        travel,
        units,
        continuous_rotation: false,
        counts_per_unit: None,
        velocity_max: None,
        acceleration_max: None,
        jog_step_default: 100.0,
        step_size: Some(0.000_02),
        step_rate_max: Some(2000),
        step_acceleration_max: Some(100_000),
        voltage_range: None,
    }
}

fn piezo_actuator(
    part_number: &'static str,
    description: &'static str,
    travel: Option<f64>,
    units: StageUnits,
    voltage_max: f64,
    jog_step_default: f64,
) -> StageDescriptor {
    StageDescriptor {
        part_number,
        description,
        compatible_controllers: PIEZO,
        travel,
        units,
        continuous_rotation: false,
        counts_per_unit: None,
        velocity_max: None,
        acceleration_max: None,
        jog_step_default,
        step_size: None,
        step_rate_max: None,
        step_acceleration_max: None,
        voltage_range: Some((0.0, voltage_max)),
    }
}

/// Stage database, keyed by part number.
pub static STAGES: Lazy<HashMap<&'static str, StageDescriptor>> = Lazy::new(|| {
    let entries = [
        // Rotation mounts (DC servo)
        rotation_mount(
            "PRM1Z8",
            "Motorized Rotation Mount, 1\" Optics, 360 deg Continuous",
            25.0,
            25.0,
            1919.64,
        ),
        rotation_mount(
            "PRM1/MZ8",
            "Motorized Rotation Mount, 1\" Optics, Magnetic Encoder",
            25.0,
            25.0,
            1919.64,
        ),
        rotation_mount(
            "HDR50",
            "Heavy Duty Motorized Rotation Stage, 50mm Aperture",
            20.0,
            20.0,
            4096.0,
        ),
        rotation_mount(
            "K10CR1",
            "Motorized Rotation Mount, Cage System Compatible",
            20.0,
            20.0,
            2218.0,
        ),
        rotation_mount(
            "DDR25",
            "Direct Drive Rotation Stage, 25mm Aperture",
            180.0,
            500.0,
            5555.56,
        ),
        rotation_mount(
            "DDR100",
            "Direct Drive Rotation Stage, 100mm Aperture",
            80.0,
            200.0,
            5555.56,
        ),
        // Linear stages and actuators (DC servo)
        linear_stage(
            "Z825B",
            "Motorized Actuator, 25mm Travel",
            25.0,
            2.3,
            1.5,
            0.1,
            34_304.0,
        ),
        linear_stage(
            "Z812B",
            "Motorized Actuator, 12mm Travel",
            12.0,
            2.3,
            1.5,
            0.1,
            34_304.0,
        ),
        linear_stage(
            "Z612B",
            "Motorized Actuator, 6mm Travel",
            6.0,
            2.3,
            1.5,
            0.05,
            34_304.0,
        ),
        linear_stage(
            "MTS25-Z8",
            "25mm Motorized Translation Stage",
            25.0,
            2.4,
            3.0,
            0.1,
            34_555.0,
        ),
        linear_stage(
            "MTS50-Z8",
            "50mm Motorized Translation Stage",
            50.0,
            3.0,
            4.5,
            0.1,
            34_555.0,
        ),
        linear_stage(
            "LTS150",
            "150mm Long Travel Stage",
            150.0,
            3.0,
            2.0,
            1.0,
            409_600.0,
        ),
        linear_stage(
            "LTS300",
            "300mm Long Travel Stage",
            300.0,
            3.0,
            2.0,
            1.0,
            409_600.0,
        ),
        linear_stage(
            "PT1-Z8",
            "25mm Motorized Translation Stage (PT Series)",
            25.0,
            2.6,
            4.0,
            0.1,
            34_555.0,
        ),
        // Brushless direct drive stages (KBD101)
        direct_drive_stage("DDS100", "100mm Direct Drive Stage", 100.0),
        direct_drive_stage("DDSM100", "100mm Direct Drive Stage (M Series)", 100.0),
        direct_drive_stage("DDS220", "220mm Direct Drive Stage", 220.0),
        direct_drive_stage("DDS300", "300mm Direct Drive Stage", 300.0),
        direct_drive_stage("DDS600", "600mm Direct Drive Stage", 600.0),
        // Piezo inertia actuators (KIM101)
        inertial_actuator(
            "PIA13",
            "Piezo Inertia Actuator, 13mm Travel",
            Some(13.0),
            StageUnits::Millimeters,
        ),
        inertial_actuator(
            "PIA25",
            "Piezo Inertia Actuator, 25mm Travel",
            Some(25.0),
            StageUnits::Millimeters,
        ),
        inertial_actuator(
            "PIA50",
            "Piezo Inertia Actuator, 50mm Travel",
            Some(50.0),
            StageUnits::Millimeters,
        ),
        inertial_actuator(
            "PIAK10",
            "Piezo Inertia Actuator for Kinematic Mirror Mounts",
            None,
            StageUnits::Steps,
        ),
        inertial_actuator(
            "PIAK25",
            "Piezo Inertia Actuator for Larger Mirror Mounts",
            None,
            StageUnits::Steps,
        ),
        // Voltage-driven piezos (KPZ101/TPZ001)
        piezo_actuator(
            "PK4FA7P1",
            "Piezo Stack Actuator, 7um Travel",
            Some(0.007),
            StageUnits::Millimeters,
            75.0,
            0.001,
        ),
        piezo_actuator(
            "PAZ005",
            "Amplified Piezo Actuator, 5um Travel",
            Some(0.005),
            StageUnits::Millimeters,
            75.0,
            0.0005,
        ),
        piezo_actuator(
            "PAZ015",
            "Amplified Piezo Actuator, 15um Travel",
            Some(0.015),
            StageUnits::Millimeters,
            150.0,
            0.001,
        ),
        piezo_actuator(
            "POLARIS-K1PZ",
            "Piezo Mirror Mount, 1\" Optic",
            None,
            StageUnits::Volts,
            75.0,
            1.0,
        ),
    ];

    entries
        .into_iter()
        .map(|stage| (stage.part_number, stage))
        .collect()
});

/// Look up a stage by part number.
///
/// EEPROM part numbers sometimes carry trailing whitespace or lowercase
/// characters; matching is whitespace-trimmed and case-insensitive.
pub fn resolve(part_number: &str) -> Option<&'static StageDescriptor> {
    let wanted = part_number.trim();
    if let Some(stage) = STAGES.get(wanted) {
        return Some(stage);
    }
    STAGES
        .values()
        .find(|stage| stage.part_number.eq_ignore_ascii_case(wanted))
}

/// Part numbers of all stages a controller model can drive, sorted.
pub fn compatible_stages(controller: ControllerType) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = STAGES
        .values()
        .filter(|stage| stage.compatible_with(controller))
        .map(|stage| stage.part_number)
        .collect();
    names.sort_unstable();
    names
}

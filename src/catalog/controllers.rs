//! Controller registry.
//!
//! Maps Thorlabs serial number prefixes to controller models and their
//! hardware characteristics. Thorlabs encodes the model in the first two
//! digits of the serial number: 27123456 is a KDC101, 97000001 a KIM101.
//!
//! | Model  | Prefix | Channels | Class     |
//! |--------|--------|----------|-----------|
//! | KDC101 | 27     | 1        | DC servo  |
//! | KBD101 | 28     | 1        | Brushless |
//! | KPZ101 | 29     | 1        | Piezo     |
//! | TPZ001 | 81     | 1        | Piezo     |
//! | TDC001 | 83     | 1        | DC servo  |
//! | KIM101 | 97     | 4        | Inertial  |

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Broad motor class a controller drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorClass {
    /// Brushed DC servo with encoder feedback.
    DcServo,
    /// Brushless DC with encoder feedback.
    Brushless,
    /// Stick-slip piezo inertial drive, step counted, no encoder.
    Inertial,
    /// Voltage-driven piezo stack.
    Piezo,
}

/// Supported controller models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerType {
    /// K-Cube DC Servo Motor Driver.
    Kdc101,
    /// K-Cube Brushless DC Motor Driver.
    Kbd101,
    /// T-Cube DC Servo Motor Driver (legacy).
    Tdc001,
    /// K-Cube Piezo Inertial Motor Driver, 4 channels.
    Kim101,
    /// K-Cube Piezo Driver.
    Kpz101,
    /// T-Cube Piezo Driver (legacy).
    Tpz001,
}

/// Registry record for one controller model.
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    /// Model identifier.
    pub controller_type: ControllerType,
    /// Serial number prefix (first two digits).
    pub prefix: u32,
    /// Number of motion channels.
    pub channels: u8,
    /// Motor class driven by this controller.
    pub motor_class: MotorClass,
    /// Human-readable description.
    pub description: &'static str,
    /// Whether the controller supports a homing sequence.
    pub supports_homing: bool,
    /// Whether the controller reports closed-loop position.
    pub supports_position: bool,
    /// Legacy APT hardware type code, if the model exists in the APT server.
    pub apt_hw_type: Option<u32>,
}

static REGISTRY: Lazy<Vec<ControllerInfo>> = Lazy::new(|| {
    vec![
        ControllerInfo {
            controller_type: ControllerType::Kdc101,
            prefix: 27,
            channels: 1,
            motor_class: MotorClass::DcServo,
            description: "K-Cube DC Servo Motor Driver",
            supports_homing: true,
            supports_position: true,
            apt_hw_type: Some(42),
        },
        ControllerInfo {
            controller_type: ControllerType::Kbd101,
            prefix: 28,
            channels: 1,
            motor_class: MotorClass::Brushless,
            description: "K-Cube Brushless DC Motor Driver",
            supports_homing: true,
            supports_position: true,
            apt_hw_type: None,
        },
        ControllerInfo {
            controller_type: ControllerType::Tdc001,
            prefix: 83,
            channels: 1,
            motor_class: MotorClass::DcServo,
            description: "T-Cube DC Servo Motor Driver (Legacy)",
            supports_homing: true,
            supports_position: true,
            apt_hw_type: Some(27),
        },
        ControllerInfo {
            controller_type: ControllerType::Kim101,
            prefix: 97,
            channels: 4,
            motor_class: MotorClass::Inertial,
            description: "K-Cube Inertial Motor Driver (4-channel)",
            supports_homing: false,
            supports_position: false,
            apt_hw_type: None,
        },
        ControllerInfo {
            controller_type: ControllerType::Kpz101,
            prefix: 29,
            channels: 1,
            motor_class: MotorClass::Piezo,
            description: "K-Cube Piezo Driver",
            supports_homing: false,
            supports_position: true,
            apt_hw_type: Some(29),
        },
        ControllerInfo {
            controller_type: ControllerType::Tpz001,
            prefix: 81,
            channels: 1,
            motor_class: MotorClass::Piezo,
            description: "T-Cube Piezo Driver (Legacy)",
            supports_homing: false,
            supports_position: true,
            apt_hw_type: Some(81),
        },
    ]
});

impl ControllerType {
    /// Resolve a controller model from a full serial number.
    ///
    /// Returns `None` when the two leading digits match no known model.
    pub fn from_serial(serial: u32) -> Option<ControllerType> {
        let mut prefix = serial;
        while prefix >= 100 {
            prefix /= 10;
        }
        REGISTRY
            .iter()
            .find(|info| info.prefix == prefix)
            .map(|info| info.controller_type)
    }

    /// Resolve a controller model from its name, case-insensitively.
    pub fn from_name(name: &str) -> Option<ControllerType> {
        REGISTRY
            .iter()
            .find(|info| info.name().eq_ignore_ascii_case(name))
            .map(|info| info.controller_type)
    }

    /// Registry record for this model.
    pub fn info(self) -> &'static ControllerInfo {
        // The registry covers every enum variant.
        #[allow(clippy::unwrap_used)]
        REGISTRY
            .iter()
            .find(|info| info.controller_type == self)
            .unwrap()
    }

    /// Canonical model name, e.g. "KDC101".
    pub fn name(self) -> &'static str {
        self.info().name()
    }

    /// Number of motion channels on this model.
    pub fn channel_count(self) -> u8 {
        self.info().channels
    }

    /// Whether this model exists in the legacy APT server.
    pub fn supports_apt(self) -> bool {
        self.info().apt_hw_type.is_some()
    }

    /// Whether this model is a homing-capable motor controller.
    ///
    /// Only these models carry a stage EEPROM worth probing during
    /// discovery.
    pub fn supports_homing(self) -> bool {
        self.info().supports_homing
    }
}

impl ControllerInfo {
    /// Canonical model name, e.g. "KDC101".
    pub fn name(&self) -> &'static str {
        match self.controller_type {
            ControllerType::Kdc101 => "KDC101",
            ControllerType::Kbd101 => "KBD101",
            ControllerType::Tdc001 => "TDC001",
            ControllerType::Kim101 => "KIM101",
            ControllerType::Kpz101 => "KPZ101",
            ControllerType::Tpz001 => "TPZ001",
        }
    }
}

impl std::fmt::Display for ControllerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// All registry records, in table order.
pub fn all() -> &'static [ControllerInfo] {
    &REGISTRY
}

/// Registry records matching a motor class.
pub fn by_motor_class(class: MotorClass) -> Vec<&'static ControllerInfo> {
    REGISTRY
        .iter()
        .filter(|info| info.motor_class == class)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_lookup() {
        assert_eq!(
            ControllerType::from_serial(27_123_456),
            Some(ControllerType::Kdc101)
        );
        assert_eq!(
            ControllerType::from_serial(97_654_321),
            Some(ControllerType::Kim101)
        );
        assert_eq!(
            ControllerType::from_serial(83_000_001),
            Some(ControllerType::Tdc001)
        );
        assert_eq!(ControllerType::from_serial(55_123_456), None);
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(
            ControllerType::from_name("kim101"),
            Some(ControllerType::Kim101)
        );
        assert_eq!(ControllerType::from_name("ELL14"), None);
    }

    #[test]
    fn test_channel_counts() {
        assert_eq!(ControllerType::Kdc101.channel_count(), 1);
        assert_eq!(ControllerType::Kim101.channel_count(), 4);
    }

    #[test]
    fn test_apt_support_is_data_driven() {
        assert!(ControllerType::Kdc101.supports_apt());
        assert!(ControllerType::Tpz001.supports_apt());
        assert!(!ControllerType::Kbd101.supports_apt());
        assert!(!ControllerType::Kim101.supports_apt());
    }

    #[test]
    fn test_registry_prefixes_unique() {
        let mut prefixes: Vec<u32> = all().iter().map(|info| info.prefix).collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        assert_eq!(prefixes.len(), all().len());
    }
}

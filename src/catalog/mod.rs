//! Static device knowledge: controller registry and stage database.
//!
//! Both tables are data, not code. Adding support for a new controller or
//! stage means adding an entry, never a new type.

pub mod controllers;
pub mod stages;

pub use controllers::{ControllerInfo, ControllerType, MotorClass};
pub use stages::{StageDescriptor, StageUnits};

//! Unified control layer for Thorlabs motion controllers.
//!
//! This library drives the K-Cube and T-Cube controller families (DC servo,
//! brushless DC, piezo inertial, and voltage-driven piezo) through a single
//! capability set. Vendor access goes through the [`backend::Backend`] trait:
//! the native Kinesis SDK (`kinesis_hardware` feature), the legacy APT server
//! (`apt_hardware` feature), or the always-available simulated backend used
//! for development and tests.
//!
//! Typical usage goes through discovery and the controller factory:
//!
//! ```no_run
//! use std::sync::Arc;
//! use thorlabs_motion::backend::sim::SimBackend;
//! use thorlabs_motion::config::Settings;
//! use thorlabs_motion::controller::{create_controller, Controller};
//!
//! # async fn demo() -> thorlabs_motion::Result<()> {
//! let settings = Settings::default();
//! let backend = Arc::new(SimBackend::new());
//! backend.add_device(27_123_456, Some("PRM1Z8"));
//!
//! if let Controller::Motor(motor) = create_controller(backend, 27_123_456, &settings)? {
//!     motor.connect(None).await?;
//!     motor.home(true, None).await?;
//!     motor.move_absolute(45.0, true, None).await?;
//!     motor.disconnect().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;

pub use error::{MotionError, Result};

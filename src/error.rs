//! Error types for the motion control library.
//!
//! This module defines the primary error type, [`MotionError`], used across
//! backends, controllers, and discovery. Using the `thiserror` crate, it
//! provides a centralized taxonomy that callers can match on:
//!
//! - **`Connection`**: failures establishing, maintaining, or closing the
//!   link to a controller (device not found, vendor library refused the
//!   session, device vanished mid-use).
//! - **`Communication`**: a command or query reached the backend but the
//!   hardware transaction itself failed.
//! - **`Movement`**: motion-level failures on a connected device (homing
//!   fault, rejected move, settle failure other than a timeout).
//! - **`Timeout`**: a bounded wait for motion completion elapsed. Kept
//!   separate from `Movement` so callers can distinguish "the move failed"
//!   from "the move outlived its deadline and was stopped".
//! - **`Configuration`**: invalid user input or setup detected before any
//!   hardware command is issued (unknown serial prefix, missing stage
//!   binding, out-of-range channel or voltage).
//! - **`FeatureNotEnabled`**: a vendor backend was requested but compiled
//!   out. The message names the cargo feature to rebuild with.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type Result<T> = std::result::Result<T, MotionError>;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Movement error: {0}")]
    Movement(String),

    #[error("Motion wait timed out after {elapsed:.1} s")]
    Timeout {
        /// Seconds spent polling before the deadline elapsed.
        elapsed: f64,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(&'static str),
}

impl MotionError {
    /// True for errors raised by a settle-poll deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MotionError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MotionError::Movement("homing fault".to_string());
        assert_eq!(err.to_string(), "Movement error: homing fault");
    }

    #[test]
    fn test_timeout_classification() {
        let err = MotionError::Timeout { elapsed: 60.0 };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("60.0"));

        let err = MotionError::Movement("stalled".into());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_feature_not_enabled_names_feature() {
        let err = MotionError::FeatureNotEnabled("kinesis_hardware");
        assert!(err.to_string().contains("--features kinesis_hardware"));
    }
}

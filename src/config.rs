//! Runtime settings for the motion control library.
//!
//! Settings are layered from an optional TOML file and environment variables
//! prefixed with `THORMOTION_` (double underscore for nesting, e.g.
//! `THORMOTION_POLL_INTERVAL_MS=25`). The backend choice is made once, when
//! the process builds its backend, and never varies per call.
//!
//! The `[controllers]` table is the persisted device setup: for each serial
//! number, a per-channel record naming the attached stage and an optional
//! user role string. Controllers consult it at construction to bind a stage
//! descriptor.
//!
//! ```toml
//! backend = "kinesis"
//! kinesis_path = "C:/Program Files/Thorlabs/Kinesis"
//! poll_interval_ms = 50
//! default_timeout_s = 60.0
//!
//! [controllers.27123456.channels.1]
//! stage = "PRM1Z8"
//! role = "674_hwp_rotation"
//! ```

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// Which vendor backend the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Native Kinesis SDK (64-bit C API).
    Kinesis,
    /// Legacy APT server (32-bit C API).
    Apt,
    /// In-process simulated hardware.
    Simulated,
}

/// Configuration for one controller channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stage part number from the catalog (e.g. "PRM1Z8"), if assigned.
    pub stage: Option<String>,
    /// Free-form user label for this axis.
    pub role: Option<String>,
    /// Optional note shown in listings ("sample rotation", "focus").
    pub description: Option<String>,
}

/// Configuration for one controller, keyed by serial number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Per-channel records, keyed by 1-based channel number string.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

/// Top-level library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend selected for the lifetime of the process.
    pub backend: BackendChoice,

    /// Kinesis install directory, passed to the native backend.
    pub kinesis_path: String,

    /// Settle-poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Default deadline for blocking motion waits, in seconds.
    pub default_timeout_s: f64,

    /// Persisted per-device setup, keyed by serial number string.
    pub controllers: HashMap<String, ControllerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Simulated,
            kinesis_path: r"C:\Program Files\Thorlabs\Kinesis".to_string(),
            poll_interval_ms: 50,
            default_timeout_s: 60.0,
            controllers: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `THORMOTION_` env vars.
    ///
    /// A missing file is not an error; defaults fill every field.
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(Environment::with_prefix("THORMOTION").separator("__"))
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    /// Settle-poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Default motion-wait deadline as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_s.max(0.001))
    }

    /// Look up the channel record for a device, if configured.
    pub fn channel_config(&self, serial: u32, channel: u8) -> Option<&ChannelConfig> {
        self.controllers
            .get(&serial.to_string())
            .and_then(|c| c.channels.get(&channel.to_string()))
    }
}

//! Client configuration. Only the serial device and the Route-B credentials
//! are mandatory; everything else carries conservative defaults.

use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem path of the serial device the SK module sits behind.
    pub device: String,
    /// Route-B authentication id handed out by the utility.
    pub rbid: String,
    /// Route-B password handed out by the utility.
    pub password: String,
    #[serde(default = "defaults::baud_rate")]
    pub baud_rate: u32,
    /// Whether `SKRESET` is issued during open.
    #[serde(default = "defaults::reset_dev")]
    pub reset_dev: bool,
    /// First rung of the `SKSCAN` duration ladder.
    #[serde(default = "defaults::scan_duration_min")]
    pub scan_duration_min: u8,
    /// Last rung of the ladder; scanning past it raises `ScanFailure`.
    #[serde(default = "defaults::scan_duration_max")]
    pub scan_duration_max: u8,
    /// Upper bound on `SKJOIN` completing with a PANA result event.
    #[serde(default = "defaults::join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Default per-command response timeout.
    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Default deadline for an ECHONET Lite response.
    #[serde(default = "defaults::response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Patience for the transmission gate to open before the session is
    /// declared lost.
    #[serde(default = "defaults::gate_timeout_secs")]
    pub gate_timeout_secs: u64,
}

mod defaults {
    pub fn baud_rate() -> u32 {
        skstack::port::DEFAULT_BAUD_RATE
    }

    pub fn reset_dev() -> bool {
        true
    }

    pub fn scan_duration_min() -> u8 {
        4
    }

    pub fn scan_duration_max() -> u8 {
        8
    }

    pub fn join_timeout_secs() -> u64 {
        60
    }

    pub fn command_timeout_secs() -> u64 {
        10
    }

    pub fn response_timeout_secs() -> u64 {
        20
    }

    pub fn gate_timeout_secs() -> u64 {
        60
    }
}

impl Config {
    pub fn new(device: &str, rbid: &str, password: &str) -> Config {
        Config {
            device: device.to_string(),
            rbid: rbid.to_string(),
            password: password.to_string(),
            baud_rate: defaults::baud_rate(),
            reset_dev: defaults::reset_dev(),
            scan_duration_min: defaults::scan_duration_min(),
            scan_duration_max: defaults::scan_duration_max(),
            join_timeout_secs: defaults::join_timeout_secs(),
            command_timeout_secs: defaults::command_timeout_secs(),
            response_timeout_secs: defaults::response_timeout_secs(),
            gate_timeout_secs: defaults::gate_timeout_secs(),
        }
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let config: Config = serdeconv::from_toml_file(path)
            .map_err(|err| Error::Config(err.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(Error::Config("device path is empty".to_string()));
        }

        if self.rbid.is_empty() || self.password.is_empty() {
            return Err(Error::Config("route-B credentials are empty".to_string()));
        }

        if self.scan_duration_min > self.scan_duration_max {
            return Err(Error::Config(
                "scan_duration_min exceeds scan_duration_max".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    #[inline]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[inline]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    #[inline]
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }
}

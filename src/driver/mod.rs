//! Driver layer: per-model adapters producing a uniform instrument contract
//! from SCPI.
//!
//! Three device families share this module: power supply, electronic load,
//! and oscilloscope. Rather than one impl per vendor, a single
//! [`scpi_generic::ScpiGenericDriver`] is parameterized by a
//! [`profile::DeviceProfile`] describing the vendor's exact command
//! dialect — the command templates, mode enum table, and probe match rule
//! differ per instrument, but the polling/status/set_value machinery above
//! them does not.

pub mod profile;
pub mod registry;
pub mod scpi_generic;
pub mod scope;

use crate::scpi::Measurement;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// `psu`, `load`, or `oscilloscope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Bench power supply.
    Psu,
    /// Electronic load.
    Load,
    /// Digital storage oscilloscope.
    Oscilloscope,
}

/// Immutable instrument identity: `id` is derived deterministically
/// from the probe response, not assigned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInfo {
    /// Canonical id: `manufacturer-model-serial`, lowercased.
    pub id: String,
    /// Device family.
    pub kind: InstrumentKind,
    /// Manufacturer, as reported by `*IDN?`.
    pub manufacturer: String,
    /// Model, as reported by `*IDN?`.
    pub model: String,
    /// Serial number, as reported by `*IDN?` (empty if the device doesn't report one).
    pub serial: String,
}

/// A declared setpoint or measurement: name, unit, display precision, and
/// optional bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDescriptor {
    /// Field name, e.g. `"voltage"`.
    pub name: String,
    /// Unit string, e.g. `"V"`, `"A"`, `"W"`, `"Ω"`.
    pub unit: String,
    /// Preferred display decimal places.
    pub decimals: u8,
    /// Declared minimum, if bounded.
    pub min: Option<f64>,
    /// Declared maximum, if bounded.
    pub max: Option<f64>,
    /// Modes this field applies to; `None` means "all modes".
    pub applicable_modes: Option<Vec<String>>,
}

impl ValueDescriptor {
    /// Checks `value` against this descriptor's declared bounds.
    pub fn in_range(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

/// Declared capabilities for a PSU/load driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Device class label, e.g. `"electronic_load"`.
    pub device_class: String,
    /// Whether the device supports list-mode (programmed sequence) uploads.
    pub list_mode: bool,
    /// Whether the device supports 4-wire remote sensing.
    pub remote_sensing: bool,
    /// Ordered operating-mode names (`CC`, `CV`, …), in the device's canonical order.
    pub modes: Vec<String>,
    /// Whether the client may command a mode change (some loads are read-only on mode).
    pub modes_settable: bool,
    /// Ordered output/setpoint descriptors.
    pub outputs: Vec<ValueDescriptor>,
    /// Ordered measurement descriptors.
    pub measurements: Vec<ValueDescriptor>,
}

/// Reasons a probe declines or fails.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// `*IDN?` never answered.
    #[error("probe timed out")]
    Timeout,
    /// `*IDN?` answered, but named a different device class of the same manufacturer.
    #[error("wrong device class for this driver")]
    WrongDevice,
    /// `*IDN?` answered with a response that doesn't parse into four CSV fields.
    #[error("malformed *IDN? response")]
    MalformedIdn,
}

/// A single sampled status read: mode, output, setpoints and
/// measurements as of one polling-loop pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSample {
    /// Canonical mode name, if the device reported one this pass.
    pub mode: Option<String>,
    /// Output-enabled state.
    pub output_enabled: bool,
    /// Active setpoints (monotonic: unparseable fields keep the previous value upstream).
    pub setpoints: HashMap<String, f64>,
    /// Measurements (sentinel-aware; unparseable/invalid fields surface as `NotAMeasurement`).
    pub measurements: HashMap<String, Measurement>,
}

/// Uniform contract for power-supply and electronic-load drivers.
///
/// Every operation reports success-or-failure; a driver never retries on its
/// own account — retry policy belongs to the session layer above it.
#[async_trait]
pub trait Driver: Send {
    /// The identity discovered by [`Driver::probe`]. Panics if called before a successful probe.
    fn info(&self) -> &InstrumentInfo;

    /// Declared capabilities for this device.
    fn capabilities(&self) -> &Capabilities;

    /// Sends `*IDN?`, matches manufacturer/model, and fills in `info().id`.
    async fn probe(&mut self) -> Result<(), ProbeError>;

    /// Opens the underlying transport.
    async fn connect(&mut self) -> Result<(), DriverError>;

    /// Closes the underlying transport.
    async fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Takes one logical status sample (mode, output, setpoints, measurements).
    async fn get_status(&mut self) -> Result<StatusSample, DriverError>;

    /// Commands a mode change. Fails with [`DriverError::NotSupported`] if `capabilities().modes_settable` is false.
    async fn set_mode(&mut self, mode: &str) -> Result<(), DriverError>;

    /// Enables or disables the output.
    async fn set_output(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Writes a single named setpoint.
    async fn set_value(&mut self, name: &str, value: f64) -> Result<(), DriverError>;

    /// Reads a single named value directly from the device (bypassing `get_status`'s batching), if supported.
    async fn get_value(&mut self, _name: &str) -> Result<f64, DriverError> {
        Err(DriverError::NotSupported("get_value".to_string()))
    }
}

/// Driver-level operational failures (distinct from probe-time [`ProbeError`]).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The underlying transport failed; carries the transport error's display text.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response failed to parse as the expected SCPI grammar.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The operation named a field this driver doesn't declare.
    #[error("unknown field: {0}")]
    UnknownField(String),
    /// The operation isn't implemented by this device family/profile.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl From<crate::transport::TransportError> for DriverError {
    fn from(e: crate::transport::TransportError) -> Self {
        DriverError::Transport(e.to_string())
    }
}

impl From<crate::scpi::ScpiError> for DriverError {
    fn from(e: crate::scpi::ScpiError) -> Self {
        DriverError::Protocol(e.to_string())
    }
}

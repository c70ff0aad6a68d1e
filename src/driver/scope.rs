//! Oscilloscope driver contract and a generic SCPI implementation
//!.

use super::{DriverError, InstrumentInfo, ProbeError};
use crate::scpi::{self, Measurement};
use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declared capabilities for an oscilloscope driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeCapabilities {
    /// Analog channel count.
    pub channels: u32,
    /// Analog bandwidth in Hz.
    pub bandwidth: f64,
    /// Maximum real-time sample rate in samples/second.
    pub max_sample_rate: f64,
    /// Maximum acquisition memory depth in samples.
    pub max_memory_depth: u64,
    /// Measurement type names this device can compute on-instrument via `get_measurement`.
    pub supported_measurements: Vec<String>,
    /// Whether the device has a built-in arbitrary waveform generator.
    pub has_awg: bool,
}

/// Input coupling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coupling {
    /// AC-coupled.
    Ac,
    /// DC-coupled.
    Dc,
    /// Grounded input.
    Gnd,
}

/// Trigger edge polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    /// Rising edge.
    Rising,
    /// Falling edge.
    Falling,
    /// Either edge.
    Either,
}

/// Acquisition sweep mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sweep {
    /// Free-running acquisition.
    Auto,
    /// Wait indefinitely for a qualifying trigger.
    Normal,
    /// Stop after one qualifying trigger.
    Single,
}

/// Instantaneous trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStatus {
    /// Acquisition stopped.
    Stopped,
    /// Waiting for a qualifying trigger.
    Wait,
    /// Free-running (no trigger required).
    Auto,
    /// A qualifying trigger has occurred.
    Triggered,
}

/// Per-channel vertical configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether the channel is displayed/acquired.
    pub enabled: bool,
    /// Vertical scale, volts/division.
    pub scale: f64,
    /// Vertical offset, volts.
    pub offset: f64,
    /// Input coupling.
    pub coupling: Coupling,
    /// Probe attenuation factor (e.g. 10.0 for a 10x probe).
    pub probe: f64,
    /// Bandwidth-limit filter enabled.
    pub bw_limit: bool,
}

/// Horizontal (timebase) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimebaseConfig {
    /// Time/division.
    pub scale: f64,
    /// Horizontal offset (trigger position).
    pub offset: f64,
    /// Timebase mode, e.g. `"main"`, `"xy"`, `"roll"`.
    pub mode: String,
}

/// Trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger source channel name.
    pub source: String,
    /// Trigger mode, e.g. `"edge"`.
    pub mode: String,
    /// Trigger input coupling.
    pub coupling: String,
    /// Trigger level, volts.
    pub level: f64,
    /// Trigger edge polarity.
    pub edge: Edge,
    /// Sweep mode.
    pub sweep: Sweep,
}

/// A full oscilloscope status sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeStatus {
    /// Whether acquisition is running.
    pub running: bool,
    /// Current trigger status.
    pub trigger_status: TriggerStatus,
    /// Current sample rate, samples/second.
    pub sample_rate: f64,
    /// Current acquisition memory depth, samples.
    pub memory_depth: u64,
    /// Per-channel configuration, keyed by channel name (e.g. `"CH1"`).
    pub channels: HashMap<String, ChannelConfig>,
    /// Current timebase configuration.
    pub timebase: TimebaseConfig,
    /// Current trigger configuration.
    pub trigger: TriggerConfig,
}

/// A raw waveform capture: `points` are already-converted
/// physical values (volts), not raw instrument bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformSample {
    /// Source channel name.
    pub channel: String,
    /// Physical-value samples (volts), in acquisition order.
    pub points: Vec<f64>,
    /// Seconds per sample.
    pub x_increment: f64,
    /// Timestamp of the first sample, relative to the trigger.
    pub x_origin: f64,
    /// Volts per raw count (used only during decode; `points` are pre-converted).
    pub y_increment: f64,
    /// Vertical offset origin used during decode.
    pub y_origin: f64,
    /// Raw-byte reference level used during decode.
    pub y_reference: f64,
}

/// A channel vertical-configuration field update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum ChannelParam {
    /// Enable/disable the channel.
    Enabled(bool),
    /// Volts/division.
    Scale(f64),
    /// Vertical offset, volts.
    Offset(f64),
    /// Input coupling.
    Coupling(Coupling),
    /// Probe attenuation factor.
    Probe(f64),
    /// Bandwidth-limit filter.
    BwLimit(bool),
}

/// A timebase field update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum TimebaseParam {
    /// Time/division.
    Scale(f64),
    /// Horizontal offset.
    Offset(f64),
    /// Timebase mode name.
    Mode(String),
}

/// A trigger field update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum TriggerParam {
    /// Trigger source channel.
    Source(String),
    /// Trigger mode name.
    Mode(String),
    /// Trigger input coupling name.
    Coupling(String),
    /// Trigger level, volts.
    Level(f64),
    /// Trigger edge polarity.
    Edge(Edge),
    /// Sweep mode.
    Sweep(Sweep),
}

/// Uniform oscilloscope contract.
///
/// `auto_setup` returns as soon as the command is acknowledged; the caller
/// (the session layer) is responsible for the ≥1.5s settling delay before
/// the next status poll.
#[async_trait]
pub trait ScopeDriver: Send {
    /// The identity discovered by [`ScopeDriver::probe`].
    fn info(&self) -> &InstrumentInfo;
    /// Declared capabilities for this scope.
    fn capabilities(&self) -> &ScopeCapabilities;

    /// Sends `*IDN?` and matches manufacturer/model.
    async fn probe(&mut self) -> Result<(), ProbeError>;
    /// Opens the underlying transport.
    async fn connect(&mut self) -> Result<(), DriverError>;
    /// Closes the underlying transport.
    async fn disconnect(&mut self) -> Result<(), DriverError>;

    /// Starts free-running acquisition.
    async fn run(&mut self) -> Result<(), DriverError>;
    /// Stops acquisition.
    async fn stop(&mut self) -> Result<(), DriverError>;
    /// Arms for exactly one qualifying trigger.
    async fn single(&mut self) -> Result<(), DriverError>;
    /// Requests the instrument's autoscale/autoset routine.
    async fn auto_setup(&mut self) -> Result<(), DriverError>;
    /// Forces an immediate trigger event regardless of the configured condition.
    async fn force_trigger(&mut self) -> Result<(), DriverError>;

    /// Takes one status sample (run state, trigger state, channel/timebase/trigger config).
    async fn get_status(&mut self) -> Result<ScopeStatus, DriverError>;

    /// Fetches a waveform capture for `channel`, optionally a sub-range `[start, start+count)`.
    async fn get_waveform(
        &mut self,
        channel: &str,
        start: Option<u64>,
        count: Option<u64>,
    ) -> Result<WaveformSample, DriverError>;

    /// Fetches a screenshot of the instrument's display (PNG bytes).
    async fn get_screenshot(&mut self) -> Result<Vec<u8>, DriverError>;

    /// Queries an on-instrument measurement directly (as opposed to the
    /// session layer's local computation from a waveform capture).
    async fn get_measurement(&mut self, channel: &str, measurement_type: &str) -> Result<Measurement, DriverError>;

    /// Applies one channel vertical-configuration field update.
    async fn set_channel_param(&mut self, channel: &str, param: ChannelParam) -> Result<(), DriverError>;
    /// Applies one timebase field update.
    async fn set_timebase_param(&mut self, param: TimebaseParam) -> Result<(), DriverError>;
    /// Applies one trigger field update.
    async fn set_trigger_param(&mut self, param: TriggerParam) -> Result<(), DriverError>;
}

/// A generic SCPI-dialect scope driver (matches the common Rigol/Keysight
/// `:WAV:*`/`:CHAN*:*`/`:TIM:*`/`:TRIG:*` command family).
pub struct GenericScpiScope<T: Transport> {
    transport: T,
    info: Option<InstrumentInfo>,
    capabilities: ScopeCapabilities,
}

impl<T: Transport> GenericScpiScope<T> {
    /// Builds a scope driver around `transport` with the given declared capabilities. Not yet probed.
    pub fn new(transport: T, capabilities: ScopeCapabilities) -> Self {
        Self {
            transport,
            info: None,
            capabilities,
        }
    }

    fn channel_index(channel: &str) -> Result<u32, DriverError> {
        channel
            .trim_start_matches("CH")
            .trim_start_matches("ch")
            .parse()
            .map_err(|_| DriverError::UnknownField(channel.to_string()))
    }
}

#[async_trait]
impl<T: Transport> ScopeDriver for GenericScpiScope<T> {
    fn info(&self) -> &InstrumentInfo {
        self.info.as_ref().expect("driver used before a successful probe")
    }

    fn capabilities(&self) -> &ScopeCapabilities {
        &self.capabilities
    }

    async fn probe(&mut self) -> Result<(), ProbeError> {
        let response = self.transport.query("*IDN?").await.map_err(|_| ProbeError::Timeout)?;
        let idn = scpi::Idn::parse(&response).map_err(|_| ProbeError::MalformedIdn)?;
        self.info = Some(InstrumentInfo {
            id: idn.canonical_id(),
            kind: super::InstrumentKind::Oscilloscope,
            manufacturer: idn.manufacturer,
            model: idn.model,
            serial: idn.serial,
        });
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        self.transport.open().await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.transport.close().await?;
        Ok(())
    }

    async fn run(&mut self) -> Result<(), DriverError> {
        self.transport.write(":RUN").await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DriverError> {
        self.transport.write(":STOP").await?;
        Ok(())
    }

    async fn single(&mut self) -> Result<(), DriverError> {
        self.transport.write(":SINGLE").await?;
        Ok(())
    }

    async fn auto_setup(&mut self) -> Result<(), DriverError> {
        self.transport.write(":AUToscale").await?;
        Ok(())
    }

    async fn force_trigger(&mut self) -> Result<(), DriverError> {
        self.transport.write(":TFORce").await?;
        Ok(())
    }

    async fn get_status(&mut self) -> Result<ScopeStatus, DriverError> {
        let running = self
            .transport
            .query(":TRIG:STAT?")
            .await
            .ok()
            .map(|s| !s.trim().eq_ignore_ascii_case("STOP"))
            .unwrap_or(false);

        let trigger_status = match self.transport.query(":TRIG:STAT?").await {
            Ok(s) => match s.trim().to_ascii_uppercase().as_str() {
                "STOP" => TriggerStatus::Stopped,
                "WAIT" => TriggerStatus::Wait,
                "AUTO" => TriggerStatus::Auto,
                "TD" | "TRIGGERED" => TriggerStatus::Triggered,
                _ => TriggerStatus::Stopped,
            },
            Err(_) => TriggerStatus::Stopped,
        };

        let sample_rate = self
            .transport
            .query(":ACQ:SRAT?")
            .await
            .ok()
            .and_then(|s| scpi::parse_number(&s).ok())
            .unwrap_or(0.0);
        let memory_depth = self
            .transport
            .query(":ACQ:MDEP?")
            .await
            .ok()
            .and_then(|s| scpi::parse_number(&s).ok())
            .unwrap_or(0.0) as u64;

        let mut channels = HashMap::new();
        for i in 1..=self.capabilities.channels {
            let name = format!("CH{i}");
            let enabled = self
                .transport
                .query(&format!(":CHAN{i}:DISP?"))
                .await
                .ok()
                .and_then(|s| scpi::parse_bool(&s).ok())
                .unwrap_or(false);
            let scale = self
                .transport
                .query(&format!(":CHAN{i}:SCAL?"))
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(1.0);
            let offset = self
                .transport
                .query(&format!(":CHAN{i}:OFFS?"))
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(0.0);
            let probe = self
                .transport
                .query(&format!(":CHAN{i}:PROB?"))
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(1.0);
            channels.insert(
                name,
                ChannelConfig {
                    enabled,
                    scale,
                    offset,
                    coupling: Coupling::Dc,
                    probe,
                    bw_limit: false,
                },
            );
        }

        let timebase = TimebaseConfig {
            scale: self
                .transport
                .query(":TIM:SCAL?")
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(0.0),
            offset: self
                .transport
                .query(":TIM:OFFS?")
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(0.0),
            mode: "main".to_string(),
        };

        let trigger = TriggerConfig {
            source: self
                .transport
                .query(":TRIG:EDGE:SOUR?")
                .await
                .unwrap_or_else(|_| "CH1".to_string()),
            mode: "edge".to_string(),
            coupling: self
                .transport
                .query(":TRIG:COUP?")
                .await
                .unwrap_or_else(|_| "DC".to_string()),
            level: self
                .transport
                .query(":TRIG:EDGE:LEV?")
                .await
                .ok()
                .and_then(|s| scpi::parse_number(&s).ok())
                .unwrap_or(0.0),
            edge: Edge::Rising,
            sweep: Sweep::Auto,
        };

        Ok(ScopeStatus {
            running,
            trigger_status,
            sample_rate,
            memory_depth,
            channels,
            timebase,
            trigger,
        })
    }

    async fn get_waveform(
        &mut self,
        channel: &str,
        start: Option<u64>,
        count: Option<u64>,
    ) -> Result<WaveformSample, DriverError> {
        self.transport.write(&format!(":WAV:SOUR {channel}")).await?;
        self.transport.write(":WAV:MODE NORM").await?;
        self.transport.write(":WAV:FORM BYTE").await?;
        if let Some(start) = start {
            self.transport.write(&format!(":WAV:STAR {}", start + 1)).await?;
        }
        if let (Some(start), Some(count)) = (start, count) {
            self.transport.write(&format!(":WAV:STOP {}", start + count)).await?;
        }

        let preamble = self.transport.query(":WAV:PRE?").await?;
        let fields = scpi::parse_csv(&preamble);
        let get = |i: usize| fields.get(i).and_then(|f| scpi::parse_number(f).ok()).unwrap_or(0.0);
        let x_increment = get(4);
        let x_origin = get(5);
        let y_increment = get(7);
        let y_origin = get(8);
        let y_reference = get(9);

        let raw = self.transport.query_binary(":WAV:DATA?").await?;
        let data = scpi::parse_definite_block(&raw)?;

        let points = data
            .iter()
            .map(|&b| (b as f64 - y_reference) * y_increment + y_origin)
            .collect();

        Ok(WaveformSample {
            channel: channel.to_string(),
            points,
            x_increment,
            x_origin,
            y_increment,
            y_origin,
            y_reference,
        })
    }

    async fn get_screenshot(&mut self) -> Result<Vec<u8>, DriverError> {
        let raw = self.transport.query_binary(":DISP:DATA? PNG").await?;
        Ok(scpi::parse_definite_block(&raw)?.to_vec())
    }

    async fn get_measurement(&mut self, channel: &str, measurement_type: &str) -> Result<Measurement, DriverError> {
        let cmd = format!(":MEAS:{measurement_type}? {channel}");
        let raw = self.transport.query(&cmd).await?;
        Ok(scpi::parse_measurement(&raw))
    }

    async fn set_channel_param(&mut self, channel: &str, param: ChannelParam) -> Result<(), DriverError> {
        let idx = Self::channel_index(channel)?;
        let cmd = match param {
            ChannelParam::Enabled(v) => format!(":CHAN{idx}:DISP {}", scpi::format_bool(v)),
            ChannelParam::Scale(v) => format!(":CHAN{idx}:SCAL {v}"),
            ChannelParam::Offset(v) => format!(":CHAN{idx}:OFFS {v}"),
            ChannelParam::Coupling(c) => format!(
                ":CHAN{idx}:COUP {}",
                match c {
                    Coupling::Ac => "AC",
                    Coupling::Dc => "DC",
                    Coupling::Gnd => "GND",
                }
            ),
            ChannelParam::Probe(v) => format!(":CHAN{idx}:PROB {v}"),
            ChannelParam::BwLimit(v) => format!(":CHAN{idx}:BWL {}", scpi::format_bool(v)),
        };
        self.transport.write(&cmd).await?;
        Ok(())
    }

    async fn set_timebase_param(&mut self, param: TimebaseParam) -> Result<(), DriverError> {
        let cmd = match param {
            TimebaseParam::Scale(v) => format!(":TIM:SCAL {v}"),
            TimebaseParam::Offset(v) => format!(":TIM:OFFS {v}"),
            TimebaseParam::Mode(m) => format!(":TIM:MODE {m}"),
        };
        self.transport.write(&cmd).await?;
        Ok(())
    }

    async fn set_trigger_param(&mut self, param: TriggerParam) -> Result<(), DriverError> {
        let cmd = match param {
            TriggerParam::Source(s) => format!(":TRIG:EDGE:SOUR {s}"),
            TriggerParam::Mode(m) => format!(":TRIG:MODE {m}"),
            TriggerParam::Coupling(c) => format!(":TRIG:COUP {c}"),
            TriggerParam::Level(v) => format!(":TRIG:EDGE:LEV {v}"),
            TriggerParam::Edge(e) => format!(
                ":TRIG:EDGE:SLOP {}",
                match e {
                    Edge::Rising => "POS",
                    Edge::Falling => "NEG",
                    Edge::Either => "EITH",
                }
            ),
            TriggerParam::Sweep(s) => format!(
                ":TRIG:SWE {}",
                match s {
                    Sweep::Auto => "AUTO",
                    Sweep::Normal => "NORM",
                    Sweep::Single => "SING",
                }
            ),
        };
        self.transport.write(&cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn caps() -> ScopeCapabilities {
        ScopeCapabilities {
            channels: 2,
            bandwidth: 100_000_000.0,
            max_sample_rate: 1_000_000_000.0,
            max_memory_depth: 12_000_000,
            supported_measurements: vec!["VPP".into(), "FREQ".into()],
            has_awg: false,
        }
    }

    #[tokio::test]
    async fn waveform_fetch_converts_raw_bytes_to_physical_values() {
        let mut t = MockTransport::new();
        // yReference=0, yIncrement=1, yOrigin=0 -> physical value == raw byte.
        t.set_response(
            ":WAV:PRE?",
            "0,0,10,0,1.0,0.0,0,1.0,0.0,0.0",
        );
        t.set_binary_response(":WAV:DATA?", b"#13abc".to_vec());
        let mut scope = GenericScpiScope::new(t, caps());
        let wave = scope.get_waveform("CH1", None, None).await.unwrap();
        assert_eq!(wave.points, vec![b'a' as f64, b'b' as f64, b'c' as f64]);
    }

    #[tokio::test]
    async fn screenshot_returns_decoded_definite_block_payload() {
        let mut t = MockTransport::new();
        t.set_binary_response(":DISP:DATA? PNG", b"#13PNG".to_vec());
        let mut scope = GenericScpiScope::new(t, caps());
        assert_eq!(scope.get_screenshot().await.unwrap(), b"PNG");
    }
}

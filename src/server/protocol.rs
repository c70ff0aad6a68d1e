//! Wire protocol: the tagged-union client request/server event
//! envelopes exchanged over the external socket, one JSON object per frame.

use crate::driver::scope::{ChannelParam, ScopeStatus, TimebaseParam, TriggerParam, WaveformSample};
use crate::driver::{Capabilities, InstrumentInfo};
use crate::history::HistorySnapshot;
use crate::sequence::{ActiveSequenceState, RunRequest, SequenceDefinition, SequenceEvent};
use crate::session::device::DeviceSnapshot;
use crate::session::scope::ScopeSnapshot;
use crate::session::{ConnectionStatus, DeviceSummary, MeasurementUpdate, SessionEvent};
use crate::trigger::{ActiveTriggerScriptState, TriggerEvent, TriggerScript};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request from a connected client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Replies with the current `deviceList`.
    GetDevices,
    /// Triggers a rescan, then replies with `deviceList`.
    Scan,
    /// Subscribes to a device's live updates.
    Subscribe {
        /// Target device.
        device_id: String,
    },
    /// Unsubscribes from a device's live updates.
    Unsubscribe {
        /// Target device.
        device_id: String,
    },
    /// Requests a reconnect attempt for a `disconnected` session.
    Reconnect {
        /// Target device.
        device_id: String,
    },
    /// Mode change.
    SetMode {
        /// Target device.
        device_id: String,
        /// Requested mode.
        mode: String,
    },
    /// Output enable/disable.
    SetOutput {
        /// Target device.
        device_id: String,
        /// Requested output state.
        enabled: bool,
    },
    /// Setpoint write; debounced unless `immediate`.
    SetValue {
        /// Target device.
        device_id: String,
        /// Setpoint name.
        name: String,
        /// Value to write.
        value: f64,
        /// Bypasses debouncing when true.
        #[serde(default)]
        immediate: bool,
    },
    /// Starts acquisition.
    ScopeRun {
        /// Target scope.
        device_id: String,
    },
    /// Stops acquisition.
    ScopeStop {
        /// Target scope.
        device_id: String,
    },
    /// Single-shot acquisition.
    ScopeSingle {
        /// Target scope.
        device_id: String,
    },
    /// Requests an auto-setup.
    ScopeAutoSetup {
        /// Target scope.
        device_id: String,
    },
    /// Forces an immediate trigger.
    ScopeForceTrigger {
        /// Target scope.
        device_id: String,
    },
    /// One-shot waveform fetch.
    ScopeGetWaveform {
        /// Target scope.
        device_id: String,
        /// Source channel.
        channel: String,
        /// First sample index.
        start: Option<u64>,
        /// Sample count.
        count: Option<u64>,
    },
    /// One-shot screenshot fetch.
    ScopeGetScreenshot {
        /// Target scope.
        device_id: String,
    },
    /// One-shot local measurement computation over the last acquired waveform.
    ScopeGetMeasurement {
        /// Target scope.
        device_id: String,
        /// Source channel.
        channel: String,
        /// Measurement type name (`VMAX`, `FREQ`, …; see [`crate::session::measure`]).
        #[serde(rename = "type")]
        measurement_type: String,
    },
    /// Channel vertical-configuration update.
    ScopeSetChannelParam {
        /// Target scope.
        device_id: String,
        /// Channel name.
        channel: String,
        /// Field update.
        param: ChannelParam,
    },
    /// Timebase update.
    ScopeSetTimebaseParam {
        /// Target scope.
        device_id: String,
        /// Field update.
        param: TimebaseParam,
    },
    /// Trigger configuration update.
    ScopeSetTriggerParam {
        /// Target scope.
        device_id: String,
        /// Field update.
        param: TriggerParam,
    },
    /// Enters streaming mode.
    ScopeStartStreaming {
        /// Target scope.
        device_id: String,
        /// Channels to stream.
        channels: Vec<String>,
        /// Requested sample interval.
        interval_ms: Option<u64>,
        /// Per-channel measurement types to compute, if not the default set.
        measurements: Option<HashMap<String, Vec<String>>>,
    },
    /// Exits streaming mode.
    ScopeStopStreaming {
        /// Target scope.
        device_id: String,
    },
    /// Lists the sequence library.
    SequenceLibraryList,
    /// Saves a new sequence definition.
    SequenceLibrarySave {
        /// The definition to save.
        definition: SequenceDefinition,
    },
    /// Updates an existing sequence definition.
    SequenceLibraryUpdate {
        /// The replacement definition (same id).
        definition: SequenceDefinition,
    },
    /// Deletes a sequence definition.
    SequenceLibraryDelete {
        /// Library id to delete.
        id: String,
    },
    /// Starts a sequence run, resolving `sequenceId` against the library.
    SequenceRun {
        /// Run parameters.
        request: RunRequest,
    },
    /// Aborts the active sequence run, if any.
    SequenceAbort,
    /// Lists the trigger script library.
    TriggerScriptLibraryList,
    /// Saves a new trigger script.
    TriggerScriptLibrarySave {
        /// The script to save.
        script: TriggerScript,
    },
    /// Updates an existing trigger script.
    TriggerScriptLibraryUpdate {
        /// The replacement script (same id).
        script: TriggerScript,
    },
    /// Deletes a trigger script.
    TriggerScriptLibraryDelete {
        /// Library id to delete.
        id: String,
    },
    /// Starts a trigger script run, resolving `scriptId` against the library.
    TriggerScriptRun {
        /// Library id of the script to run.
        script_id: String,
    },
    /// Stops the active trigger script run, if any.
    TriggerScriptStop,
    /// Pauses the active trigger script run.
    TriggerScriptPause,
    /// Resumes a paused trigger script run.
    TriggerScriptResume,
}

/// Serializable projection of [`DeviceSnapshot`] for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    /// Instrument identity.
    pub info: InstrumentInfo,
    /// Declared capabilities.
    pub capabilities: Capabilities,
    /// Connection state machine status.
    pub connection_status: ConnectionStatus,
    /// Current mode, if known.
    pub mode: Option<String>,
    /// Output-enabled state.
    pub output_enabled: bool,
    /// Setpoints by name.
    pub setpoints: HashMap<String, f64>,
    /// Last-sampled measurements by name; `None` for an invalid reading.
    pub measurements: HashMap<String, Option<f64>>,
    /// Sample history, included only in the initial `subscribed` snapshot;
    /// later measurement updates carry a single sample, not the whole buffer.
    pub history: HistorySnapshot,
}

impl DeviceState {
    /// Builds the wire projection of a device session's current snapshot plus
    /// its accumulated history. The two are fetched separately (history lives
    /// behind its own lock), so this can't be a single-argument `From`.
    pub fn from_snapshot(snap: DeviceSnapshot, history: HistorySnapshot) -> Self {
        Self {
            info: snap.info,
            capabilities: snap.capabilities,
            connection_status: snap.connection_status,
            mode: snap.mode,
            output_enabled: snap.output_enabled,
            setpoints: snap.setpoints,
            measurements: snap.measurements.into_iter().map(|(k, v)| (k, v.value())).collect(),
            history,
        }
    }
}

/// Serializable projection of [`ScopeSnapshot`] for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeState {
    /// Instrument identity.
    pub info: InstrumentInfo,
    /// Connection state machine status.
    pub connection_status: ConnectionStatus,
    /// Last-sampled status, if any poll has succeeded yet.
    pub status: Option<ScopeStatus>,
    /// Whether a stream (auto-started or explicit) is active.
    pub streaming: bool,
    /// Channels currently being streamed.
    pub streamed_channels: Vec<String>,
}

impl From<ScopeSnapshot> for ScopeState {
    fn from(snap: ScopeSnapshot) -> Self {
        Self {
            info: snap.info,
            connection_status: snap.connection_status,
            status: snap.status,
            streaming: snap.streaming,
            streamed_channels: snap.streamed_channels,
        }
    }
}

/// Either session kind's state, as carried by `subscribed`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionState {
    /// PSU/load session state.
    Device(DeviceState),
    /// Oscilloscope session state.
    Scope(ScopeState),
}

/// An event pushed to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Current device summaries.
    DeviceList {
        /// Registered sessions.
        devices: Vec<DeviceSummary>,
    },
    /// A subscription was accepted.
    Subscribed {
        /// Target device.
        device_id: String,
        /// Current state snapshot.
        state: SessionState,
    },
    /// An unsubscription was accepted.
    Unsubscribed {
        /// Target device.
        device_id: String,
    },
    /// A new measurement sample.
    Measurement {
        /// Source device.
        device_id: String,
        /// The sampled update.
        update: MeasurementUpdate,
    },
    /// A single scalar field changed.
    Field {
        /// Source device.
        device_id: String,
        /// Field name.
        field: String,
        /// New value, already JSON-shaped.
        value: serde_json::Value,
    },
    /// A request failed.
    Error {
        /// Device the request targeted, if any.
        device_id: Option<String>,
        /// Stable machine-readable error code (taxonomy name).
        code: String,
        /// Human-readable detail.
        message: String,
    },
    /// A waveform capture.
    ScopeWaveform {
        /// Source scope.
        device_id: String,
        /// Source channel.
        channel: String,
        /// The captured waveform.
        waveform: WaveformSample,
    },
    /// A locally computed measurement.
    ScopeMeasurement {
        /// Source scope.
        device_id: String,
        /// Source channel.
        channel: String,
        /// Measurement type name.
        measurement_type: String,
        /// Computed value; `None` if not computable from the current capture.
        value: Option<f64>,
    },
    /// A display screenshot.
    ScopeScreenshot {
        /// Source scope.
        device_id: String,
        /// Base64-encoded PNG.
        data: String,
    },
    /// The current sequence library contents.
    SequenceLibraryList {
        /// All saved sequence definitions.
        sequences: Vec<SequenceDefinition>,
    },
    /// A sequence run started.
    SequenceStarted {
        /// Snapshot of the new run's state.
        state: ActiveSequenceState,
    },
    /// One sequence step executed.
    SequenceProgress {
        /// Step index within the current cycle.
        current_step_index: usize,
        /// Current cycle number.
        current_cycle: u64,
        /// Value just commanded.
        commanded_value: f64,
    },
    /// A sequence run finished all scheduled cycles.
    SequenceCompleted {
        /// Library id of the definition that completed.
        sequence_id: String,
    },
    /// A sequence run was stopped by user request.
    SequenceAborted {
        /// Library id of the definition that was aborted.
        sequence_id: String,
    },
    /// A sequence run stopped because of a driver error.
    SequenceError {
        /// Library id of the definition that errored.
        sequence_id: String,
        /// Error message.
        message: String,
    },
    /// The current trigger script library contents.
    TriggerScriptLibraryList {
        /// All saved trigger scripts.
        scripts: Vec<TriggerScript>,
    },
    /// A trigger script run started.
    TriggerScriptStarted {
        /// Snapshot of the new run's state.
        state: ActiveTriggerScriptState,
    },
    /// A trigger script run stopped.
    TriggerScriptStopped {
        /// Library id of the script that stopped.
        script_id: String,
    },
    /// A trigger action failed, or a fatal condition terminated the run.
    TriggerScriptError {
        /// Library id of the running script.
        script_id: String,
        /// Error message.
        message: String,
    },
    /// A trigger fired.
    TriggerScriptFired {
        /// Library id of the running script.
        script_id: String,
        /// The trigger that fired.
        trigger_id: String,
    },
}

impl ServerEvent {
    /// Builds an `error` event from a stable taxonomy code and message.
    pub fn error(device_id: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error { device_id, code: code.into(), message: message.into() }
    }

    /// Wraps a device/scope session event with the `deviceId` it was raised
    /// for; `None` if the event carries no wire-visible counterpart
    /// (reserved for future session-level events).
    pub fn from_session_event(device_id: &str, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Measurement { update } => {
                ServerEvent::Measurement { device_id: device_id.to_string(), update }
            }
            SessionEvent::Field { field, value } => {
                ServerEvent::Field { device_id: device_id.to_string(), field, value }
            }
        }
    }

    /// Converts a broadcast [`SequenceEvent`] into its wire counterpart.
    pub fn from_sequence_event(event: SequenceEvent) -> Self {
        match event {
            SequenceEvent::Started { state } => ServerEvent::SequenceStarted { state },
            SequenceEvent::Progress { current_step_index, current_cycle, commanded_value } => {
                ServerEvent::SequenceProgress { current_step_index, current_cycle, commanded_value }
            }
            SequenceEvent::Completed { sequence_id } => ServerEvent::SequenceCompleted { sequence_id },
            SequenceEvent::Aborted { sequence_id } => ServerEvent::SequenceAborted { sequence_id },
            SequenceEvent::Error { sequence_id, message } => ServerEvent::SequenceError { sequence_id, message },
        }
    }

    /// Converts a broadcast [`TriggerEvent`] into its wire counterpart.
    pub fn from_trigger_event(event: TriggerEvent) -> Self {
        match event {
            TriggerEvent::Started { state } => ServerEvent::TriggerScriptStarted { state },
            TriggerEvent::Stopped { script_id } => ServerEvent::TriggerScriptStopped { script_id },
            TriggerEvent::Error { script_id, message } => ServerEvent::TriggerScriptError { script_id, message },
            TriggerEvent::Fired { script_id, trigger_id } => ServerEvent::TriggerScriptFired { script_id, trigger_id },
        }
    }
}

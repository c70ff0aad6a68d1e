//! Trigger engine: a reactive rule evaluator whose conditions
//! observe live measurements (or elapsed time since a script started) and
//! whose actions drive the session layer and the sequence engine.
//!
//! Structured as a single actor task, in the same command-enum/actor shape
//! as [`crate::sequence`]: at most one trigger script runs at a time. Value
//! conditions are re-evaluated on every `field`/`measurement` event from the
//! referenced device, delivered by subscribing through the [`SessionManager`]
//! the same way an external client would and fanning every device's stream
//! into one merged channel this actor selects on, alongside a per-trigger
//! timer for time conditions.

use crate::session::manager::{ManagerError, SessionManager};
use crate::session::{ClientId, SessionEvent};
use crate::sequence::{RunRequest, SequenceDefinition, SequenceHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

/// A comparison used by a value condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `==`
    #[serde(rename = "==")]
    Eq,
    /// `!=`
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    fn check(self, sample: f64, target: f64) -> bool {
        match self {
            Operator::Gt => sample > target,
            Operator::Lt => sample < target,
            Operator::Ge => sample >= target,
            Operator::Le => sample <= target,
            Operator::Eq => sample == target,
            Operator::Ne => sample != target,
        }
    }
}

/// A trigger's firing condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    /// Fires once, `seconds` after the script started.
    Time {
        /// Elapsed seconds since script start.
        seconds: f64,
    },
    /// Re-evaluated on every measurement/field update naming `parameter` on `deviceId`.
    Value {
        /// Target device.
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Measurement or field name observed on that device.
        parameter: String,
        /// Comparison applied to the observed sample.
        operator: Operator,
        /// Right-hand side of the comparison.
        value: f64,
    },
}

/// How many times a trigger (or, for `startSequence`, the spawned run) may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// At most one firing per script run.
    Once,
    /// Fires on every rising false→true transition, subject to debounce.
    Repeat,
}

/// An action dispatched when a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    /// Immediate setpoint write.
    SetValue {
        /// Target device.
        device_id: String,
        /// Setpoint name.
        field: String,
        /// Value to write.
        value: f64,
    },
    /// Output enable/disable.
    SetOutput {
        /// Target device.
        device_id: String,
        /// Requested output state.
        enabled: bool,
    },
    /// Mode change.
    SetMode {
        /// Target device.
        device_id: String,
        /// Requested mode.
        mode: String,
    },
    /// Starts a sequence run, implicitly aborting any currently running one.
    StartSequence {
        /// Library id of the sequence definition to play.
        sequence_id: String,
        /// Target device.
        device_id: String,
        /// Target setpoint name on that device.
        parameter: String,
        /// Whether the spawned run executes once or indefinitely.
        repeat_mode: RepeatMode,
    },
    /// Stops the active sequence run, if any.
    StopSequence,
    /// Pauses the active sequence run, if any.
    PauseSequence,
}

/// One rule within a trigger script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Script-unique id.
    pub id: String,
    /// Firing condition.
    pub condition: Condition,
    /// Action to dispatch on firing.
    pub action: Action,
    /// Once-vs-repeat firing semantics.
    pub repeat_mode: RepeatMode,
    /// Minimum milliseconds between consecutive firings of this trigger.
    pub debounce_ms: u64,
}

/// A saved trigger script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerScript {
    /// Library-unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Triggers, evaluated/fired in this definition order.
    pub triggers: Vec<Trigger>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last-mutation time.
    pub updated_at: DateTime<Utc>,
}

impl TriggerScript {
    /// Validates a trigger script's invariants: `debounceMs ≥ 0` holds
    /// unconditionally for a `u64`; a time condition's `seconds` must still
    /// be checked since it's a signed float on the wire.
    pub fn validate(&self) -> Result<(), TriggerError> {
        for trigger in &self.triggers {
            if let Condition::Time { seconds } = trigger.condition {
                if seconds < 0.0 {
                    return Err(TriggerError::ScriptValidationFailed {
                        field: "seconds".to_string(),
                        reason: "must be >= 0".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Engine-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    /// The library is already at its configured maximum size.
    #[error("trigger script library is full")]
    LibraryFull,
    /// A save/update request violated a validation invariant.
    #[error("trigger script validation failed: {field}: {reason}")]
    ScriptValidationFailed {
        /// Field that failed validation.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
    /// `triggerScriptStop`/`Pause`/`Resume` or a status query found no active run.
    #[error("no active trigger script")]
    NoActiveScript,
    /// Subscribing to a referenced device session failed.
    #[error("session error: {0}")]
    Session(String),
    /// A request referenced a library id that doesn't exist.
    #[error("unknown trigger script id: {0}")]
    UnknownScript(String),
}

/// Execution state of the (at most one) active script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerExecutionState {
    /// No run active.
    Idle,
    /// Conditions are being evaluated.
    Running,
    /// Evaluation frozen; resumable.
    Paused,
}

/// Per-trigger runtime bookkeeping exposed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRuntimeState {
    /// The trigger this entry tracks.
    pub trigger_id: String,
    /// Times fired so far this run; bounded to 1 when `repeatMode == once`.
    pub fired_count: u64,
    /// When this trigger last fired, if ever.
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Live state of the active trigger-script run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTriggerScriptState {
    /// Library id of the running script.
    pub script_id: String,
    /// Current run state.
    pub execution_state: TriggerExecutionState,
    /// When this run started.
    pub started_at: Option<DateTime<Utc>>,
    /// Per-trigger firing bookkeeping, in script-definition order.
    pub trigger_states: Vec<TriggerRuntimeState>,
}

/// Events the engine broadcasts to all connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TriggerEvent {
    /// A script run started.
    #[serde(rename = "triggerScriptStarted")]
    Started {
        /// Snapshot of the new run's state.
        state: ActiveTriggerScriptState,
    },
    /// A script run stopped (by request or superseded by a new run).
    #[serde(rename = "triggerScriptStopped")]
    Stopped {
        /// Library id of the script that stopped.
        script_id: String,
    },
    /// A trigger action failed, or a fatal condition terminated the run.
    #[serde(rename = "triggerScriptError")]
    Error {
        /// Library id of the running script.
        script_id: String,
        /// Error message.
        message: String,
    },
    /// A trigger fired.
    #[serde(rename = "triggerScriptFired")]
    Fired {
        /// Library id of the running script.
        script_id: String,
        /// The trigger that fired.
        trigger_id: String,
    },
}

/// Resolves a sequence library id to its definition for the `startSequence`
/// action, without this module depending on the persistence layer directly.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    /// Looks up a saved sequence definition by id.
    async fn get(&self, id: &str) -> Option<SequenceDefinition>;
}

enum Command {
    Run {
        script: TriggerScript,
        reply: oneshot::Sender<Result<(), TriggerError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), TriggerError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), TriggerError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), TriggerError>>,
    },
    GetState {
        reply: oneshot::Sender<Option<ActiveTriggerScriptState>>,
    },
}

/// Cheap-to-clone handle to the running trigger engine actor.
#[derive(Clone)]
pub struct TriggerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TriggerEvent>,
}

impl TriggerHandle {
    /// Subscribes to the global trigger-event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    /// Starts a script run, stopping any currently active run first.
    pub async fn run(&self, script: TriggerScript) -> Result<(), TriggerError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Run { script, reply: tx }).await;
        rx.await.map_err(|_| TriggerError::Session("engine task gone".to_string()))?
    }

    /// Stops the active run, if any.
    pub async fn stop(&self) -> Result<(), TriggerError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Stop { reply: tx }).await;
        rx.await.map_err(|_| TriggerError::Session("engine task gone".to_string()))?
    }

    /// Pauses the active run, if any.
    pub async fn pause(&self) -> Result<(), TriggerError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Pause { reply: tx }).await;
        rx.await.map_err(|_| TriggerError::Session("engine task gone".to_string()))?
    }

    /// Resumes a paused run.
    pub async fn resume(&self) -> Result<(), TriggerError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Resume { reply: tx }).await;
        rx.await.map_err(|_| TriggerError::Session("engine task gone".to_string()))?
    }

    /// Current run state, if any run is active.
    pub async fn state(&self) -> Option<ActiveTriggerScriptState> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetState { reply: tx }).await;
        rx.await.ok().flatten()
    }
}

#[derive(Debug, Default, Clone)]
struct TriggerRuntime {
    last_satisfied: bool,
    last_fired_instant: Option<Instant>,
    fired_count: u64,
    last_fired_at: Option<DateTime<Utc>>,
}

/// Applies the firing rules: edge-triggered (false→true),
/// `repeatMode == once` capped at one firing, `debounceMs` enforced against
/// the previous firing. Used uniformly by both condition domains: a time
/// condition calls this with `satisfied = true` exactly once, which is
/// itself a rising edge from the runtime's initial `last_satisfied = false`.
fn should_fire(runtime: &mut TriggerRuntime, repeat_mode: RepeatMode, debounce_ms: u64, satisfied: bool, now: Instant) -> bool {
    let rising = satisfied && !runtime.last_satisfied;
    runtime.last_satisfied = satisfied;
    if !rising {
        return false;
    }
    if repeat_mode == RepeatMode::Once && runtime.fired_count >= 1 {
        return false;
    }
    if let Some(last) = runtime.last_fired_instant {
        if now.duration_since(last) < Duration::from_millis(debounce_ms) {
            return false;
        }
    }
    runtime.fired_count += 1;
    runtime.last_fired_instant = Some(now);
    runtime.last_fired_at = Some(Utc::now());
    true
}

enum DispatchError {
    Fatal(String),
    NonFatal(String),
}

fn classify_manager_error(device_id: &str, e: ManagerError) -> DispatchError {
    match e {
        ManagerError::UnknownDevice(_) => DispatchError::Fatal(format!("unknown device: {device_id}")),
        other => DispatchError::NonFatal(other.to_string()),
    }
}

async fn dispatch_action(
    action: &Action,
    sessions: &SessionManager,
    sequences: &SequenceHandle,
    sequence_source: &Arc<dyn SequenceSource>,
) -> Result<(), DispatchError> {
    match action {
        Action::SetValue { device_id, field, value } => sessions
            .set_value(device_id, field, *value, true)
            .await
            .map_err(|e| classify_manager_error(device_id, e)),
        Action::SetOutput { device_id, enabled } => sessions
            .set_output(device_id, *enabled)
            .await
            .map_err(|e| classify_manager_error(device_id, e)),
        Action::SetMode { device_id, mode } => sessions
            .set_mode(device_id, mode)
            .await
            .map_err(|e| classify_manager_error(device_id, e)),
        Action::StartSequence { sequence_id, device_id, parameter, repeat_mode } => {
            let Some(definition) = sequence_source.get(sequence_id).await else {
                return Err(DispatchError::NonFatal(format!("unknown sequence id: {sequence_id}")));
            };
            let total_cycles = match repeat_mode {
                RepeatMode::Once => Some(1),
                RepeatMode::Repeat => None,
            };
            let request = RunRequest {
                sequence_id: sequence_id.clone(),
                device_id: device_id.clone(),
                parameter: parameter.clone(),
                total_cycles,
            };
            sequences.run(request, definition).await.map_err(|e| DispatchError::NonFatal(e.to_string()))
        }
        Action::StopSequence => sequences.abort().await.map_err(|e| DispatchError::NonFatal(e.to_string())),
        Action::PauseSequence => sequences.pause().await.map_err(|e| DispatchError::NonFatal(e.to_string())),
    }
}

struct RunState {
    script: TriggerScript,
    state: ActiveTriggerScriptState,
    runtime: HashMap<String, TriggerRuntime>,
    /// Remaining fire instants for not-yet-fired time conditions.
    time_fires: HashMap<String, Instant>,
    paused_at: Option<Instant>,
    /// Forwarder tasks feeding the merged device-event channel, one per
    /// distinct device referenced by a value condition, plus the device id
    /// each was subscribed under (needed to unsubscribe on stop).
    forwarders: Vec<(String, tokio::task::JoinHandle<()>)>,
    client_id: ClientId,
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

async fn cleanup(run: RunState, sessions: &SessionManager) {
    for (device_id, handle) in run.forwarders {
        handle.abort();
        sessions.unsubscribe(&device_id, run.client_id).await;
    }
}

async fn start_run(
    script: TriggerScript,
    sessions: &SessionManager,
) -> Result<(RunState, mpsc::Receiver<(String, SessionEvent)>), TriggerError> {
    let device_ids: HashSet<String> = script
        .triggers
        .iter()
        .filter_map(|t| match &t.condition {
            Condition::Value { device_id, .. } => Some(device_id.clone()),
            Condition::Time { .. } => None,
        })
        .collect();

    let (merge_tx, merge_rx) = mpsc::channel(256);
    let client_id = next_client_id();
    let mut forwarders = Vec::with_capacity(device_ids.len());
    for device_id in device_ids {
        let (dev_tx, mut dev_rx) = mpsc::channel(64);
        sessions
            .subscribe(&device_id, client_id, dev_tx)
            .await
            .map_err(|e| TriggerError::Session(e.to_string()))?;
        let merge_tx = merge_tx.clone();
        let forwarded_id = device_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = dev_rx.recv().await {
                if merge_tx.send((forwarded_id.clone(), event)).await.is_err() {
                    break;
                }
            }
        });
        forwarders.push((device_id, handle));
    }

    let now = Instant::now();
    let time_fires: HashMap<String, Instant> = script
        .triggers
        .iter()
        .filter_map(|t| match t.condition {
            Condition::Time { seconds } => Some((t.id.clone(), now + Duration::from_secs_f64(seconds.max(0.0)))),
            Condition::Value { .. } => None,
        })
        .collect();

    let runtime: HashMap<String, TriggerRuntime> =
        script.triggers.iter().map(|t| (t.id.clone(), TriggerRuntime::default())).collect();

    let state = ActiveTriggerScriptState {
        script_id: script.id.clone(),
        execution_state: TriggerExecutionState::Running,
        started_at: Some(Utc::now()),
        trigger_states: script
            .triggers
            .iter()
            .map(|t| TriggerRuntimeState { trigger_id: t.id.clone(), fired_count: 0, last_fired_at: None })
            .collect(),
    };

    Ok((RunState { script, state, runtime, time_fires, paused_at: None, forwarders, client_id }, merge_rx))
}

/// Records a firing in the public snapshot and dispatches its action.
/// Returns `true` if the failure was fatal and the run must terminate.
async fn fire_trigger(
    run: &mut RunState,
    trigger: &Trigger,
    sessions: &SessionManager,
    sequences: &SequenceHandle,
    sequence_source: &Arc<dyn SequenceSource>,
    events: &broadcast::Sender<TriggerEvent>,
) -> bool {
    if let Some(runtime) = run.runtime.get(&trigger.id) {
        if let Some(entry) = run.state.trigger_states.iter_mut().find(|s| s.trigger_id == trigger.id) {
            entry.fired_count = runtime.fired_count;
            entry.last_fired_at = runtime.last_fired_at;
        }
    }
    let _ = events.send(TriggerEvent::Fired { script_id: run.script.id.clone(), trigger_id: trigger.id.clone() });
    info!(script = %run.script.id, trigger = %trigger.id, "trigger fired");

    match dispatch_action(&trigger.action, sessions, sequences, sequence_source).await {
        Ok(()) => false,
        Err(DispatchError::NonFatal(message)) => {
            warn!(trigger = %trigger.id, %message, "trigger action failed");
            let _ = events.send(TriggerEvent::Error { script_id: run.script.id.clone(), message });
            false
        }
        Err(DispatchError::Fatal(message)) => {
            warn!(trigger = %trigger.id, %message, "trigger action failed fatally, terminating script");
            let _ = events.send(TriggerEvent::Error { script_id: run.script.id.clone(), message });
            true
        }
    }
}

async fn handle_device_event(
    run: &mut Option<RunState>,
    merge_rx: &mut Option<mpsc::Receiver<(String, SessionEvent)>>,
    device_id: String,
    event: SessionEvent,
    sessions: &SessionManager,
    sequences: &SequenceHandle,
    sequence_source: &Arc<dyn SequenceSource>,
    events: &broadcast::Sender<TriggerEvent>,
) {
    let Some(r) = run.as_mut() else { return };
    let now = Instant::now();
    let mut to_fire = Vec::new();

    for trigger in &r.script.triggers {
        let Condition::Value { device_id: cond_device, parameter, operator, value: target } = &trigger.condition else {
            continue;
        };
        if cond_device != &device_id {
            continue;
        }
        let sample = match &event {
            SessionEvent::Measurement { update } => update.measurements.get(parameter).copied().flatten(),
            SessionEvent::Field { field, value } if field == parameter => value.as_f64(),
            _ => None,
        };
        let Some(sample) = sample else { continue };
        let satisfied = operator.check(sample, *target);
        let runtime = r.runtime.get_mut(&trigger.id).expect("runtime entry exists for every trigger");
        if should_fire(runtime, trigger.repeat_mode, trigger.debounce_ms, satisfied, now) {
            to_fire.push(trigger.clone());
        }
    }

    for trigger in &to_fire {
        let Some(r) = run.as_mut() else { return };
        if fire_trigger(r, trigger, sessions, sequences, sequence_source, events).await {
            let finished = run.take().expect("run present");
            cleanup(finished, sessions).await;
            *merge_rx = None;
            return;
        }
    }
}

async fn handle_time_fire(
    run: &mut Option<RunState>,
    merge_rx: &mut Option<mpsc::Receiver<(String, SessionEvent)>>,
    sessions: &SessionManager,
    sequences: &SequenceHandle,
    sequence_source: &Arc<dyn SequenceSource>,
    events: &broadcast::Sender<TriggerEvent>,
) {
    let Some(r) = run.as_mut() else { return };
    let now = Instant::now();
    let due: Vec<String> = r.time_fires.iter().filter(|&(_, &t)| t <= now).map(|(id, _)| id.clone()).collect();
    for id in &due {
        r.time_fires.remove(id);
    }
    let triggers: Vec<Trigger> = r.script.triggers.iter().filter(|t| due.contains(&t.id)).cloned().collect();

    for trigger in &triggers {
        let Some(r) = run.as_mut() else { return };
        let runtime = r.runtime.get_mut(&trigger.id).expect("runtime entry exists for every trigger");
        if !should_fire(runtime, trigger.repeat_mode, trigger.debounce_ms, true, now) {
            continue;
        }
        if fire_trigger(r, trigger, sessions, sequences, sequence_source, events).await {
            let finished = run.take().expect("run present");
            cleanup(finished, sessions).await;
            *merge_rx = None;
            return;
        }
    }
}

async fn handle_command(
    cmd: Command,
    run: &mut Option<RunState>,
    merge_rx: &mut Option<mpsc::Receiver<(String, SessionEvent)>>,
    sessions: &SessionManager,
    events: &broadcast::Sender<TriggerEvent>,
) {
    match cmd {
        Command::Run { script, reply } => {
            if let Err(e) = script.validate() {
                let _ = reply.send(Err(e));
                return;
            }
            if let Some(prev) = run.take() {
                let prev_id = prev.script.id.clone();
                cleanup(prev, sessions).await;
                *merge_rx = None;
                let _ = events.send(TriggerEvent::Stopped { script_id: prev_id });
            }
            match start_run(script, sessions).await {
                Ok((new_run, rx)) => {
                    *merge_rx = Some(rx);
                    let _ = events.send(TriggerEvent::Started { state: new_run.state.clone() });
                    *run = Some(new_run);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Command::Stop { reply } => match run.take() {
            Some(r) => {
                let id = r.script.id.clone();
                cleanup(r, sessions).await;
                *merge_rx = None;
                let _ = events.send(TriggerEvent::Stopped { script_id: id });
                let _ = reply.send(Ok(()));
            }
            None => {
                let _ = reply.send(Err(TriggerError::NoActiveScript));
            }
        },
        Command::Pause { reply } => match run.as_mut() {
            Some(r) if r.state.execution_state == TriggerExecutionState::Running => {
                r.paused_at = Some(Instant::now());
                r.state.execution_state = TriggerExecutionState::Paused;
                let _ = reply.send(Ok(()));
            }
            _ => {
                let _ = reply.send(Err(TriggerError::NoActiveScript));
            }
        },
        Command::Resume { reply } => match run.as_mut() {
            Some(r) => {
                if let Some(paused_at) = r.paused_at.take() {
                    let shift = paused_at.elapsed();
                    for fire in r.time_fires.values_mut() {
                        *fire += shift;
                    }
                    for rt in r.runtime.values_mut() {
                        if let Some(last) = rt.last_fired_instant.as_mut() {
                            *last += shift;
                        }
                    }
                    r.state.execution_state = TriggerExecutionState::Running;
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(TriggerError::NoActiveScript));
                }
            }
            None => {
                let _ = reply.send(Err(TriggerError::NoActiveScript));
            }
        },
        Command::GetState { reply } => {
            let _ = reply.send(run.as_ref().map(|r| r.state.clone()));
        }
    }
}

/// Spawns the trigger engine actor and returns a handle to it.
pub fn spawn(sessions: SessionManager, sequences: SequenceHandle, sequence_source: Arc<dyn SequenceSource>) -> TriggerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, _) = broadcast::channel(256);
    let handle = TriggerHandle { commands: cmd_tx, events: event_tx.clone() };
    tokio::spawn(run_engine(sessions, sequences, sequence_source, cmd_rx, event_tx));
    handle
}

async fn run_engine(
    sessions: SessionManager,
    sequences: SequenceHandle,
    sequence_source: Arc<dyn SequenceSource>,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TriggerEvent>,
) {
    let mut run: Option<RunState> = None;
    let mut merge_rx: Option<mpsc::Receiver<(String, SessionEvent)>> = None;

    loop {
        let next_time_fire = run
            .as_ref()
            .filter(|r| r.paused_at.is_none())
            .and_then(|r| r.time_fires.values().min().copied());
        let device_events_active = run.as_ref().is_some_and(|r| r.paused_at.is_none()) && merge_rx.is_some();

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(cmd, &mut run, &mut merge_rx, &sessions, &events).await;
            }
            res = async {
                match merge_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => futures::future::pending().await,
                }
            }, if device_events_active => {
                if let Some((device_id, event)) = res {
                    handle_device_event(&mut run, &mut merge_rx, device_id, event, &sessions, &sequences, &sequence_source, &events).await;
                }
            }
            _ = async { tokio::time::sleep_until(next_time_fire.unwrap()).await }, if next_time_fire.is_some() => {
                handle_time_fire(&mut run, &mut merge_rx, &sessions, &sequences, &sequence_source, &events).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::profile::RIGOL_DL3021;
    use crate::driver::scpi_generic::ScpiGenericDriver;
    use crate::sequence::{StandardType, Unit, Waveform};
    use crate::transport::mock::MockTransport;
    use std::sync::Mutex;
    use tokio::time::Duration as TokioDuration;

    #[test]
    fn operator_check_covers_all_comparisons() {
        assert!(Operator::Gt.check(2.0, 1.0));
        assert!(Operator::Lt.check(1.0, 2.0));
        assert!(Operator::Ge.check(1.0, 1.0));
        assert!(Operator::Le.check(1.0, 1.0));
        assert!(Operator::Eq.check(1.0, 1.0));
        assert!(Operator::Ne.check(1.0, 2.0));
    }

    #[test]
    fn should_fire_requires_rising_edge() {
        let mut rt = TriggerRuntime::default();
        let now = Instant::now();
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 0, false, now));
        assert!(should_fire(&mut rt, RepeatMode::Repeat, 0, true, now));
        // Still true (level, not edge): no re-fire until it drops and rises again.
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 0, true, now));
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 0, false, now));
        assert!(should_fire(&mut rt, RepeatMode::Repeat, 0, true, now));
    }

    #[test]
    fn should_fire_once_caps_at_a_single_firing() {
        let mut rt = TriggerRuntime::default();
        let now = Instant::now();
        assert!(should_fire(&mut rt, RepeatMode::Once, 0, true, now));
        assert!(!should_fire(&mut rt, RepeatMode::Once, 0, false, now));
        assert!(!should_fire(&mut rt, RepeatMode::Once, 0, true, now));
    }

    #[test]
    fn should_fire_honors_debounce_window() {
        let mut rt = TriggerRuntime::default();
        let now = Instant::now();
        assert!(should_fire(&mut rt, RepeatMode::Repeat, 500, true, now));
        // Drop and rise again before the debounce window elapses: suppressed.
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 500, false, now));
        let soon = now + Duration::from_millis(100);
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 500, true, soon));
        let later = now + Duration::from_millis(600);
        assert!(!should_fire(&mut rt, RepeatMode::Repeat, 500, false, later));
        assert!(should_fire(&mut rt, RepeatMode::Repeat, 500, true, later));
    }

    #[test]
    fn validate_rejects_negative_time_condition() {
        let script = TriggerScript {
            id: "s1".into(),
            name: "t".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Time { seconds: -1.0 },
                action: Action::StopSequence,
                repeat_mode: RepeatMode::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(script.validate(), Err(TriggerError::ScriptValidationFailed { .. })));
    }

    struct FakeSequenceSource(Mutex<HashMap<String, SequenceDefinition>>);

    #[async_trait]
    impl SequenceSource for FakeSequenceSource {
        async fn get(&self, id: &str) -> Option<SequenceDefinition> {
            self.0.lock().unwrap().get(id).cloned()
        }
    }

    fn empty_sequence_source() -> Arc<dyn SequenceSource> {
        Arc::new(FakeSequenceSource(Mutex::new(HashMap::new())))
    }

    fn sequence_def(id: &str) -> SequenceDefinition {
        SequenceDefinition {
            id: id.to_string(),
            name: "seq".into(),
            unit: Unit::V,
            waveform: Waveform::Standard {
                shape: StandardType::Sine,
                min: 0.0,
                max: 1.0,
                points_per_cycle: 4,
                interval_ms: 10,
            },
            pre_value: None,
            post_value: None,
            scale: None,
            offset: None,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn psu_device() -> (SessionManager, String) {
        let manager = SessionManager::new();
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DL3021,DL3A123456789,00.01.02");
        t.set_response(":SOUR:FUNC?", "CV");
        t.set_response(":SOUR:INP:STAT?", "ON");
        t.set_response(":MEAS:VOLT?;:MEAS:CURR?", "12.000,1.500");
        t.set_response(":SOUR:VOLT:LEV?", "12.000");
        t.set_response(":SOUR:CURR:LEV?", "1.500");
        t.set_response(":SOUR:RES:LEV?", "1.000");
        t.set_response(":SOUR:POW:LEV?", "18.000");
        let mut driver = ScpiGenericDriver::new(t, &RIGOL_DL3021);
        driver.probe().await.unwrap();
        let id = manager.register_device(Box::new(driver), crate::config::SessionSettings::default()).await;
        (manager, id)
    }

    #[tokio::test]
    async fn time_trigger_fires_once_after_elapsed_seconds() {
        tokio::time::pause();
        let (sessions, device_id) = psu_device().await;
        let sequences = crate::sequence::spawn(sessions.clone());
        let engine = spawn(sessions, sequences, empty_sequence_source());
        let mut events = engine.subscribe();

        let script = TriggerScript {
            id: "script-1".into(),
            name: "time test".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Time { seconds: 1.0 },
                action: Action::SetOutput { device_id: device_id.clone(), enabled: true },
                repeat_mode: RepeatMode::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        engine.run(script).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Started { .. }));

        tokio::time::advance(TokioDuration::from_millis(1100)).await;

        let fired = events.recv().await.unwrap();
        assert!(matches!(fired, TriggerEvent::Fired { .. }));
        let state = engine.state().await.unwrap();
        assert_eq!(state.trigger_states[0].fired_count, 1);
    }

    #[tokio::test]
    async fn unknown_device_action_is_fatal_and_stops_the_script() {
        let sessions = SessionManager::new();
        let sequences = crate::sequence::spawn(sessions.clone());
        let engine = spawn(sessions, sequences, empty_sequence_source());
        let mut events = engine.subscribe();

        let script = TriggerScript {
            id: "script-2".into(),
            name: "fatal test".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Time { seconds: 0.0 },
                action: Action::SetOutput { device_id: "nope".into(), enabled: true },
                repeat_mode: RepeatMode::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        engine.run(script).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Fired { .. }));
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Error { .. }));
        assert!(engine.state().await.is_none());
    }

    #[tokio::test]
    async fn value_trigger_fires_on_rising_field_update() {
        let (sessions, device_id) = psu_device().await;
        let sequences = crate::sequence::spawn(sessions.clone());
        let engine = spawn(sessions.clone(), sequences, empty_sequence_source());
        let mut events = engine.subscribe();

        let script = TriggerScript {
            id: "script-3".into(),
            name: "value test".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Value {
                    device_id: device_id.clone(),
                    parameter: "current".into(),
                    operator: Operator::Ge,
                    value: 5.0,
                },
                action: Action::SetOutput { device_id: device_id.clone(), enabled: false },
                repeat_mode: RepeatMode::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        engine.run(script).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Started { .. }));

        let device = sessions.device(&device_id).await.unwrap();
        device.set_value("current", 5.0, true).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Fired { .. }));
        let state = engine.state().await.unwrap();
        assert_eq!(state.trigger_states[0].fired_count, 1);
    }

    #[tokio::test]
    async fn start_sequence_action_resolves_via_sequence_source() {
        let (sessions, device_id) = psu_device().await;
        let sequences = crate::sequence::spawn(sessions.clone());
        let mut source = HashMap::new();
        source.insert("seq-1".to_string(), sequence_def("seq-1"));
        let sequence_source: Arc<dyn SequenceSource> = Arc::new(FakeSequenceSource(Mutex::new(source)));
        let engine = spawn(sessions, sequences.clone(), sequence_source);
        let mut events = engine.subscribe();

        let script = TriggerScript {
            id: "script-4".into(),
            name: "start sequence test".into(),
            triggers: vec![Trigger {
                id: "t1".into(),
                condition: Condition::Time { seconds: 0.0 },
                action: Action::StartSequence {
                    sequence_id: "seq-1".into(),
                    device_id: device_id.clone(),
                    parameter: "current".into(),
                    repeat_mode: RepeatMode::Repeat,
                },
                repeat_mode: RepeatMode::Once,
                debounce_ms: 0,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        engine.run(script).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Started { .. }));
        assert!(matches!(events.recv().await.unwrap(), TriggerEvent::Fired { .. }));

        assert!(sequences.state().await.is_some());
    }
}

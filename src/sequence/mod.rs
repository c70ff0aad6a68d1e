//! Sequence engine: drift-free, absolute-time-scheduled
//! waveform playback that commands setpoints on a device through the
//! session layer.
//!
//! Modeled as a single actor task: at most one
//! sequence runs at a time, so one
//! task with one command channel is sufficient, in the same
//! command-enum/actor shape as [`crate::session::device`].

mod waveform;

use crate::session::manager::SessionManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

pub use waveform::{generate_steps, Step};

/// Physical unit a sequence commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    /// Volts.
    V,
    /// Amps.
    A,
    /// Watts.
    W,
    /// Ohms.
    #[serde(rename = "Ω")]
    Ohm,
}

/// A standard analytically-generated waveform shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandardType {
    /// Sinusoid.
    Sine,
    /// Symmetric rise/fall ramp.
    Triangle,
    /// Monotonic rise then reset.
    Ramp,
    /// Two-level alternation.
    Square,
    /// Ascending staircase.
    Steps,
}

/// One arbitrary-waveform step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArbitraryStep {
    /// Commanded value for this step.
    pub value: f64,
    /// How long to hold this value before advancing.
    pub dwell_ms: u64,
}

/// The waveform a sequence plays back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Waveform {
    /// Standard analytic waveform.
    Standard {
        /// Shape.
        shape: StandardType,
        /// Minimum value.
        min: f64,
        /// Maximum value.
        max: f64,
        /// Samples per cycle.
        points_per_cycle: u32,
        /// Dwell time per sample.
        interval_ms: u64,
    },
    /// A random walk re-seeded from the current commanded value each cycle.
    Random {
        /// Starting value for the very first cycle.
        start_value: f64,
        /// Maximum per-step excursion.
        max_step_size: f64,
        /// Minimum value.
        min: f64,
        /// Maximum value.
        max: f64,
        /// Samples per cycle.
        points_per_cycle: u32,
        /// Dwell time per sample.
        interval_ms: u64,
    },
    /// Explicit step list.
    Arbitrary {
        /// Steps, in playback order.
        steps: Vec<ArbitraryStep>,
    },
}

/// A saved waveform-sequence definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    /// Library-unique id.
    pub id: String,
    /// Display name (≤100 chars, validated on save).
    pub name: String,
    /// Commanded physical unit.
    pub unit: Unit,
    /// Playback waveform.
    pub waveform: Waveform,
    /// One-shot value commanded before the first step, if any.
    pub pre_value: Option<f64>,
    /// One-shot value commanded after completion or abort, if any.
    pub post_value: Option<f64>,
    /// Modifier pipeline: multiplicative scale, applied first.
    pub scale: Option<f64>,
    /// Modifier pipeline: additive offset, applied second.
    pub offset: Option<f64>,
    /// Modifier pipeline: lower clamp, applied third.
    pub min_clamp: Option<f64>,
    /// Modifier pipeline: upper clamp, applied third.
    pub max_clamp: Option<f64>,
    /// Modifier pipeline: maximum per-step rate of change, applied last.
    pub max_slew_rate: Option<f64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last-mutation time; bumped only by `update`.
    pub updated_at: DateTime<Utc>,
}

/// Engine-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SequenceError {
    /// The library is already at its configured maximum size.
    #[error("sequence library is full")]
    LibraryFull,
    /// A save/update request violated a validation limit.
    #[error("sequence validation failed: {field}: {reason}")]
    ScriptValidationFailed {
        /// Field that failed validation.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
    /// `sequenceAbort` or a status query found no active run.
    #[error("no active sequence")]
    NoActiveSequence,
    /// The target session could not be found or a write to it failed.
    #[error("session error: {0}")]
    Session(String),
    /// A request referenced a library id that doesn't exist.
    #[error("unknown sequence id: {0}")]
    UnknownSequence(String),
}

impl SequenceDefinition {
    /// Validates against the configured limits.
    pub fn validate(&self, limits: &crate::config::SequenceSettings) -> Result<(), SequenceError> {
        let fail = |field: &str, reason: &str| {
            Err(SequenceError::ScriptValidationFailed {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.name.len() > limits.max_name_len {
            return fail("name", "exceeds maximum length");
        }
        match &self.waveform {
            Waveform::Standard { points_per_cycle, interval_ms, .. }
            | Waveform::Random { points_per_cycle, interval_ms, .. } => {
                if *points_per_cycle < limits.min_points_per_cycle
                    || *points_per_cycle > limits.max_points_per_cycle
                {
                    return fail("pointsPerCycle", "out of bounds");
                }
                if *interval_ms < limits.min_interval_ms || *interval_ms > limits.max_interval_ms {
                    return fail("intervalMs", "out of bounds");
                }
            }
            Waveform::Arbitrary { steps } => {
                if steps.is_empty() || steps.len() > limits.max_arbitrary_steps {
                    return fail("steps", "step count out of bounds");
                }
            }
        }
        Ok(())
    }
}

/// Execution state of the (at most one) active sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// No run active.
    Idle,
    /// Steps are being executed.
    Running,
    /// Schedule frozen; resumable.
    Paused,
    /// All cycles finished normally.
    Completed,
    /// Stopped by user request.
    Aborted,
    /// Stopped by a driver error.
    Error,
}

/// Live state of the active sequence run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSequenceState {
    /// Library id of the running definition.
    pub sequence_id: String,
    /// Target device.
    pub device_id: String,
    /// Target setpoint name.
    pub parameter: String,
    /// Current run state.
    pub execution_state: ExecutionState,
    /// Index into the current cycle's step list.
    pub current_step_index: usize,
    /// Completed-cycle counter (0-based, monotonic non-decreasing until completion).
    pub current_cycle: u64,
    /// Total cycles to run, if bounded.
    pub total_cycles: Option<u64>,
    /// Most recently commanded value.
    pub commanded_value: f64,
    /// When this run started.
    pub started_at: DateTime<Utc>,
    /// Steps dropped so far due to scheduling lag.
    pub skipped_steps: u64,
}

/// Request to start a sequence run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Library id of the definition to play.
    pub sequence_id: String,
    /// Target device.
    pub device_id: String,
    /// Target setpoint name on that device.
    pub parameter: String,
    /// How many cycles to run; `None` runs until aborted.
    pub total_cycles: Option<u64>,
}

/// Events the engine broadcasts to all connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SequenceEvent {
    /// A run started.
    #[serde(rename = "sequenceStarted")]
    Started {
        /// Snapshot of the new run's state.
        state: ActiveSequenceState,
    },
    /// One step executed.
    #[serde(rename = "sequenceProgress")]
    Progress {
        /// Step index within the current cycle.
        current_step_index: usize,
        /// Current cycle number.
        current_cycle: u64,
        /// Value just commanded.
        commanded_value: f64,
    },
    /// The run finished all scheduled cycles.
    #[serde(rename = "sequenceCompleted")]
    Completed {
        /// Library id of the definition that completed.
        sequence_id: String,
    },
    /// The run was stopped by user request.
    #[serde(rename = "sequenceAborted")]
    Aborted {
        /// Library id of the definition that was aborted.
        sequence_id: String,
    },
    /// The run stopped because of a driver error.
    #[serde(rename = "sequenceError")]
    Error {
        /// Library id of the definition that errored.
        sequence_id: String,
        /// Error message.
        message: String,
    },
}

/// Commands accepted by the sequence engine actor.
enum Command {
    Run {
        request: RunRequest,
        definition: SequenceDefinition,
        reply: oneshot::Sender<Result<(), SequenceError>>,
    },
    Abort {
        reply: oneshot::Sender<Result<(), SequenceError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), SequenceError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), SequenceError>>,
    },
    GetState {
        reply: oneshot::Sender<Option<ActiveSequenceState>>,
    },
}

/// Cheap-to-clone handle to the running sequence engine actor.
#[derive(Clone)]
pub struct SequenceHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SequenceEvent>,
}

impl SequenceHandle {
    /// Subscribes to the global sequence-event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    /// Starts a run, aborting any currently active run first.
    pub async fn run(
        &self,
        request: RunRequest,
        definition: SequenceDefinition,
    ) -> Result<(), SequenceError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Run { request, definition, reply: tx }).await;
        rx.await.map_err(|_| SequenceError::Session("engine task gone".to_string()))?
    }

    /// Aborts the active run, if any.
    pub async fn abort(&self) -> Result<(), SequenceError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Abort { reply: tx }).await;
        rx.await.map_err(|_| SequenceError::Session("engine task gone".to_string()))?
    }

    /// Pauses the active run, if any.
    pub async fn pause(&self) -> Result<(), SequenceError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Pause { reply: tx }).await;
        rx.await.map_err(|_| SequenceError::Session("engine task gone".to_string()))?
    }

    /// Resumes a paused run.
    pub async fn resume(&self) -> Result<(), SequenceError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Resume { reply: tx }).await;
        rx.await.map_err(|_| SequenceError::Session("engine task gone".to_string()))?
    }

    /// Current run state, if any run is active.
    pub async fn state(&self) -> Option<ActiveSequenceState> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetState { reply: tx }).await;
        rx.await.ok().flatten()
    }
}

struct RunState {
    request: RunRequest,
    definition: SequenceDefinition,
    state: ActiveSequenceState,
    /// Resolved steps for the current cycle only (random walks re-roll per cycle).
    steps: Vec<Step>,
    /// Absolute fire times for the remaining steps of the current cycle.
    schedule: VecDeque<Instant>,
    paused_at: Option<Instant>,
}

/// Spawns the sequence engine actor and returns a handle to it.
pub fn spawn(sessions: SessionManager) -> SequenceHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, _) = broadcast::channel(256);
    let handle = SequenceHandle { commands: cmd_tx, events: event_tx.clone() };
    tokio::spawn(run_engine(sessions, cmd_rx, event_tx));
    handle
}

async fn run_engine(
    sessions: SessionManager,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SequenceEvent>,
) {
    let mut run: Option<RunState> = None;

    loop {
        let next_fire = run
            .as_ref()
            .filter(|r| r.paused_at.is_none())
            .and_then(|r| r.schedule.front().copied());

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(cmd, &mut run, &sessions, &events).await;
            }
            _ = async { tokio::time::sleep_until(next_fire.unwrap()).await }, if next_fire.is_some() => {
                advance_run(&mut run, &sessions, &events).await;
            }
        }
    }
}

async fn handle_command(
    cmd: Command,
    run: &mut Option<RunState>,
    sessions: &SessionManager,
    events: &broadcast::Sender<SequenceEvent>,
) {
    match cmd {
        Command::Run { request, definition, reply } => {
            if let Some(prev) = run.take() {
                apply_post_value(&prev, sessions).await;
                let _ = events.send(SequenceEvent::Aborted { sequence_id: prev.definition.id.clone() });
            }
            let started = start_run(request, definition, sessions).await;
            match started {
                Ok(new_run) => {
                    let _ = events.send(SequenceEvent::Started { state: new_run.state.clone() });
                    *run = Some(new_run);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        Command::Abort { reply } => {
            if let Some(finished) = run.take() {
                apply_post_value(&finished, sessions).await;
                let _ = events.send(SequenceEvent::Aborted { sequence_id: finished.definition.id.clone() });
                let _ = reply.send(Ok(()));
            } else {
                let _ = reply.send(Err(SequenceError::NoActiveSequence));
            }
        }
        Command::Pause { reply } => {
            if let Some(r) = run.as_mut() {
                if r.state.execution_state == ExecutionState::Running {
                    r.paused_at = Some(Instant::now());
                    r.state.execution_state = ExecutionState::Paused;
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(SequenceError::NoActiveSequence));
                }
            } else {
                let _ = reply.send(Err(SequenceError::NoActiveSequence));
            }
        }
        Command::Resume { reply } => {
            if let Some(r) = run.as_mut() {
                if let Some(paused_at) = r.paused_at.take() {
                    let shift = paused_at.elapsed();
                    r.schedule = r.schedule.iter().map(|t| *t + shift).collect();
                    r.state.execution_state = ExecutionState::Running;
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(SequenceError::NoActiveSequence));
                }
            } else {
                let _ = reply.send(Err(SequenceError::NoActiveSequence));
            }
        }
        Command::GetState { reply } => {
            let _ = reply.send(run.as_ref().map(|r| r.state.clone()));
        }
    }
}

async fn start_run(
    request: RunRequest,
    definition: SequenceDefinition,
    sessions: &SessionManager,
) -> Result<RunState, SequenceError> {
    if let Some(pre) = definition.pre_value {
        sessions
            .set_value(&request.device_id, &request.parameter, pre, true)
            .await
            .map_err(|e| SequenceError::Session(e.to_string()))?;
    }
    let steps = waveform::generate_steps(&definition.waveform, None);
    let first_dwell = steps.first().map(|s| s.dwell_ms).unwrap_or(0);
    if definition.pre_value.is_some() {
        tokio::time::sleep(Duration::from_millis(first_dwell)).await;
    }

    let now = Instant::now();
    let schedule = build_schedule(now, &steps);
    let started_at = Utc::now();

    Ok(RunState {
        state: ActiveSequenceState {
            sequence_id: definition.id.clone(),
            device_id: request.device_id.clone(),
            parameter: request.parameter.clone(),
            execution_state: ExecutionState::Running,
            current_step_index: 0,
            current_cycle: 0,
            total_cycles: request.total_cycles,
            commanded_value: steps.first().map(|s| s.value).unwrap_or(0.0),
            started_at,
            skipped_steps: 0,
        },
        request,
        definition,
        steps,
        schedule,
        paused_at: None,
    })
}

fn build_schedule(from: Instant, steps: &[Step]) -> VecDeque<Instant> {
    let mut t = from;
    let mut out = VecDeque::with_capacity(steps.len());
    for step in steps {
        out.push_back(t);
        t += Duration::from_millis(step.dwell_ms);
    }
    out
}

/// Executes the next due step, dropping any steps whose scheduled time has
/// already passed: never executes more than
/// one step per wakeup "to catch up".
async fn advance_run(
    run: &mut Option<RunState>,
    sessions: &SessionManager,
    events: &broadcast::Sender<SequenceEvent>,
) {
    let Some(r) = run.as_mut() else { return };
    let now = Instant::now();

    // Drop every scheduled time already in the past except the last one.
    while r.schedule.len() > 1 && r.schedule[1] <= now {
        r.schedule.pop_front();
        r.state.skipped_steps += 1;
        r.state.current_step_index += 1;
    }
    let Some(_fire_at) = r.schedule.pop_front() else { return };

    let raw_step = r.steps.get(r.state.current_step_index).copied();
    let Some(raw_step) = raw_step else {
        return advance_cycle(run, sessions, events).await;
    };

    let prev_commanded = r.state.commanded_value;
    let value = waveform::apply_modifiers(raw_step.value, &r.definition, prev_commanded, raw_step.dwell_ms);

    let result = sessions.set_value(&r.state.device_id, &r.state.parameter, value, true).await;
    match result {
        Ok(()) => {
            r.state.commanded_value = value;
            let _ = events.send(SequenceEvent::Progress {
                current_step_index: r.state.current_step_index,
                current_cycle: r.state.current_cycle,
                commanded_value: value,
            });
            info!(
                step = r.state.current_step_index,
                cycle = r.state.current_cycle,
                value,
                "sequence step executed"
            );
        }
        Err(e) => {
            warn!(error = %e, "sequence step failed, terminating run");
            let sequence_id = r.definition.id.clone();
            *run = None;
            let _ = events.send(SequenceEvent::Error { sequence_id, message: e.to_string() });
            return;
        }
    }

    if r.state.current_step_index + 1 >= r.steps.len() {
        advance_cycle(run, sessions, events).await;
    } else {
        r.state.current_step_index += 1;
    }
}

async fn advance_cycle(
    run: &mut Option<RunState>,
    sessions: &SessionManager,
    events: &broadcast::Sender<SequenceEvent>,
) {
    let Some(r) = run.as_mut() else { return };
    r.state.current_cycle += 1;

    if let Some(total) = r.state.total_cycles {
        if r.state.current_cycle >= total {
            let finished = run.take().unwrap();
            apply_post_value(&finished, sessions).await;
            let _ = events.send(SequenceEvent::Completed { sequence_id: finished.definition.id.clone() });
            return;
        }
    }

    r.steps = waveform::generate_steps(&r.definition.waveform, Some(r.state.commanded_value));
    r.state.current_step_index = 0;
    r.schedule = build_schedule(Instant::now(), &r.steps);
}

async fn apply_post_value(run: &RunState, sessions: &SessionManager) {
    if let Some(post) = run.definition.post_value {
        let _ = sessions
            .set_value(&run.state.device_id, &run.state.parameter, post, true)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_def() -> SequenceDefinition {
        SequenceDefinition {
            id: "seq-1".into(),
            name: "test sine".into(),
            unit: Unit::V,
            waveform: Waveform::Standard {
                shape: StandardType::Sine,
                min: 0.0,
                max: 10.0,
                points_per_cycle: 10,
                interval_ms: 100,
            },
            pre_value: None,
            post_value: Some(0.0),
            scale: None,
            offset: None,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_rejects_out_of_bounds_points_per_cycle() {
        let limits = crate::config::SequenceSettings::default();
        let mut def = sine_def();
        if let Waveform::Standard { points_per_cycle, .. } = &mut def.waveform {
            *points_per_cycle = 1;
        }
        assert!(matches!(
            def.validate(&limits),
            Err(SequenceError::ScriptValidationFailed { .. })
        ));
    }

    #[test]
    fn validate_accepts_boundary_points_per_cycle() {
        let limits = crate::config::SequenceSettings::default();
        let mut def = sine_def();
        if let Waveform::Standard { points_per_cycle, .. } = &mut def.waveform {
            *points_per_cycle = 2;
        }
        assert!(def.validate(&limits).is_ok());
        if let Waveform::Standard { points_per_cycle, .. } = &mut def.waveform {
            *points_per_cycle = 10_000;
        }
        assert!(def.validate(&limits).is_ok());
    }

    #[test]
    fn validate_rejects_empty_arbitrary_steps() {
        let limits = crate::config::SequenceSettings::default();
        let mut def = sine_def();
        def.waveform = Waveform::Arbitrary { steps: vec![] };
        assert!(def.validate(&limits).is_err());
        def.waveform = Waveform::Arbitrary { steps: vec![ArbitraryStep { value: 1.0, dwell_ms: 10 }] };
        assert!(def.validate(&limits).is_ok());
    }
}

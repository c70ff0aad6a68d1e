//! Oscilloscope session actor.
//!
//! A `get_status` poll runs every `statusPollIntervalMs` regardless of mode
//! (also where the auto-start rule is evaluated while idle — any enabled
//! channel with no active explicit stream starts one with the default
//! measurement set `{VPP, FREQ, VAVG}`); while streaming, this status poll
//! keeps running on its own cadence, interleaved between the waveform
//! sweeps rather than replaced by them. Streaming mode additionally fetches
//! a waveform per streamed channel every
//! `max(requestedIntervalMs, floor(channelCount))` and computes measurements
//! locally from the capture. An explicit `scopeStartStreaming` always wins
//! over the auto-start grace window and bumps the generation counter, so a
//! fetch in flight from the previous mode is discarded rather than merged
//! with the new one.

use crate::config::ScopeSettings;
use crate::driver::scope::{
    ChannelParam, ScopeDriver, ScopeStatus, TimebaseParam, TriggerParam, WaveformSample,
};
use crate::driver::{DriverError, InstrumentInfo};
use crate::history::{History, HistorySnapshot};
use crate::scpi::Measurement;
use crate::session::measure;
use crate::session::{fanout_try_send, ClientId, ConnectionStatus, MeasurementUpdate, SessionEvent};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const DEFAULT_MEASUREMENTS: [&str; 3] = ["VPP", "FREQ", "VAVG"];

/// A point-in-time view of an oscilloscope session.
#[derive(Debug, Clone)]
pub struct ScopeSnapshot {
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

enum Command {
    GetSnapshot(oneshot::Sender<ScopeSnapshot>),
    GetHistory(oneshot::Sender<HistorySnapshot>),
    Subscribe(ClientId, mpsc::Sender<SessionEvent>),
    Unsubscribe(ClientId),
    Run(oneshot::Sender<Result<(), DriverError>>),
    Stop(oneshot::Sender<Result<(), DriverError>>),
    Single(oneshot::Sender<Result<(), DriverError>>),
    AutoSetup(oneshot::Sender<Result<(), DriverError>>),
    ForceTrigger(oneshot::Sender<Result<(), DriverError>>),
    SetChannelParam { channel: String, param: ChannelParam, reply: oneshot::Sender<Result<(), DriverError>> },
    SetTimebaseParam { param: TimebaseParam, reply: oneshot::Sender<Result<(), DriverError>> },
    SetTriggerParam { param: TriggerParam, reply: oneshot::Sender<Result<(), DriverError>> },
    GetWaveform {
        channel: String,
        start: Option<u64>,
        count: Option<u64>,
        reply: oneshot::Sender<Result<WaveformSample, DriverError>>,
    },
    GetScreenshot(oneshot::Sender<Result<Vec<u8>, DriverError>>),
    StartStreaming {
        channels: Vec<String>,
        measurements: Option<HashMap<String, Vec<String>>>,
        interval_ms: Option<u64>,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    StopStreaming(oneshot::Sender<Result<(), DriverError>>),
    Reconnect(oneshot::Sender<Result<(), DriverError>>),
}

/// Cheap-to-clone handle to a running oscilloscope session actor.
#[derive(Clone)]
pub struct ScopeHandle {
    commands: mpsc::Sender<Command>,
}

macro_rules! simple_call {
    ($name:ident, $variant:ident) => {
        /// Sends the
        #[doc = stringify!($variant)]
        /// command and awaits its reply.
        pub async fn $name(&self) -> Result<(), DriverError> {
            let (tx, rx) = oneshot::channel();
            let _ = self.commands.send(Command::$variant(tx)).await;
            rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
        }
    };
}

impl ScopeHandle {
    /// Current state snapshot.
    pub async fn snapshot(&self) -> ScopeSnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetSnapshot(tx)).await;
        rx.await.expect("scope session task gone")
    }

    /// Full history ring contents (per-channel computed measurements).
    pub async fn history(&self) -> HistorySnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetHistory(tx)).await;
        rx.await.expect("scope session task gone")
    }

    /// Registers `sender` to receive this session's events under `client_id`.
    pub async fn subscribe(&self, client_id: ClientId, sender: mpsc::Sender<SessionEvent>) {
        let _ = self.commands.send(Command::Subscribe(client_id, sender)).await;
    }

    /// Removes a previously registered subscriber.
    pub async fn unsubscribe(&self, client_id: ClientId) {
        let _ = self.commands.send(Command::Unsubscribe(client_id)).await;
    }

    simple_call!(run, Run);
    simple_call!(stop, Stop);
    simple_call!(single, Single);
    simple_call!(auto_setup, AutoSetup);
    simple_call!(force_trigger, ForceTrigger);

    /// Applies one channel vertical-configuration field update.
    pub async fn set_channel_param(&self, channel: impl Into<String>, param: ChannelParam) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::SetChannelParam { channel: channel.into(), param, reply: tx })
            .await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Applies one timebase field update.
    pub async fn set_timebase_param(&self, param: TimebaseParam) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetTimebaseParam { param, reply: tx }).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Applies one trigger field update.
    pub async fn set_trigger_param(&self, param: TriggerParam) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetTriggerParam { param, reply: tx }).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Fetches a waveform capture directly (bypassing the streaming path).
    pub async fn get_waveform(
        &self,
        channel: impl Into<String>,
        start: Option<u64>,
        count: Option<u64>,
    ) -> Result<WaveformSample, DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::GetWaveform { channel: channel.into(), start, count, reply: tx })
            .await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Fetches a display screenshot.
    pub async fn get_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetScreenshot(tx)).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Explicitly starts streaming `channels`. Always wins over any
    /// in-progress auto-start grace window.
    pub async fn start_streaming(
        &self,
        channels: Vec<String>,
        measurements: Option<HashMap<String, Vec<String>>>,
        interval_ms: Option<u64>,
    ) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::StartStreaming { channels, measurements, interval_ms, reply: tx })
            .await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Stops any active stream (auto-started or explicit).
    pub async fn stop_streaming(&self) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::StopStreaming(tx)).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Requests a reconnect attempt from a `disconnected` state. Resumes the
    /// prior channel set if one was streaming.
    pub async fn reconnect(&self) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Reconnect(tx)).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }
}

struct Subscribers {
    senders: HashMap<ClientId, mpsc::Sender<SessionEvent>>,
}

impl Subscribers {
    fn new() -> Self {
        Self { senders: HashMap::new() }
    }

    fn broadcast(&self, event: SessionEvent) {
        for sender in self.senders.values() {
            fanout_try_send(sender, event.clone());
        }
    }

    fn field(&self, field: &str, value: serde_json::Value) {
        self.broadcast(SessionEvent::Field { field: field.to_string(), value });
    }
}

struct ScopeState {
    connection_status: ConnectionStatus,
    consecutive_errors: u32,
    status: Option<ScopeStatus>,
    streaming: bool,
    auto_started: bool,
    stream_channels: Vec<String>,
    stream_measurements: HashMap<String, Vec<String>>,
    generation: u64,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            connection_status: ConnectionStatus::Connected,
            consecutive_errors: 0,
            status: None,
            streaming: false,
            auto_started: false,
            stream_channels: Vec::new(),
            stream_measurements: HashMap::new(),
            generation: 0,
        }
    }
}

/// Spawns an oscilloscope session actor over `driver` and returns a handle.
pub fn spawn(driver: Box<dyn ScopeDriver>, settings: ScopeSettings) -> ScopeHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let handle = ScopeHandle { commands: cmd_tx };
    tokio::spawn(run(driver, settings, cmd_rx));
    handle
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

async fn run(mut driver: Box<dyn ScopeDriver>, settings: ScopeSettings, mut commands: mpsc::Receiver<Command>) {
    let info = driver.info().clone();
    let mut state = ScopeState::new();
    let mut history = History::new(10_000);
    let mut subscribers = Subscribers::new();

    let mut status_timer = Some(build_interval(settings.status_poll_interval_ms));
    let mut stream_timer: Option<Interval> = None;

    loop {
        let status_active = state.connection_status != ConnectionStatus::Disconnected;
        let stream_active = state.streaming && state.connection_status != ConnectionStatus::Disconnected;

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(cmd, &mut driver, &settings, &mut state, &history, &mut subscribers, &mut stream_timer).await;
            }
            _ = next_tick(&mut status_timer), if status_active => {
                idle_poll(&mut driver, &settings, &mut state, &subscribers, &mut stream_timer, &info.id).await;
            }
            _ = next_tick(&mut stream_timer), if stream_active => {
                stream_tick(&mut driver, &settings, &mut state, &mut history, &subscribers, &info.id).await;
            }
        }
    }
}

fn build_interval(ms: u64) -> Interval {
    let mut t = interval(Duration::from_millis(ms.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

async fn handle_command(
    cmd: Command,
    driver: &mut Box<dyn ScopeDriver>,
    settings: &ScopeSettings,
    state: &mut ScopeState,
    history: &History,
    subscribers: &mut Subscribers,
    stream_timer: &mut Option<Interval>,
) {
    match cmd {
        Command::GetSnapshot(reply) => {
            let _ = reply.send(ScopeSnapshot {
                info: driver.info().clone(),
                connection_status: state.connection_status,
                status: state.status.clone(),
                streaming: state.streaming,
                streamed_channels: state.stream_channels.clone(),
            });
        }
        Command::GetHistory(reply) => {
            let _ = reply.send(history.snapshot());
        }
        Command::Subscribe(id, sender) => {
            subscribers.senders.insert(id, sender);
        }
        Command::Unsubscribe(id) => {
            subscribers.senders.remove(&id);
        }
        Command::Run(reply) => {
            let _ = reply.send(driver.run().await);
        }
        Command::Stop(reply) => {
            let _ = reply.send(driver.stop().await);
        }
        Command::Single(reply) => {
            let _ = reply.send(driver.single().await);
        }
        Command::AutoSetup(reply) => {
            let result = driver.auto_setup().await;
            if result.is_ok() {
                tokio::time::sleep(Duration::from_millis(settings.auto_setup_settle_ms)).await;
            }
            let _ = reply.send(result);
        }
        Command::ForceTrigger(reply) => {
            let _ = reply.send(driver.force_trigger().await);
        }
        Command::SetChannelParam { channel, param, reply } => {
            let _ = reply.send(driver.set_channel_param(&channel, param).await);
        }
        Command::SetTimebaseParam { param, reply } => {
            let _ = reply.send(driver.set_timebase_param(param).await);
        }
        Command::SetTriggerParam { param, reply } => {
            let _ = reply.send(driver.set_trigger_param(param).await);
        }
        Command::GetWaveform { channel, start, count, reply } => {
            let _ = reply.send(driver.get_waveform(&channel, start, count).await);
        }
        Command::GetScreenshot(reply) => {
            let _ = reply.send(driver.get_screenshot().await);
        }
        Command::StartStreaming { channels, measurements, interval_ms, reply } => {
            start_streaming(state, channels, measurements, interval_ms, settings, stream_timer, false);
            subscribers.field("streaming", serde_json::json!(true));
            let _ = reply.send(Ok(()));
        }
        Command::StopStreaming(reply) => {
            stop_streaming(state, stream_timer);
            subscribers.field("streaming", serde_json::json!(false));
            let _ = reply.send(Ok(()));
        }
        Command::Reconnect(reply) => {
            let result = driver.connect().await;
            match &result {
                Ok(()) => {
                    state.connection_status = ConnectionStatus::Connected;
                    state.consecutive_errors = 0;
                    subscribers.field("connectionStatus", serde_json::json!("connected"));
                    if state.streaming {
                        // Resume the prior channel set: the stream_timer is
                        // already armed, this just logs the resumption.
                        info!(channels = ?state.stream_channels, "scope session reconnected, resuming stream");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "scope reconnect attempt failed");
                }
            }
            let _ = reply.send(result);
        }
    }
}

fn start_streaming(
    state: &mut ScopeState,
    channels: Vec<String>,
    measurements: Option<HashMap<String, Vec<String>>>,
    interval_ms: Option<u64>,
    settings: &ScopeSettings,
    stream_timer: &mut Option<Interval>,
    auto: bool,
) {
    state.generation += 1;
    state.streaming = true;
    state.auto_started = auto;
    state.stream_channels = channels.clone();
    state.stream_measurements = measurements.unwrap_or_else(|| {
        channels
            .iter()
            .map(|c| (c.clone(), DEFAULT_MEASUREMENTS.iter().map(|s| s.to_string()).collect()))
            .collect()
    });

    let floor = settings.floor_for_channel_count(channels.len());
    let requested = interval_ms.map(Duration::from_millis).unwrap_or(Duration::ZERO);
    let effective = requested.max(floor);
    *stream_timer = Some(build_interval(effective.as_millis() as u64));
}

fn stop_streaming(state: &mut ScopeState, stream_timer: &mut Option<Interval>) {
    state.generation += 1;
    state.streaming = false;
    state.auto_started = false;
    state.stream_channels.clear();
    state.stream_measurements.clear();
    *stream_timer = None;
}

async fn idle_poll(
    driver: &mut Box<dyn ScopeDriver>,
    settings: &ScopeSettings,
    state: &mut ScopeState,
    subscribers: &Subscribers,
    stream_timer: &mut Option<Interval>,
    device_id: &str,
) {
    match driver.get_status().await {
        Ok(status) => {
            state.consecutive_errors = 0;
            if state.connection_status != ConnectionStatus::Connected {
                state.connection_status = ConnectionStatus::Connected;
                subscribers.field("connectionStatus", serde_json::json!("connected"));
            }
            let enabled: Vec<String> = status
                .channels
                .iter()
                .filter(|(_, c)| c.enabled)
                .map(|(name, _)| name.clone())
                .collect();
            state.status = Some(status);

            if !state.streaming && !enabled.is_empty() {
                debug!(channels = ?enabled, "auto-starting stream for enabled channels");
                start_streaming(state, enabled, None, None, settings, stream_timer, true);
                subscribers.field("streaming", serde_json::json!(true));
            }
        }
        Err(e) => {
            on_poll_error(e, settings.max_consecutive_errors, state, subscribers, device_id);
        }
    }
}

async fn stream_tick(
    driver: &mut Box<dyn ScopeDriver>,
    settings: &ScopeSettings,
    state: &mut ScopeState,
    history: &mut History,
    subscribers: &Subscribers,
    device_id: &str,
) {
    let generation = state.generation;
    let channels = state.stream_channels.clone();
    let mut any_error = None;
    let mut columns: HashMap<String, Option<f64>> = HashMap::new();

    for channel in &channels {
        match driver.get_waveform(channel, None, None).await {
            Ok(sample) => {
                if state.generation != generation {
                    return; // superseded by a stop/start while this fetch was in flight
                }
                let measurement_names = state
                    .stream_measurements
                    .get(channel)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_MEASUREMENTS.iter().map(|s| s.to_string()).collect());
                for name in &measurement_names {
                    let m = compute_measurement(&sample, name, settings.max_dft_points);
                    columns.insert(format!("{channel}.{name}"), m.value());
                }
            }
            Err(e) => {
                any_error = Some(e);
                break;
            }
        }
    }

    if state.generation != generation {
        return;
    }

    if let Some(e) = any_error {
        on_poll_error(e, settings.max_consecutive_errors, state, subscribers, device_id);
        return;
    }

    state.consecutive_errors = 0;
    if state.connection_status != ConnectionStatus::Connected {
        state.connection_status = ConnectionStatus::Connected;
        subscribers.field("connectionStatus", serde_json::json!("connected"));
    }

    let timestamp = Utc::now();
    history.push(timestamp, &columns);
    subscribers.broadcast(SessionEvent::Measurement {
        update: MeasurementUpdate { timestamp, measurements: columns },
    });
}

fn compute_measurement(sample: &WaveformSample, name: &str, max_dft_points: usize) -> Measurement {
    measure::compute(name, &sample.points, sample.x_increment, max_dft_points)
}

fn on_poll_error(
    e: DriverError,
    max_consecutive_errors: u32,
    state: &mut ScopeState,
    subscribers: &Subscribers,
    device_id: &str,
) {
    state.consecutive_errors += 1;
    warn!(device = device_id, error = %e, consecutive = state.consecutive_errors, "scope poll failed");
    if state.consecutive_errors >= max_consecutive_errors {
        if state.connection_status != ConnectionStatus::Disconnected {
            state.connection_status = ConnectionStatus::Disconnected;
            subscribers.field("connectionStatus", serde_json::json!("disconnected"));
        }
    } else if state.connection_status == ConnectionStatus::Connected {
        state.connection_status = ConnectionStatus::Error;
        subscribers.field("connectionStatus", serde_json::json!("error"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scope::GenericScpiScope;
    use crate::transport::mock::MockTransport;

    fn caps() -> crate::driver::scope::ScopeCapabilities {
        crate::driver::scope::ScopeCapabilities {
            channels: 1,
            bandwidth: 100_000_000.0,
            max_sample_rate: 1_000_000_000.0,
            max_memory_depth: 12_000_000,
            supported_measurements: vec!["VPP".into()],
            has_awg: false,
        }
    }

    async fn spawn_test_session() -> ScopeHandle {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DS1054Z,DS1ZA1,00.01");
        let mut driver = GenericScpiScope::new(t, caps());
        driver.probe().await.unwrap();
        let mut settings = ScopeSettings::default();
        settings.status_poll_interval_ms = 60_000;
        spawn(Box::new(driver), settings)
    }

    #[tokio::test]
    async fn snapshot_starts_idle_and_connected() {
        let handle = spawn_test_session().await;
        let snap = handle.snapshot().await;
        assert!(!snap.streaming);
        assert_eq!(snap.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn explicit_start_streaming_sets_channel_set() {
        let handle = spawn_test_session().await;
        handle
            .start_streaming(vec!["CH1".to_string()], None, Some(50))
            .await
            .unwrap();
        let snap = handle.snapshot().await;
        assert!(snap.streaming);
        assert_eq!(snap.streamed_channels, vec!["CH1".to_string()]);
    }

    #[tokio::test]
    async fn stop_streaming_clears_channel_set() {
        let handle = spawn_test_session().await;
        handle.start_streaming(vec!["CH1".to_string()], None, None).await.unwrap();
        handle.stop_streaming().await.unwrap();
        let snap = handle.snapshot().await;
        assert!(!snap.streaming);
        assert!(snap.streamed_channels.is_empty());
    }
}

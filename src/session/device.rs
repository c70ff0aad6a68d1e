//! PSU/electronic-load session actor.
//!
//! One [`DeviceSession`] owns exactly one [`Driver`] and runs a poll loop at
//! `pollIntervalMs`. Writes are either immediate (`setOutput`, `setMode`, and
//! `setValue` with `immediate: true`) or debounced: a debounced `setValue`
//! updates the locally displayed value right away and arms a timer: further
//! edits to the same field before the timer fires replace the pending value
//! and restart the wait (coalescing), rather than queuing a write per
//! keystroke. The timer fires by posting a message back to this session's
//! own command channel, the same self-message pattern used elsewhere in the
//! crate for retry backoff.

use crate::config::SessionSettings;
use crate::driver::{Capabilities, Driver, DriverError, InstrumentInfo};
use crate::history::{History, HistorySnapshot};
use crate::scpi::Measurement;
use crate::session::{fanout_try_send, ClientId, ConnectionStatus, MeasurementUpdate, SessionEvent};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A point-in-time view of a device session's state.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
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
    /// Setpoints by name (optimistic overlay applied where a write is in flight).
    pub setpoints: HashMap<String, f64>,
    /// Last-sampled measurements by name.
    pub measurements: HashMap<String, Measurement>,
}

enum Command {
    GetSnapshot(oneshot::Sender<DeviceSnapshot>),
    GetHistory(oneshot::Sender<HistorySnapshot>),
    Subscribe(ClientId, mpsc::Sender<SessionEvent>),
    Unsubscribe(ClientId),
    SetMode { mode: String, reply: oneshot::Sender<Result<(), DriverError>> },
    SetOutput { enabled: bool, reply: oneshot::Sender<Result<(), DriverError>> },
    SetValue { name: String, value: f64, immediate: bool, reply: oneshot::Sender<Result<(), DriverError>> },
    DebounceFire { name: String, generation: u64 },
    Reconnect { reply: oneshot::Sender<Result<(), DriverError>> },
}

/// Cheap-to-clone handle to a running device session actor.
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<Command>,
}

impl DeviceHandle {
    /// Current state snapshot.
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetSnapshot(tx)).await;
        rx.await.expect("device session task gone")
    }

    /// Full history ring contents.
    pub async fn history(&self) -> HistorySnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::GetHistory(tx)).await;
        rx.await.expect("device session task gone")
    }

    /// Registers `sender` to receive this session's events under `client_id`.
    pub async fn subscribe(&self, client_id: ClientId, sender: mpsc::Sender<SessionEvent>) {
        let _ = self.commands.send(Command::Subscribe(client_id, sender)).await;
    }

    /// Removes a previously registered subscriber.
    pub async fn unsubscribe(&self, client_id: ClientId) {
        let _ = self.commands.send(Command::Unsubscribe(client_id)).await;
    }

    /// Commands an immediate mode change.
    pub async fn set_mode(&self, mode: impl Into<String>) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetMode { mode: mode.into(), reply: tx }).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Commands an immediate output enable/disable.
    pub async fn set_output(&self, enabled: bool) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::SetOutput { enabled, reply: tx }).await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Commands a setpoint write. When `immediate` is false the write is
    /// debounced per the session's configured `debounceMs`.
    pub async fn set_value(&self, name: impl Into<String>, value: f64, immediate: bool) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .commands
            .send(Command::SetValue { name: name.into(), value, immediate, reply: tx })
            .await;
        rx.await.map_err(|_| DriverError::NotSupported("session gone".to_string()))?
    }

    /// Requests a reconnect attempt from a `disconnected` state.
    pub async fn reconnect(&self) -> Result<(), DriverError> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Reconnect { reply: tx }).await;
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

struct DeviceState {
    mode: Option<String>,
    output_enabled: bool,
    setpoints: HashMap<String, f64>,
    measurements: HashMap<String, Measurement>,
    connection_status: ConnectionStatus,
    consecutive_errors: u32,
    in_flight: HashMap<String, u32>,
    pending_generation: HashMap<String, u64>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            mode: None,
            output_enabled: false,
            setpoints: HashMap::new(),
            measurements: HashMap::new(),
            connection_status: ConnectionStatus::Connected,
            consecutive_errors: 0,
            in_flight: HashMap::new(),
            pending_generation: HashMap::new(),
        }
    }

    fn in_flight_for(&self, name: &str) -> u32 {
        self.in_flight.get(name).copied().unwrap_or(0)
    }
}

/// Spawns a device session actor over `driver` and returns a handle to it.
pub fn spawn(driver: Box<dyn Driver>, settings: SessionSettings) -> DeviceHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let handle = DeviceHandle { commands: cmd_tx.clone() };
    tokio::spawn(run(driver, settings, cmd_tx, cmd_rx));
    handle
}

async fn run(
    mut driver: Box<dyn Driver>,
    settings: SessionSettings,
    self_tx: mpsc::Sender<Command>,
    mut commands: mpsc::Receiver<Command>,
) {
    let info = driver.info().clone();
    let capabilities = driver.capabilities().clone();
    let mut state = DeviceState::new();
    let mut history = History::new(settings.history_capacity);
    let mut subscribers = Subscribers::new();

    let mut poll_timer = interval(Duration::from_millis(settings.poll_interval_ms));
    poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(
                    cmd,
                    &mut driver,
                    &settings,
                    &mut state,
                    &history,
                    &mut subscribers,
                    &self_tx,
                ).await;
            }
            _ = poll_timer.tick(), if state.connection_status != ConnectionStatus::Disconnected => {
                poll_once(&mut driver, &settings, &mut state, &mut history, &subscribers, &info.id).await;
            }
        }
    }
}

async fn handle_command(
    cmd: Command,
    driver: &mut Box<dyn Driver>,
    settings: &SessionSettings,
    state: &mut DeviceState,
    history: &History,
    subscribers: &mut Subscribers,
    self_tx: &mpsc::Sender<Command>,
) {
    match cmd {
        Command::GetSnapshot(reply) => {
            let _ = reply.send(DeviceSnapshot {
                info: driver.info().clone(),
                capabilities: driver.capabilities().clone(),
                connection_status: state.connection_status,
                mode: state.mode.clone(),
                output_enabled: state.output_enabled,
                setpoints: state.setpoints.clone(),
                measurements: state.measurements.clone(),
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
        Command::SetMode { mode, reply } => {
            let result = driver.set_mode(&mode).await;
            if result.is_ok() {
                state.mode = Some(mode.clone());
                subscribers.field("mode", serde_json::json!(mode));
            }
            let _ = reply.send(result);
        }
        Command::SetOutput { enabled, reply } => {
            let result = driver.set_output(enabled).await;
            if result.is_ok() {
                state.output_enabled = enabled;
                subscribers.field("outputEnabled", serde_json::json!(enabled));
            }
            let _ = reply.send(result);
        }
        Command::SetValue { name, value, immediate, reply } => {
            state.setpoints.insert(name.clone(), value);
            *state.in_flight.entry(name.clone()).or_insert(0) += 1;
            subscribers.field(&name, serde_json::json!(value));

            if immediate {
                // Bypass any pending debounce: bump the generation so a
                // stale timer for this field finds itself superseded.
                let gen = state.pending_generation.entry(name.clone()).or_insert(0);
                *gen += 1;
                let result = driver.set_value(&name, value).await;
                if let Some(counter) = state.in_flight.get_mut(&name) {
                    *counter = 0;
                }
                let _ = reply.send(result);
            } else {
                let gen = state.pending_generation.entry(name.clone()).or_insert(0);
                *gen += 1;
                let fire_gen = *gen;
                let debounce = Duration::from_millis(settings.debounce_ms);
                let self_tx = self_tx.clone();
                let field = name.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let _ = self_tx.send(Command::DebounceFire { name: field, generation: fire_gen }).await;
                });
                let _ = reply.send(Ok(()));
            }
        }
        Command::DebounceFire { name, generation } => {
            if state.pending_generation.get(&name) != Some(&generation) {
                debug!(field = %name, "stale debounce timer fired, ignoring");
                return;
            }
            let Some(&value) = state.setpoints.get(&name) else { return };
            let result = driver.set_value(&name, value).await;
            match result {
                Ok(()) => {
                    // The flushed write carries every coalesced edit at once;
                    // the field becomes device-authoritative again.
                    state.in_flight.insert(name, 0);
                }
                Err(e) => {
                    warn!(field = %name, error = %e, "debounced set_value failed");
                    state.in_flight.insert(name, 0);
                }
            }
        }
        Command::Reconnect { reply } => {
            let result = driver.connect().await;
            match &result {
                Ok(()) => {
                    state.connection_status = ConnectionStatus::Connected;
                    state.consecutive_errors = 0;
                    subscribers.field("connectionStatus", serde_json::json!("connected"));
                    info!("device session reconnected");
                }
                Err(e) => {
                    warn!(error = %e, "reconnect attempt failed");
                }
            }
            let _ = reply.send(result);
        }
    }
}

async fn poll_once(
    driver: &mut Box<dyn Driver>,
    settings: &SessionSettings,
    state: &mut DeviceState,
    history: &mut History,
    subscribers: &Subscribers,
    device_id: &str,
) {
    match driver.get_status().await {
        Ok(sample) => {
            state.consecutive_errors = 0;
            if state.connection_status != ConnectionStatus::Connected {
                state.connection_status = ConnectionStatus::Connected;
                subscribers.field("connectionStatus", serde_json::json!("connected"));
            }

            if sample.mode.is_some() && sample.mode != state.mode {
                state.mode = sample.mode.clone();
                subscribers.field("mode", serde_json::json!(state.mode));
            }
            if sample.output_enabled != state.output_enabled {
                state.output_enabled = sample.output_enabled;
                subscribers.field("outputEnabled", serde_json::json!(state.output_enabled));
            }
            for (name, value) in &sample.setpoints {
                if state.in_flight_for(name) > 0 {
                    continue; // optimistic value still authoritative
                }
                if state.setpoints.get(name) != Some(value) {
                    state.setpoints.insert(name.clone(), *value);
                    subscribers.field(name, serde_json::json!(value));
                }
            }

            state.measurements = sample.measurements.clone();
            let numeric: HashMap<String, Option<f64>> = sample
                .measurements
                .iter()
                .map(|(k, v)| (k.clone(), v.value()))
                .collect();
            let timestamp = Utc::now();
            history.push(timestamp, &numeric);
            subscribers.broadcast(SessionEvent::Measurement {
                update: MeasurementUpdate { timestamp, measurements: numeric },
            });
        }
        Err(e) => {
            state.consecutive_errors += 1;
            warn!(device = device_id, error = %e, consecutive = state.consecutive_errors, "poll failed");
            if state.consecutive_errors >= settings.max_consecutive_errors {
                if state.connection_status != ConnectionStatus::Disconnected {
                    state.connection_status = ConnectionStatus::Disconnected;
                    subscribers.field("connectionStatus", serde_json::json!("disconnected"));
                }
            } else if state.connection_status == ConnectionStatus::Connected {
                state.connection_status = ConnectionStatus::Error;
                subscribers.field("connectionStatus", serde_json::json!("error"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scpi_generic::ScpiGenericDriver;
    use crate::driver::profile::RIGOL_DL3021;
    use crate::transport::mock::MockTransport;

    fn idle_mock() -> MockTransport {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DL3021,DL3A1,00.01");
        t.set_response(":FUNC?", "CURR");
        t.set_response(":SOUR:CURR:LEV:IMM?", "1.500000");
        t.set_response(":SOUR:VOLT:LEV:IMM?", "12.000000");
        t.set_response(":SOUR:INP:STAT?", "1");
        t.set_response(":MEAS:VOLT?", "12.000000");
        t.set_response(":MEAS:CURR?", "1.500000");
        t.set_response(":MEAS:POW?", "18.000000");
        t
    }

    async fn spawn_test_session() -> DeviceHandle {
        let mut driver = ScpiGenericDriver::new(idle_mock(), &RIGOL_DL3021);
        driver.probe().await.unwrap();
        let mut settings = SessionSettings::default();
        settings.poll_interval_ms = 30_000; // keep the poll loop out of the way of these tests
        spawn(Box::new(driver), settings)
    }

    #[tokio::test]
    async fn immediate_set_value_applies_without_waiting() {
        let handle = spawn_test_session().await;
        handle.set_value("current", 2.0, true).await.unwrap();
        let snap = handle.snapshot().await;
        assert_eq!(snap.setpoints.get("current"), Some(&2.0));
    }

    #[tokio::test]
    async fn debounced_set_value_coalesces_rapid_edits() {
        let handle = spawn_test_session().await;
        handle.set_value("current", 1.0, false).await.unwrap();
        handle.set_value("current", 2.0, false).await.unwrap();
        handle.set_value("current", 3.0, false).await.unwrap();
        // Displayed value is optimistic immediately, even before the debounce fires.
        let snap = handle.snapshot().await;
        assert_eq!(snap.setpoints.get("current"), Some(&3.0));
        tokio::time::sleep(Duration::from_millis(250)).await;
        let snap = handle.snapshot().await;
        assert_eq!(snap.setpoints.get("current"), Some(&3.0));
    }
}

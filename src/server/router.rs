//! Request dispatcher: translates a [`ClientRequest`] into
//! calls against the session manager, sequence engine, and trigger engine,
//! and turns the result into zero or more [`ServerEvent`]s. One [`Router`]
//! is shared by every connected client; per-client subscription state lives
//! in the outer transport layer, which owns an `mpsc::Sender<ServerEvent>`
//! per client and a [`ClientId`] to pass into `handle`.

use super::protocol::{ClientRequest, DeviceState, ScopeState, ServerEvent, SessionState};
use super::store::{DeviceAlias, KeyValueStore, StoreError};
use crate::config::SequenceSettings;
use crate::driver::DriverError;
use crate::error::SemanticError;
use crate::session::manager::{ManagerError, SessionManager};
use crate::session::scope::ScopeSnapshot;
use crate::session::device::DeviceSnapshot;
use crate::session::{ClientId, SessionEvent};
use crate::sequence::{SequenceError, SequenceHandle};
use crate::trigger::{TriggerError, TriggerHandle, TriggerScript};
use base64::Engine;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One request's outcome: any events produced, in send order.
pub type DispatchResult = Result<Vec<ServerEvent>, ServerEvent>;

/// Shared dispatcher wired to the three engines and the persistent stores.
#[derive(Clone)]
pub struct Router {
    sessions: SessionManager,
    sequences: SequenceHandle,
    triggers: TriggerHandle,
    sequence_store: Arc<dyn KeyValueStore<crate::sequence::SequenceDefinition>>,
    trigger_store: Arc<dyn KeyValueStore<TriggerScript>>,
    alias_store: Arc<dyn KeyValueStore<DeviceAlias>>,
    limits: SequenceSettings,
}

impl Router {
    /// Wires a router over already-constructed engines and stores.
    pub fn new(
        sessions: SessionManager,
        sequences: SequenceHandle,
        triggers: TriggerHandle,
        sequence_store: Arc<dyn KeyValueStore<crate::sequence::SequenceDefinition>>,
        trigger_store: Arc<dyn KeyValueStore<TriggerScript>>,
        alias_store: Arc<dyn KeyValueStore<DeviceAlias>>,
        limits: SequenceSettings,
    ) -> Self {
        Self { sessions, sequences, triggers, sequence_store, trigger_store, alias_store, limits }
    }

    /// Registers `client_id`'s outbound channel to receive the engine-level
    /// broadcasts (sequence/trigger events), independent of any per-device
    /// subscription. The transport layer calls this once per connection.
    pub fn spawn_engine_forwarders(&self, _client_id: ClientId, out: mpsc::Sender<ServerEvent>) {
        let mut seq_rx = self.sequences.subscribe();
        let seq_out = out.clone();
        tokio::spawn(async move {
            while let Ok(event) = seq_rx.recv().await {
                if seq_out.send(ServerEvent::from_sequence_event(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut trig_rx = self.triggers.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = trig_rx.recv().await {
                if out.send(ServerEvent::from_trigger_event(event)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Dispatches one request, returning the events to send back to the
    /// requesting client (subscription forwarders deliver everything else).
    pub async fn handle(
        &self,
        client_id: ClientId,
        request: ClientRequest,
        subscriber_out: &mpsc::Sender<SessionEvent>,
    ) -> DispatchResult {
        match request {
            ClientRequest::GetDevices => {
                let devices = self.sessions.list_devices().await;
                Ok(vec![ServerEvent::DeviceList { devices }])
            }
            ClientRequest::Scan => {
                // Re-enumerating serial/USB-TMC candidates is transport-specific
                // and happens at startup (see `main.rs`); a request-time rescan
                // just re-reports the currently registered sessions.
                let devices = self.sessions.list_devices().await;
                Ok(vec![ServerEvent::DeviceList { devices }])
            }
            ClientRequest::Subscribe { device_id } => {
                self.sessions
                    .subscribe(&device_id, client_id, subscriber_out.clone())
                    .await
                    .map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                let state = self.session_state(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                Ok(vec![ServerEvent::Subscribed { device_id, state }])
            }
            ClientRequest::Unsubscribe { device_id } => {
                self.sessions.unsubscribe(&device_id, client_id).await;
                Ok(vec![ServerEvent::Unsubscribed { device_id }])
            }
            ClientRequest::Reconnect { device_id } => {
                self.sessions.reconnect(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                Ok(vec![])
            }
            ClientRequest::SetMode { device_id, mode } => {
                self.sessions.set_mode(&device_id, &mode).await.map_err(|e| manager_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::SetOutput { device_id, enabled } => {
                self.sessions.set_output(&device_id, enabled).await.map_err(|e| manager_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::SetValue { device_id, name, value, immediate } => {
                self.sessions
                    .set_value(&device_id, &name, value, immediate)
                    .await
                    .map_err(|e| manager_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::ScopeRun { device_id } => self.with_scope(&device_id, |h| async move { h.run().await }).await,
            ClientRequest::ScopeStop { device_id } => self.with_scope(&device_id, |h| async move { h.stop().await }).await,
            ClientRequest::ScopeSingle { device_id } => self.with_scope(&device_id, |h| async move { h.single().await }).await,
            ClientRequest::ScopeAutoSetup { device_id } => self.with_scope(&device_id, |h| async move { h.auto_setup().await }).await,
            ClientRequest::ScopeForceTrigger { device_id } => {
                self.with_scope(&device_id, |h| async move { h.force_trigger().await }).await
            }
            ClientRequest::ScopeGetWaveform { device_id, channel, start, count } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                let waveform = scope
                    .get_waveform(channel.clone(), start, count)
                    .await
                    .map_err(|e| driver_error_event(Some(device_id.clone()), e))?;
                Ok(vec![ServerEvent::ScopeWaveform { device_id, channel, waveform }])
            }
            ClientRequest::ScopeGetScreenshot { device_id } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                let png = scope.get_screenshot().await.map_err(|e| driver_error_event(Some(device_id.clone()), e))?;
                let data = base64::engine::general_purpose::STANDARD.encode(png);
                Ok(vec![ServerEvent::ScopeScreenshot { device_id, data }])
            }
            ClientRequest::ScopeGetMeasurement { device_id, channel, measurement_type } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                let waveform = scope
                    .get_waveform(channel.clone(), None, None)
                    .await
                    .map_err(|e| driver_error_event(Some(device_id.clone()), e))?;
                let value = crate::session::measure::compute(
                    &measurement_type,
                    &waveform.points,
                    waveform.x_increment,
                    4096,
                )
                .value();
                Ok(vec![ServerEvent::ScopeMeasurement { device_id, channel, measurement_type, value }])
            }
            ClientRequest::ScopeSetChannelParam { device_id, channel, param } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                scope.set_channel_param(channel, param).await.map_err(|e| driver_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::ScopeSetTimebaseParam { device_id, param } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                scope.set_timebase_param(param).await.map_err(|e| driver_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::ScopeSetTriggerParam { device_id, param } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                scope.set_trigger_param(param).await.map_err(|e| driver_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::ScopeStartStreaming { device_id, channels, interval_ms, measurements } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                scope
                    .start_streaming(channels, measurements, interval_ms)
                    .await
                    .map_err(|e| driver_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::ScopeStopStreaming { device_id } => {
                let scope = self.sessions.scope(&device_id).await.map_err(|e| manager_error_event(Some(device_id.clone()), e))?;
                scope.stop_streaming().await.map_err(|e| driver_error_event(Some(device_id), e))?;
                Ok(vec![])
            }
            ClientRequest::SequenceLibraryList => {
                let sequences = self.sequence_store.list().await.map_err(store_error_event)?;
                Ok(vec![ServerEvent::SequenceLibraryList { sequences }])
            }
            ClientRequest::SequenceLibrarySave { definition } => {
                self.validate_sequence_name(&definition.name)?;
                definition.validate(&self.limits).map_err(sequence_error_event)?;
                self.check_sequence_library_room(&definition.id).await?;
                self.sequence_store.set(definition).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::SequenceLibraryUpdate { definition } => {
                self.validate_sequence_name(&definition.name)?;
                definition.validate(&self.limits).map_err(sequence_error_event)?;
                self.sequence_store.set(definition).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::SequenceLibraryDelete { id } => {
                self.sequence_store.delete(&id).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::SequenceRun { request } => {
                let definition = self
                    .sequence_store
                    .get(&request.sequence_id)
                    .await
                    .map_err(store_error_event)?
                    .ok_or_else(|| sequence_error_event(SequenceError::UnknownSequence(request.sequence_id.clone())))?;
                self.sequences.run(request, definition).await.map_err(sequence_error_event)?;
                Ok(vec![])
            }
            ClientRequest::SequenceAbort => {
                self.sequences.abort().await.map_err(sequence_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptLibraryList => {
                let scripts = self.trigger_store.list().await.map_err(store_error_event)?;
                Ok(vec![ServerEvent::TriggerScriptLibraryList { scripts }])
            }
            ClientRequest::TriggerScriptLibrarySave { script } => {
                script.validate().map_err(trigger_error_event)?;
                self.check_trigger_library_room(&script.id).await?;
                self.trigger_store.set(script).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptLibraryUpdate { script } => {
                script.validate().map_err(trigger_error_event)?;
                self.trigger_store.set(script).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptLibraryDelete { id } => {
                self.trigger_store.delete(&id).await.map_err(store_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptRun { script_id } => {
                let script = self
                    .trigger_store
                    .get(&script_id)
                    .await
                    .map_err(store_error_event)?
                    .ok_or_else(|| trigger_error_event(TriggerError::UnknownScript(script_id.clone())))?;
                self.triggers.run(script).await.map_err(trigger_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptStop => {
                self.triggers.stop().await.map_err(trigger_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptPause => {
                self.triggers.pause().await.map_err(trigger_error_event)?;
                Ok(vec![])
            }
            ClientRequest::TriggerScriptResume => {
                self.triggers.resume().await.map_err(trigger_error_event)?;
                Ok(vec![])
            }
        }
    }

    async fn with_scope<F, Fut>(&self, device_id: &str, call: F) -> DispatchResult
    where
        F: FnOnce(crate::session::scope::ScopeHandle) -> Fut,
        Fut: std::future::Future<Output = Result<(), DriverError>>,
    {
        let scope = self.sessions.scope(device_id).await.map_err(|e| manager_error_event(Some(device_id.to_string()), e))?;
        call(scope).await.map_err(|e| driver_error_event(Some(device_id.to_string()), e))?;
        Ok(vec![])
    }

    async fn session_state(&self, device_id: &str) -> Result<SessionState, ManagerError> {
        match self.sessions.kind_of(device_id).await {
            Some(crate::driver::InstrumentKind::Oscilloscope) => {
                let scope = self.sessions.scope(device_id).await?;
                let snap: ScopeSnapshot = scope.snapshot().await;
                Ok(SessionState::Scope(ScopeState::from(snap)))
            }
            Some(_) => {
                let device = self.sessions.device(device_id).await?;
                let snap: DeviceSnapshot = device.snapshot().await;
                let history = device.history().await;
                Ok(SessionState::Device(DeviceState::from_snapshot(snap, history)))
            }
            None => Err(ManagerError::UnknownDevice(device_id.to_string())),
        }
    }

    fn validate_sequence_name(&self, name: &str) -> Result<(), ServerEvent> {
        if name.len() > self.limits.max_name_len {
            return Err(sequence_error_event(SequenceError::ScriptValidationFailed {
                field: "name".to_string(),
                reason: format!("exceeds {} characters", self.limits.max_name_len),
            }));
        }
        Ok(())
    }

    async fn check_sequence_library_room(&self, id: &str) -> Result<(), ServerEvent> {
        let existing = self.sequence_store.list().await.map_err(store_error_event)?;
        if existing.len() >= self.limits.max_library_size && !existing.iter().any(|d| d.id == id) {
            return Err(sequence_error_event(SequenceError::LibraryFull));
        }
        Ok(())
    }

    async fn check_trigger_library_room(&self, id: &str) -> Result<(), ServerEvent> {
        let existing = self.trigger_store.list().await.map_err(store_error_event)?;
        if existing.len() >= self.limits.max_library_size && !existing.iter().any(|s| s.id == id) {
            return Err(trigger_error_event(TriggerError::LibraryFull));
        }
        Ok(())
    }

    /// Saves or renames a device's display alias.
    pub async fn set_alias(&self, device_id: &str, alias: &str) -> Result<(), StoreError> {
        self.alias_store.set(DeviceAlias { device_id: device_id.to_string(), alias: alias.to_string() }).await
    }

    /// The current device-id-to-alias table.
    pub async fn list_aliases(&self) -> Result<Vec<DeviceAlias>, StoreError> {
        self.alias_store.list().await
    }
}

fn manager_error_event(device_id: Option<String>, e: ManagerError) -> ServerEvent {
    match e {
        ManagerError::UnknownDevice(id) => ServerEvent::error(device_id, SemanticError::UnknownDevice(id.clone()).code(), SemanticError::UnknownDevice(id).to_string()),
        ManagerError::WrongSessionKind(id) => ServerEvent::error(device_id, "WRONG_SESSION_KIND", format!("{id} is not the expected session kind")),
        ManagerError::Driver(e) => driver_error_event(device_id, e),
    }
}

fn driver_error_event(device_id: Option<String>, e: DriverError) -> ServerEvent {
    let code = match &e {
        DriverError::Transport(_) => "TRANSPORT_ERROR",
        DriverError::Protocol(_) => "PROTOCOL_ERROR",
        DriverError::UnknownField(_) => "UNKNOWN_FIELD",
        DriverError::NotSupported(_) => "NOT_IMPLEMENTED",
    };
    ServerEvent::error(device_id, code, e.to_string())
}

fn sequence_error_event(e: SequenceError) -> ServerEvent {
    let code = match &e {
        SequenceError::LibraryFull => "LIBRARY_FULL",
        SequenceError::ScriptValidationFailed { .. } => "VALIDATION_FAILED",
        SequenceError::NoActiveSequence => "NO_ACTIVE_SEQUENCE",
        SequenceError::Session(_) => "SESSION_ERROR",
        SequenceError::UnknownSequence(_) => "UNKNOWN_SEQUENCE",
    };
    ServerEvent::error(None, code, e.to_string())
}

fn trigger_error_event(e: TriggerError) -> ServerEvent {
    let code = match &e {
        TriggerError::LibraryFull => "LIBRARY_FULL",
        TriggerError::ScriptValidationFailed { .. } => "VALIDATION_FAILED",
        TriggerError::NoActiveScript => "NO_ACTIVE_SCRIPT",
        TriggerError::Session(_) => "SESSION_ERROR",
        TriggerError::UnknownScript(_) => "UNKNOWN_SCRIPT",
    };
    ServerEvent::error(None, code, e.to_string())
}

fn store_error_event(e: StoreError) -> ServerEvent {
    warn!(error = %e, "persistent store operation failed");
    ServerEvent::error(None, "STORE_ERROR", e.to_string())
}

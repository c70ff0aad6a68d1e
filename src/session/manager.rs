//! Session manager: the live registry of instrument sessions.
//!
//! A shared map from device id to session handle, but it never removes an
//! entry on driver loss: a session that stops responding parks itself at
//! `disconnected` (handled inside [`super::device`]/[`super::scope`]) and
//! stays in the registry until an explicit `reconnect`.

use crate::driver::registry::Scanner;
use crate::driver::scope::ScopeDriver;
use crate::driver::{Driver, DriverError, InstrumentInfo, InstrumentKind};
use crate::session::device::{self, DeviceHandle};
use crate::session::scope::{self, ScopeHandle};
use crate::session::{ClientId, ConnectionStatus, DeviceSummary, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;

/// Failures raised when a request names a session that doesn't exist or
/// targets the wrong session kind.
#[derive(Error, Debug, Clone)]
pub enum ManagerError {
    /// No session is registered under this id.
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    /// The id names a session of the wrong kind for this operation
    /// (e.g. a `setValue` aimed at an oscilloscope session).
    #[error("{0} is not a PSU/load session")]
    WrongSessionKind(String),
    /// The underlying driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

enum Entry {
    Device(DeviceHandle),
    Scope(ScopeHandle),
}

struct Registry {
    entries: HashMap<String, Entry>,
}

/// Broadcast to all connected clients on every registry change, regardless
/// of per-device subscription.
#[derive(Debug, Clone)]
pub struct DeviceListEvent {
    /// Current device summaries, in registration order is not guaranteed.
    pub devices: Vec<DeviceSummary>,
}

/// Cheap-to-clone shared handle onto the session registry.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<RwLock<Registry>>,
    device_list: broadcast::Sender<DeviceListEvent>,
    scanner: Arc<Scanner>,
}

impl SessionManager {
    /// Builds an empty manager.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            registry: Arc::new(RwLock::new(Registry { entries: HashMap::new() })),
            device_list: tx,
            scanner: Arc::new(Scanner::new()),
        }
    }

    /// Subscribes to the global device-list stream.
    pub fn subscribe_device_list(&self) -> broadcast::Receiver<DeviceListEvent> {
        self.device_list.subscribe()
    }

    /// The scanner this manager uses to probe new candidate interfaces.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Registers an already-probed PSU/load driver, spawning its session
    /// actor and broadcasting the updated device list.
    pub async fn register_device(&self, driver: Box<dyn Driver>, settings: crate::config::SessionSettings) -> String {
        let id = driver.info().id.clone();
        let handle = device::spawn(driver, settings);
        self.registry.write().await.entries.insert(id.clone(), Entry::Device(handle));
        info!(device = %id, "registered device session");
        self.broadcast_device_list().await;
        id
    }

    /// Registers an already-probed oscilloscope driver, spawning its session
    /// actor and broadcasting the updated device list.
    pub async fn register_scope(&self, driver: Box<dyn ScopeDriver>, settings: crate::config::ScopeSettings) -> String {
        let id = driver.info().id.clone();
        let handle = scope::spawn(driver, settings);
        self.registry.write().await.entries.insert(id.clone(), Entry::Scope(handle));
        info!(device = %id, "registered scope session");
        self.broadcast_device_list().await;
        id
    }

    async fn broadcast_device_list(&self) {
        let devices = self.list_devices().await;
        let _ = self.device_list.send(DeviceListEvent { devices });
    }

    /// Summaries of every registered session, for the `deviceList` event.
    pub async fn list_devices(&self) -> Vec<DeviceSummary> {
        let registry = self.registry.read().await;
        let mut out = Vec::with_capacity(registry.entries.len());
        for entry in registry.entries.values() {
            out.push(match entry {
                Entry::Device(h) => {
                    let snap = h.snapshot().await;
                    DeviceSummary { info: snap.info, connection_status: snap.connection_status }
                }
                Entry::Scope(h) => {
                    let snap = h.snapshot().await;
                    DeviceSummary { info: snap.info, connection_status: snap.connection_status }
                }
            });
        }
        out
    }

    fn device_handle<'a>(entry: Option<&'a Entry>, id: &str) -> Result<&'a DeviceHandle, ManagerError> {
        match entry {
            Some(Entry::Device(h)) => Ok(h),
            Some(Entry::Scope(_)) => Err(ManagerError::WrongSessionKind(id.to_string())),
            None => Err(ManagerError::UnknownDevice(id.to_string())),
        }
    }

    fn scope_handle<'a>(entry: Option<&'a Entry>, id: &str) -> Result<&'a ScopeHandle, ManagerError> {
        match entry {
            Some(Entry::Scope(h)) => Ok(h),
            Some(Entry::Device(_)) => Err(ManagerError::WrongSessionKind(id.to_string())),
            None => Err(ManagerError::UnknownDevice(id.to_string())),
        }
    }

    /// Looks up a PSU/load session handle by device id.
    pub async fn device(&self, id: &str) -> Result<DeviceHandle, ManagerError> {
        let registry = self.registry.read().await;
        Self::device_handle(registry.entries.get(id), id).cloned()
    }

    /// Looks up an oscilloscope session handle by device id.
    pub async fn scope(&self, id: &str) -> Result<ScopeHandle, ManagerError> {
        let registry = self.registry.read().await;
        Self::scope_handle(registry.entries.get(id), id).cloned()
    }

    /// Commands a setpoint write on a PSU/load session.
    pub async fn set_value(&self, device_id: &str, field: &str, value: f64, immediate: bool) -> Result<(), ManagerError> {
        let handle = self.device(device_id).await?;
        handle.set_value(field, value, immediate).await.map_err(ManagerError::from)
    }

    /// Commands an output enable/disable on a PSU/load session.
    pub async fn set_output(&self, device_id: &str, enabled: bool) -> Result<(), ManagerError> {
        let handle = self.device(device_id).await?;
        handle.set_output(enabled).await.map_err(ManagerError::from)
    }

    /// Commands a mode change on a PSU/load session.
    pub async fn set_mode(&self, device_id: &str, mode: &str) -> Result<(), ManagerError> {
        let handle = self.device(device_id).await?;
        handle.set_mode(mode).await.map_err(ManagerError::from)
    }

    /// Subscribes `client_id` to a device's (PSU/load or oscilloscope)
    /// session events.
    pub async fn subscribe(&self, device_id: &str, client_id: ClientId, sender: mpsc::Sender<SessionEvent>) -> Result<(), ManagerError> {
        let registry = self.registry.read().await;
        match registry.entries.get(device_id) {
            Some(Entry::Device(h)) => {
                h.subscribe(client_id, sender).await;
                Ok(())
            }
            Some(Entry::Scope(h)) => {
                h.subscribe(client_id, sender).await;
                Ok(())
            }
            None => Err(ManagerError::UnknownDevice(device_id.to_string())),
        }
    }

    /// Removes a subscriber from a device's session events.
    pub async fn unsubscribe(&self, device_id: &str, client_id: ClientId) {
        let registry = self.registry.read().await;
        match registry.entries.get(device_id) {
            Some(Entry::Device(h)) => h.unsubscribe(client_id).await,
            Some(Entry::Scope(h)) => h.unsubscribe(client_id).await,
            None => {}
        }
    }

    /// Dispatches a reconnect request to the session whose cached identity
    /// matches `device_id`.
    pub async fn reconnect(&self, device_id: &str) -> Result<(), ManagerError> {
        let registry = self.registry.read().await;
        match registry.entries.get(device_id) {
            Some(Entry::Device(h)) => h.reconnect().await.map_err(ManagerError::from),
            Some(Entry::Scope(h)) => h.reconnect().await.map_err(ManagerError::from),
            None => Err(ManagerError::UnknownDevice(device_id.to_string())),
        }
    }

    /// The declared kind of a registered session, if any.
    pub async fn kind_of(&self, device_id: &str) -> Option<InstrumentKind> {
        let registry = self.registry.read().await;
        match registry.entries.get(device_id)? {
            Entry::Device(h) => Some(h.snapshot().await.info.kind),
            Entry::Scope(h) => Some(h.snapshot().await.info.kind),
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

// InstrumentInfo/ConnectionStatus only referenced through DeviceSummary above;
// kept as explicit imports for documentation clarity in rustdoc output.
#[allow(unused_imports)]
use InstrumentInfo as _InstrumentInfoDoc;
#[allow(unused_imports)]
use ConnectionStatus as _ConnectionStatusDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::profile::RIGOL_DL3021;
    use crate::driver::scpi_generic::ScpiGenericDriver;
    use crate::transport::mock::MockTransport;

    fn idle_mock() -> MockTransport {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DL3021,DL3A1,00.01");
        t.set_response(":FUNC?", "CURR");
        t.set_response(":SOUR:CURR:LEV:IMM?", "1.000000");
        t.set_response(":SOUR:VOLT:LEV:IMM?", "12.000000");
        t.set_response(":SOUR:INP:STAT?", "1");
        t.set_response(":MEAS:VOLT?", "12.000000");
        t.set_response(":MEAS:CURR?", "1.000000");
        t.set_response(":MEAS:POW?", "12.000000");
        t
    }

    #[tokio::test]
    async fn register_and_lookup_device_round_trips() {
        let manager = SessionManager::new();
        let mut driver = ScpiGenericDriver::new(idle_mock(), &RIGOL_DL3021);
        driver.probe().await.unwrap();
        let id = manager.register_device(Box::new(driver), crate::config::SessionSettings::default()).await;
        assert!(manager.device(&id).await.is_ok());
        assert_eq!(manager.list_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_returns_unknown_device_error() {
        let manager = SessionManager::new();
        let err = manager.set_value("nope", "current", 1.0, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn set_value_on_scope_session_is_wrong_kind() {
        let manager = SessionManager::new();
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "RIGOL TECHNOLOGIES,DS1054Z,DS1ZA1,00.01");
        let caps = crate::driver::scope::ScopeCapabilities {
            channels: 1,
            bandwidth: 1.0,
            max_sample_rate: 1.0,
            max_memory_depth: 1,
            supported_measurements: vec![],
            has_awg: false,
        };
        let mut driver = crate::driver::scope::GenericScpiScope::new(t, caps);
        driver.probe().await.unwrap();
        let id = manager.register_scope(Box::new(driver), crate::config::ScopeSettings::default()).await;
        let err = manager.set_value(&id, "current", 1.0, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::WrongSessionKind(_)));
    }
}

//! Session layer: per-instrument state machines that
//! poll, debounce, reconcile optimistic user edits with device truth, and
//! survive physical disconnects without losing subscribers.
//!
//! Each session is a Tokio task ("actor") that exclusively owns one driver
//! handle and receives commands over a bounded `mpsc` channel: a command
//! enum per session kind, a single task holding the driver, no lock ever
//! held across an `.await`. Subscribers never see the session itself, only
//! a [`ClientId`] and an outbound channel.

pub mod device;
pub mod manager;
mod measure;
pub mod scope;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque subscriber identity.
pub type ClientId = u64;

/// Connection state machine: `disconnected` is terminal until
/// an explicit `reconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Driver responding normally.
    Connected,
    /// `N` consecutive poll failures, `N` below the session's budget.
    Error,
    /// Poll-failure budget exceeded; terminal until `reconnect`.
    Disconnected,
}

/// Bounded per-client outbound queue capacity.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Sends `event` to `sender` without ever blocking the caller — a full
/// queue drops the newest event for that one slow client rather than
/// backpressuring the whole session.
pub fn fanout_try_send<T>(sender: &tokio::sync::mpsc::Sender<T>, event: T) {
    if sender.try_send(event).is_err() {
        tracing::debug!("subscriber queue full, dropping newest event for a slow client");
    }
}

/// A lightweight device summary for the `deviceList` event: info + capabilities description +
/// connection status only, deliberately excluding the full live state so
/// the broadcast sent on every registry change stays small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Canonical instrument identity.
    pub info: crate::driver::InstrumentInfo,
    /// Current connection status.
    pub connection_status: ConnectionStatus,
}

/// One sampled measurement update, as broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementUpdate {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Measurement values by name; `None` for an invalid/sentinel reading.
    pub measurements: std::collections::HashMap<String, Option<f64>>,
}

/// Event a session broadcasts to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// A single scalar field changed (`mode`, `outputEnabled`, `connectionStatus`, …).
    #[serde(rename = "field")]
    Field {
        /// Field name.
        field: String,
        /// New value, already JSON-shaped.
        value: serde_json::Value,
    },
    /// A new measurement sample.
    #[serde(rename = "measurement")]
    Measurement {
        /// The sampled update.
        update: MeasurementUpdate,
    },
}

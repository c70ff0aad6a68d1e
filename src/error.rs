//! Crate-wide error taxonomy.
//!
//! Each concern (transport, protocol parsing, probing, session/engine
//! semantics) gets its own `thiserror` enum living in its own module
//! (`transport::TransportError`, `scpi::ScpiError`, `driver::ProbeError`,
//! `sequence::SequenceError`, `trigger::TriggerError`). This module holds the
//! error kinds shared across more than one of those modules — the "semantic"
//! and "concurrency" kinds from the error taxonomy that surface
//! directly to clients as `error` events with a stable machine-readable code.

use thiserror::Error;

/// Semantic and concurrency errors surfaced to clients as `error` events.
///
/// Transport and parse errors are deliberately excluded here: they are never
/// propagated to clients raw, only swallowed into a session's
/// `connectionStatus` state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SemanticError {
    /// A request named a `deviceId` with no matching session.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// A request named a setpoint/measurement field the driver doesn't declare.
    #[error("unknown field '{field}' on device {device_id}")]
    UnknownField {
        /// Device the field was requested on.
        device_id: String,
        /// The unrecognized field name.
        field: String,
    },

    /// A requested value fell outside the field's declared `[min, max]`.
    #[error("value out of range for '{field}': {value} not in [{min}, {max}]")]
    OutOfRange {
        /// Field the value was rejected for.
        field: String,
        /// The rejected value.
        value: f64,
        /// Declared minimum.
        min: f64,
        /// Declared maximum.
        max: f64,
    },

    /// A request named an operation the driver family doesn't support.
    #[error("operation not implemented: {0}")]
    NotImplemented(String),

    /// The session has been stopped and refuses new operations.
    #[error("session for {0} has been stopped")]
    SessionStopped(String),

    /// A reconnect was requested while one was already in progress.
    #[error("reconnect already in progress for {0}")]
    ReconnectInProgress(String),
}

impl SemanticError {
    /// The stable `code` string sent on the wire (the taxonomy variant name).
    pub fn code(&self) -> &'static str {
        match self {
            SemanticError::UnknownDevice(_) => "DEVICE_NOT_FOUND",
            SemanticError::UnknownField { .. } => "UNKNOWN_FIELD",
            SemanticError::OutOfRange { .. } => "OUT_OF_RANGE",
            SemanticError::NotImplemented(_) => "NOT_IMPLEMENTED",
            SemanticError::SessionStopped(_) => "SESSION_STOPPED",
            SemanticError::ReconnectInProgress(_) => "RECONNECT_IN_PROGRESS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_taxonomy_names() {
        assert_eq!(
            SemanticError::UnknownDevice("x".into()).code(),
            "DEVICE_NOT_FOUND"
        );
        assert_eq!(
            SemanticError::OutOfRange {
                field: "voltage".into(),
                value: 99.0,
                min: 0.0,
                max: 30.0
            }
            .code(),
            "OUT_OF_RANGE"
        );
    }
}

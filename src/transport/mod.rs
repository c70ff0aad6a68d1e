//! Transport layer: the abstract command/response channel every driver
//! speaks SCPI text and binary blocks over.
//!
//! A `Transport` is one logical channel and is **not** thread-safe: callers
//! (drivers) must serialize all calls against a given instance themselves.
//! The contract is narrowed to the four operations a SCPI driver actually
//! needs: write a command, read a line, read a fixed-length block, and
//! probe liveness.

#[cfg(feature = "transport_serial")]
pub mod serial;
#[cfg(feature = "transport_usbtmc")]
pub mod usbtmc;

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failure kinds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No response arrived before the configured timeout.
    #[error("timeout waiting for response")]
    Timeout,
    /// A lower-level I/O failure (port closed, bus reset, …).
    #[error("io error: {0}")]
    Io(String),
    /// The underlying device is no longer present.
    #[error("device not present")]
    NoDevice,
    /// USB-TMC endpoint returned `LIBUSB_ERROR_PIPE`.
    #[error("usb pipe stall")]
    Pipe,
    /// The response didn't match the expected framing (missing terminator, bad TMC header).
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),
    /// The terminator was never observed within the read timeout.
    #[error("terminator not observed before timeout")]
    TerminatorTimeout,
}

impl TransportError {
    /// Whether this failure is evidence the device has gone away, per the
    /// session-layer disconnection heuristic: `NoDevice`,
    /// `Io`, and `Pipe` count; `Timeout`/`ProtocolFraming`/`TerminatorTimeout` do not
    /// by themselves (a slow-but-present device still answers eventually).
    pub fn is_disconnection_evidence(&self) -> bool {
        matches!(
            self,
            TransportError::NoDevice | TransportError::Io(_) | TransportError::Pipe
        )
    }
}

/// One logical, non-thread-safe command/response channel to an instrument.
///
/// `open`/`close` are idempotent. `query` strips the configured terminator
/// from the response. `query_binary` hands back the raw bytes the codec
/// layer is responsible for interpreting as a definite-length block.
#[async_trait]
pub trait Transport: Send {
    /// Opens the channel. Calling `open` on an already-open transport succeeds with no effect.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Closes the channel. Calling `close` on an already-closed transport succeeds with no effect.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Writes `cmd` plus the transport's terminator, reads until the next
    /// terminator, and returns the payload with the terminator stripped.
    async fn query(&mut self, cmd: &str) -> Result<String, TransportError>;

    /// Writes `cmd` and reads a raw byte buffer rather than a terminated text line.
    async fn query_binary(&mut self, cmd: &str) -> Result<Vec<u8>, TransportError>;

    /// Writes `cmd` plus the transport's terminator. Fire-and-forget, but
    /// must flush the underlying channel before returning.
    async fn write(&mut self, cmd: &str) -> Result<(), TransportError>;
}

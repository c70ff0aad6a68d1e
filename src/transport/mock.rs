//! An in-memory [`Transport`] for driver/session tests.
//!
//! Responses are programmed per-command; commands with no programmed
//! response return [`TransportError::ProtocolFraming`] so a test notices an
//! unexpected query immediately rather than silently returning garbage.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};

/// A scripted failure to return instead of (or before) the next programmed response.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Fail the next `query`/`query_binary`/`write` call with this error.
    Fail(TransportError),
    /// Return this text response.
    Text(String),
    /// Return this binary response.
    Binary(Vec<u8>),
}

/// A mock transport whose responses are programmed in advance.
///
/// Two ways to program it: [`MockTransport::set_response`] for a fixed
/// request/response mapping (queried repeatedly), or
/// [`MockTransport::push_scripted`] for a one-shot queue consumed in FIFO
/// order regardless of the command text (used to script failure sequences
/// like "five consecutive `NoDevice` errors").
#[derive(Default)]
pub struct MockTransport {
    responses: HashMap<String, String>,
    binary_responses: HashMap<String, Vec<u8>>,
    scripted: VecDeque<Scripted>,
    is_open: bool,
    /// Every command written, in order — lets tests assert on exact wire traffic.
    pub written: Vec<String>,
}

impl MockTransport {
    /// Creates an empty mock transport (closed).
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs a fixed text response for an exact command string.
    pub fn set_response(&mut self, cmd: impl Into<String>, response: impl Into<String>) {
        self.responses.insert(cmd.into(), response.into());
    }

    /// Programs a fixed binary response for an exact command string.
    pub fn set_binary_response(&mut self, cmd: impl Into<String>, response: Vec<u8>) {
        self.binary_responses.insert(cmd.into(), response);
    }

    /// Pushes a one-shot scripted outcome consumed by the next `query`/`query_binary`/`write` call.
    pub fn push_scripted(&mut self, outcome: Scripted) {
        self.scripted.push_back(outcome);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.is_open = false;
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String, TransportError> {
        self.written.push(cmd.to_string());
        if let Some(scripted) = self.scripted.pop_front() {
            return match scripted {
                Scripted::Fail(e) => Err(e),
                Scripted::Text(t) => Ok(t),
                Scripted::Binary(_) => Err(TransportError::ProtocolFraming(
                    "scripted binary outcome used for text query".to_string(),
                )),
            };
        }
        self.responses
            .get(cmd)
            .cloned()
            .ok_or_else(|| TransportError::ProtocolFraming(format!("no response programmed for {cmd:?}")))
    }

    async fn query_binary(&mut self, cmd: &str) -> Result<Vec<u8>, TransportError> {
        self.written.push(cmd.to_string());
        if let Some(scripted) = self.scripted.pop_front() {
            return match scripted {
                Scripted::Fail(e) => Err(e),
                Scripted::Binary(b) => Ok(b),
                Scripted::Text(t) => Ok(t.into_bytes()),
            };
        }
        self.binary_responses
            .get(cmd)
            .cloned()
            .ok_or_else(|| TransportError::ProtocolFraming(format!("no binary response programmed for {cmd:?}")))
    }

    async fn write(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.written.push(cmd.to_string());
        if let Some(scripted) = self.scripted.pop_front() {
            return match scripted {
                Scripted::Fail(e) => Err(e),
                _ => Ok(()),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn programmed_response_is_returned_on_exact_match() {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "ACME,Model1,SN1,1.0");
        assert_eq!(t.query("*IDN?").await.unwrap(), "ACME,Model1,SN1,1.0");
    }

    #[tokio::test]
    async fn unprogrammed_command_fails_loudly() {
        let mut t = MockTransport::new();
        assert!(t.query("UNKNOWN?").await.is_err());
    }

    #[tokio::test]
    async fn scripted_queue_drains_fifo_before_fixed_responses() {
        let mut t = MockTransport::new();
        t.set_response("*IDN?", "fixed");
        t.push_scripted(Scripted::Fail(TransportError::NoDevice));
        assert!(matches!(t.query("*IDN?").await, Err(TransportError::NoDevice)));
        assert_eq!(t.query("*IDN?").await.unwrap(), "fixed");
    }

    #[tokio::test]
    async fn written_commands_are_recorded_in_order() {
        let mut t = MockTransport::new();
        t.set_response("A", "a");
        t.set_response("B", "b");
        let _ = t.query("A").await;
        let _ = t.write("B").await;
        assert_eq!(t.written, vec!["A".to_string(), "B".to_string()]);
    }
}

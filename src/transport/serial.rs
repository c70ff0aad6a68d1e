//! RS-232 serial transport, built on `serialport`: blocking I/O offloaded to
//! `spawn_blocking`, behind an `Arc<Mutex<_>>`-guarded port handle.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

/// RS-232 serial transport with a configurable per-command minimum delay:
/// the delay is measured from the last byte written to the first byte of
/// the *next* command, not from the response.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    terminator: String,
    /// Minimum spacing enforced between the end of one command's write and the start of the next.
    min_command_delay: Duration,
    last_write_finished_at: Option<Instant>,
    port: Option<Arc<Mutex<Box<dyn serialport::SerialPort>>>>,
}

impl SerialTransport {
    /// Builds a serial transport for `port_name` at `baud_rate`, unopened.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(2),
            terminator: "\n".to_string(),
            min_command_delay: Duration::from_millis(50),
            last_write_finished_at: None,
            port: None,
        }
    }

    /// Overrides the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the line terminator (default `"\n"`).
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    /// Overrides the per-command minimum delay.
    pub fn with_min_command_delay(mut self, delay: Duration) -> Self {
        self.min_command_delay = delay;
        self
    }

    async fn enforce_command_delay(&mut self) {
        if let Some(last) = self.last_write_finished_at {
            let elapsed = last.elapsed();
            if elapsed < self.min_command_delay {
                sleep(self.min_command_delay - elapsed).await;
            }
        }
    }

    async fn write_raw(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.enforce_command_delay().await;
        let port = self
            .port
            .as_ref()
            .ok_or(TransportError::NoDevice)?
            .clone();
        let line = format!("{cmd}{}", self.terminator);

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut guard = port.blocking_lock();
            guard
                .write_all(line.as_bytes())
                .map_err(|e| TransportError::Io(e.to_string()))?;
            guard.flush().map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))??;

        self.last_write_finished_at = Some(Instant::now());
        debug!(port = %self.port_name, cmd, "serial write");
        Ok(())
    }

    async fn read_until_terminator(&mut self) -> Result<String, TransportError> {
        let port = self
            .port
            .as_ref()
            .ok_or(TransportError::NoDevice)?
            .clone();
        let terminator = self.terminator.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
            let mut guard = port.blocking_lock();
            let term_byte = terminator.as_bytes().last().copied().unwrap_or(b'\n');
            let mut response = Vec::new();
            let mut buf = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(TransportError::TerminatorTimeout);
                }
                match guard.read(&mut buf) {
                    Ok(1) => {
                        response.push(buf[0]);
                        if buf[0] == term_byte {
                            break;
                        }
                    }
                    Ok(_) => return Err(TransportError::NoDevice),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(TransportError::Io(e.to_string())),
                }
            }
            let text = String::from_utf8_lossy(&response).trim_end_matches(&terminator).to_string();
            Ok(text)
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| TransportError::Io(e.to_string()))?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.port = None;
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String, TransportError> {
        self.write_raw(cmd).await?;
        self.read_until_terminator().await
    }

    async fn query_binary(&mut self, cmd: &str) -> Result<Vec<u8>, TransportError> {
        self.write_raw(cmd).await?;
        let port = self
            .port
            .as_ref()
            .ok_or(TransportError::NoDevice)?
            .clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TransportError> {
            let mut guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut buf = [0u8; 4096];
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(TransportError::Timeout);
                }
                match guard.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        response.extend_from_slice(&buf[..n]);
                        // A definite-length block is self-delimiting once the codec
                        // knows the declared length; here we simply drain whatever
                        // the port makes available within the read timeout window.
                        if guard.bytes_to_read().unwrap_or(0) == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        if !response.is_empty() {
                            break;
                        }
                        continue;
                    }
                    Err(e) => return Err(TransportError::Io(e.to_string())),
                }
            }
            Ok(response)
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    }

    async fn write(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.write_raw(cmd).await
    }
}

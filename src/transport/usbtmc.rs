//! USB-TMC (Test & Measurement Class) transport, built on `rusb`.
//!
//! Builds bulk-OUT TMC headers with a rotating `bTag` (1..255, skipping 0 —
//! 0 is reserved by the TMC spec) and matches it on the bulk-IN response.
//! `LIBUSB_ERROR_PIPE` triggers one `CLEAR_FEATURE` recovery and a single
//! retry; any other low-level failure is surfaced as
//! [`TransportError::Io`] or [`TransportError::NoDevice`] without retry.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const USBTMC_MSG_OUT: u8 = 1;
const USBTMC_MSG_IN: u8 = 2;
const DEV_DEP_MSG_OUT_HEADER_LEN: usize = 12;
const TRANSFER_CHUNK: usize = 4096;

/// A USB-TMC transport bound to a specific vendor/product/bus address.
pub struct UsbTmcTransport {
    vendor_id: u16,
    product_id: u16,
    timeout: Duration,
    next_tag: u8,
    handle: Option<Arc<rusb::DeviceHandle<rusb::GlobalContext>>>,
    out_endpoint: u8,
    in_endpoint: u8,
    interface: u8,
}

impl UsbTmcTransport {
    /// Builds a USB-TMC transport for the given vendor/product id, unopened.
    ///
    /// `out_endpoint`/`in_endpoint` are the bulk endpoint addresses
    /// discovered from the device's USB-TMC interface descriptor (bit 7 set
    /// on `in_endpoint` per the USB convention); `interface` is the TMC
    /// interface number to claim.
    pub fn new(vendor_id: u16, product_id: u16, interface: u8, out_endpoint: u8, in_endpoint: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            timeout: Duration::from_secs(5),
            next_tag: 1,
            handle: None,
            out_endpoint,
            in_endpoint,
            interface,
        }
    }

    /// Overrides the transport timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn next_btag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = if self.next_tag == 255 { 1 } else { self.next_tag + 1 };
        tag
    }

    fn handle(&self) -> Result<Arc<rusb::DeviceHandle<rusb::GlobalContext>>, TransportError> {
        self.handle.clone().ok_or(TransportError::NoDevice)
    }

    fn build_dev_dep_msg_out(tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEV_DEP_MSG_OUT_HEADER_LEN + payload.len());
        buf.push(USBTMC_MSG_OUT);
        buf.push(tag);
        buf.push(!tag);
        buf.push(0); // reserved
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(if eom { 1 } else { 0 });
        buf.extend_from_slice(&[0, 0, 0]); // reserved
        buf.extend_from_slice(payload);
        // Pad to a 4-byte boundary, per the TMC bulk transfer alignment rule.
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf
    }

    fn build_request_dev_dep_msg_in(tag: u8, max_len: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DEV_DEP_MSG_OUT_HEADER_LEN);
        buf.push(USBTMC_MSG_IN);
        buf.push(tag);
        buf.push(!tag);
        buf.push(0);
        buf.extend_from_slice(&max_len.to_le_bytes());
        buf.push(0); // TermCharEnabled
        buf.push(0); // TermChar
        buf.extend_from_slice(&[0, 0]); // reserved
        buf
    }

    fn bulk_write_sync(
        handle: &rusb::DeviceHandle<rusb::GlobalContext>,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match handle.write_bulk(endpoint, data, timeout) {
            Ok(_) => Ok(()),
            Err(rusb::Error::Pipe) => Err(TransportError::Pipe),
            Err(rusb::Error::Timeout) => Err(TransportError::Timeout),
            Err(rusb::Error::NoDevice) => Err(TransportError::NoDevice),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    fn bulk_read_sync(
        handle: &rusb::DeviceHandle<rusb::GlobalContext>,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        match handle.read_bulk(endpoint, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Pipe) => Err(TransportError::Pipe),
            Err(rusb::Error::Timeout) => Err(TransportError::Timeout),
            Err(rusb::Error::NoDevice) => Err(TransportError::NoDevice),
            Err(e) => Err(TransportError::Io(e.to_string())),
        }
    }

    /// Clears a stalled bulk endpoint, per the USB-TMC recovery procedure.
    fn clear_endpoint_halt_sync(
        handle: &rusb::DeviceHandle<rusb::GlobalContext>,
        endpoint: u8,
    ) -> Result<(), TransportError> {
        handle.clear_halt(endpoint).map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Runs `op`, and on a [`TransportError::Pipe`] clears the halt on
    /// `endpoint` and retries exactly once.
    fn with_pipe_retry_sync<T>(
        handle: &rusb::DeviceHandle<rusb::GlobalContext>,
        endpoint: u8,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        match op() {
            Err(TransportError::Pipe) => {
                Self::clear_endpoint_halt_sync(handle, endpoint)?;
                op()
            }
            other => other,
        }
    }

    /// Writes one command frame on a blocking thread, so a stalled device
    /// can't park the tokio worker running this session.
    async fn do_write(&mut self, cmd: &str) -> Result<(), TransportError> {
        let handle = self.handle()?;
        let tag = self.next_btag();
        let payload = cmd.as_bytes().to_vec();
        let out_endpoint = self.out_endpoint;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let frame = Self::build_dev_dep_msg_out(tag, &payload, true);
            Self::with_pipe_retry_sync(&handle, out_endpoint, || {
                Self::bulk_write_sync(&handle, out_endpoint, &frame, timeout)
            })
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    }

    /// Requests and reads a `DEV_DEP_MSG_IN` response on a blocking thread.
    async fn do_read_response(&mut self) -> Result<Vec<u8>, TransportError> {
        let handle = self.handle()?;
        let tag = self.next_btag();
        let out_endpoint = self.out_endpoint;
        let in_endpoint = self.in_endpoint;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TransportError> {
            let request = Self::build_request_dev_dep_msg_in(tag, TRANSFER_CHUNK as u32);
            Self::with_pipe_retry_sync(&handle, out_endpoint, || {
                Self::bulk_write_sync(&handle, out_endpoint, &request, timeout)
            })?;

            let mut response = Vec::new();
            loop {
                let mut chunk = vec![0u8; TRANSFER_CHUNK + DEV_DEP_MSG_OUT_HEADER_LEN];
                let n = Self::with_pipe_retry_sync(&handle, in_endpoint, || {
                    Self::bulk_read_sync(&handle, in_endpoint, &mut chunk, timeout)
                })?;
                if n < DEV_DEP_MSG_OUT_HEADER_LEN {
                    return Err(TransportError::ProtocolFraming(
                        "USB-TMC response shorter than header".to_string(),
                    ));
                }
                let msg_id = chunk[0];
                if msg_id != USBTMC_MSG_IN {
                    return Err(TransportError::ProtocolFraming(format!(
                        "unexpected MsgID {msg_id} in DEV_DEP_MSG_IN response"
                    )));
                }
                let resp_tag = chunk[1];
                if resp_tag != tag {
                    return Err(TransportError::ProtocolFraming(format!(
                        "bTag mismatch: sent {tag}, got {resp_tag}"
                    )));
                }
                let transfer_size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as usize;
                let eom = chunk[8] & 1 != 0;
                let data_start = DEV_DEP_MSG_OUT_HEADER_LEN;
                let data_end = (data_start + transfer_size).min(n);
                response.extend_from_slice(&chunk[data_start..data_end]);
                if eom {
                    break;
                }
            }
            Ok(response)
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    }
}

#[async_trait]
impl Transport for UsbTmcTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let vendor_id = self.vendor_id;
        let product_id = self.product_id;
        let interface = self.interface;
        let handle = tokio::task::spawn_blocking(move || -> Result<rusb::DeviceHandle<rusb::GlobalContext>, TransportError> {
            let handle = rusb::open_device_with_vid_pid(vendor_id, product_id)
                .ok_or(TransportError::NoDevice)?;
            handle
                .claim_interface(interface)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(handle)
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))??;

        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(handle) = self.handle.take() {
            let interface = self.interface;
            let _ = tokio::task::spawn_blocking(move || handle.release_interface(interface)).await;
        }
        Ok(())
    }

    async fn query(&mut self, cmd: &str) -> Result<String, TransportError> {
        let bytes = self.query_binary(cmd).await?;
        Ok(String::from_utf8_lossy(&bytes).trim_end_matches(['\n', '\r']).to_string())
    }

    async fn query_binary(&mut self, cmd: &str) -> Result<Vec<u8>, TransportError> {
        self.do_write(cmd).await?;
        self.do_read_response().await
    }

    async fn write(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.do_write(cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_dep_msg_out_header_has_complemented_btag() {
        let frame = UsbTmcTransport::build_dev_dep_msg_out(5, b"*IDN?", true);
        assert_eq!(frame[0], USBTMC_MSG_OUT);
        assert_eq!(frame[1], 5);
        assert_eq!(frame[2], !5u8);
        assert_eq!(frame.len() % 4, 0);
    }

    #[test]
    fn btag_rotates_and_skips_zero() {
        let mut t = UsbTmcTransport::new(0x1234, 0x5678, 0, 0x02, 0x81);
        t.next_tag = 255;
        assert_eq!(t.next_btag(), 255);
        assert_eq!(t.next_btag(), 1);
    }
}

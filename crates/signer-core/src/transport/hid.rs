//! USB HID transport for local Ledger devices.
//!
//! Implements the Ledger HID framing protocol on top of the `hidapi` crate:
//! APDUs are carried in 64-byte reports tagged with a channel id and a
//! sequence number.
//!
//! # Frame Layout
//!
//! ```text
//! | channel (2B BE) | tag (1B) | seq (2B BE) | [len (2B BE), seq 0 only] | payload |
//! ```

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice};
use tracing::{debug, trace};

use super::Transport;
use crate::apdu::{Apdu, ApduResponse};
use crate::error::{ConnectionFailure, Error, Result};

/// Ledger USB vendor ID.
const LEDGER_VENDOR_ID: u16 = 0x2C97;

/// HID communication channel, fixed by the Ledger framing protocol.
const CHANNEL: u16 = 0x0101;

/// APDU frame tag.
const TAG_APDU: u8 = 0x05;

/// HID report size.
const PACKET_SIZE: usize = 64;

/// Read timeout per frame, in milliseconds. Generous because signing blocks
/// until the operator confirms or rejects on the device.
const READ_TIMEOUT_MS: i32 = 10 * 60 * 1000;

/// Whether the HID subsystem is usable in this environment.
#[must_use]
pub fn is_supported() -> bool {
    HidApi::new().is_ok()
}

/// Opens the first connected Ledger device.
///
/// # Errors
///
/// - `NoDeviceFound` if no Ledger device is attached
/// - `UnsupportedEnvironment` if the HID subsystem cannot be initialized
pub fn connect() -> Result<Box<dyn Transport>> {
    let transport = HidTransport::open()?;
    Ok(Box::new(transport))
}

/// A HID transport for a local Ledger device.
pub struct HidTransport {
    /// The open device handle; `None` once closed.
    device: Option<HidDevice>,
}

impl std::fmt::Debug for HidTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidTransport")
            .field("open", &self.device.is_some())
            .finish_non_exhaustive()
    }
}

impl HidTransport {
    /// Connects to the first attached Ledger device.
    ///
    /// # Errors
    ///
    /// See [`connect`].
    pub fn open() -> Result<Self> {
        let api = HidApi::new().map_err(|_| {
            Error::connection(ConnectionFailure::UnsupportedEnvironment)
        })?;

        let info = api
            .device_list()
            .find(|device| device.vendor_id() == LEDGER_VENDOR_ID)
            .ok_or(Error::connection(ConnectionFailure::NoDeviceFound))?;

        let device = info
            .open_device(&api)
            .map_err(|_| Error::connection(ConnectionFailure::NoDeviceFound))?;

        debug!(
            product = info.product_string().unwrap_or("unknown"),
            "opened Ledger HID device"
        );

        Ok(Self {
            device: Some(device),
        })
    }

    fn device(&self) -> Result<&HidDevice> {
        self.device
            .as_ref()
            .ok_or(Error::connection(ConnectionFailure::NoDeviceFound))
    }

    /// Splits `payload` into HID frames and writes them to the device.
    fn write_apdu(&self, payload: &[u8]) -> Result<()> {
        let device = self.device()?;

        for (seq, chunk) in FrameChunks::new(payload).enumerate() {
            // Report id 0x00 precedes the frame on every platform.
            let mut report = Vec::with_capacity(PACKET_SIZE + 1);
            report.push(0x00);
            report.extend_from_slice(&CHANNEL.to_be_bytes());
            report.push(TAG_APDU);
            report.extend_from_slice(&(seq as u16).to_be_bytes());
            if seq == 0 {
                report.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            }
            report.extend_from_slice(chunk);
            report.resize(PACKET_SIZE + 1, 0x00);

            device.write(&report).map_err(|e| Error::DeviceProtocol {
                code: 0,
                message: format!("HID write failed: {e}"),
            })?;
            trace!(seq, len = chunk.len(), "wrote HID frame");
        }

        Ok(())
    }

    /// Reads HID frames until a complete response payload is assembled.
    fn read_apdu(&self) -> Result<Vec<u8>> {
        let device = self.device()?;
        let mut payload = Vec::new();
        let mut expected_len = 0usize;
        let mut seq = 0u16;

        loop {
            let mut frame = [0u8; PACKET_SIZE];
            let read = device
                .read_timeout(&mut frame, READ_TIMEOUT_MS)
                .map_err(|e| Error::DeviceProtocol {
                    code: 0,
                    message: format!("HID read failed: {e}"),
                })?;
            if read < 5 {
                return Err(Error::Decode("short HID frame".to_string()));
            }

            let channel = u16::from_be_bytes([frame[0], frame[1]]);
            let tag = frame[2];
            let frame_seq = u16::from_be_bytes([frame[3], frame[4]]);
            if channel != CHANNEL || tag != TAG_APDU || frame_seq != seq {
                return Err(Error::Decode(format!(
                    "unexpected HID frame (channel {channel:#06x}, tag {tag:#04x}, seq {frame_seq})"
                )));
            }

            let body = if seq == 0 {
                if read < 7 {
                    return Err(Error::Decode("short HID frame".to_string()));
                }
                expected_len = u16::from_be_bytes([frame[5], frame[6]]) as usize;
                &frame[7..read]
            } else {
                &frame[5..read]
            };

            let remaining = expected_len - payload.len();
            payload.extend_from_slice(&body[..remaining.min(body.len())]);

            if payload.len() >= expected_len {
                return Ok(payload);
            }
            seq += 1;
        }
    }
}

#[async_trait]
impl Transport for HidTransport {
    async fn exchange(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
        self.write_apdu(&apdu.to_bytes())?;
        let response = self.read_apdu()?;
        ApduResponse::from_bytes(response)
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("closed Ledger HID device");
        }
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator over the payload slices of successive HID frames.
struct FrameChunks<'a> {
    payload: &'a [u8],
    offset: usize,
    seq: usize,
}

impl<'a> FrameChunks<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            offset: 0,
            seq: 0,
        }
    }
}

impl<'a> Iterator for FrameChunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.payload.len() && self.seq > 0 {
            return None;
        }
        // First frame loses two bytes to the length prefix.
        let capacity = if self.seq == 0 {
            PACKET_SIZE - 7
        } else {
            PACKET_SIZE - 5
        };
        let end = (self.offset + capacity).min(self.payload.len());
        let chunk = &self.payload[self.offset..end];
        self.offset = end;
        self.seq += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_chunks_single_frame() {
        let payload = vec![0xAB; 10];
        let chunks: Vec<_> = FrameChunks::new(&payload).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 10);
    }

    #[test]
    fn frame_chunks_split_lengths() {
        // 57 bytes fit in the first frame, the rest go 59 at a time.
        let payload = vec![0u8; 57 + 59 + 1];
        let chunks: Vec<_> = FrameChunks::new(&payload).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 57);
        assert_eq!(chunks[1].len(), 59);
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn frame_chunks_empty_payload_still_emits_header_frame() {
        let chunks: Vec<_> = FrameChunks::new(&[]).collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
    }
}

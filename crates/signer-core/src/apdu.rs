//! APDU (Application Protocol Data Unit) command and response types.
//!
//! This module provides types for constructing and parsing the ISO 7816-4
//! APDU commands and responses used to talk to the Ledger device.
//!
//! # APDU Command Structure
//!
//! ```text
//! | CLA | INS | P1 | P2 | Lc | Data |
//! |-----|-----|----|----|----|------|
//! | 1B  | 1B  | 1B | 1B | 1B | Var  |
//! ```
//!
//! # APDU Response Structure
//!
//! ```text
//! | Data | SW1 | SW2 |
//! |------|-----|-----|
//! | Var  | 1B  | 1B  |
//! ```
//!
//! The two-byte status word (`SW1 SW2`) is the app's return code. Following
//! the Ledger app convention, failed responses may carry an ASCII error
//! message in the data section.
//!
//! # Example
//!
//! ```
//! use icp_ledger_signer_core::apdu::Apdu;
//!
//! // GET VERSION for the Internet Computer app
//! let apdu = Apdu::new(0x11, 0x00, 0x00, 0x00, vec![]);
//! assert_eq!(apdu.to_bytes(), vec![0x11, 0x00, 0x00, 0x00, 0x00]);
//! ```

use crate::error::{Error, Result};

/// An APDU command to be sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// Class byte (identifies the app).
    cla: u8,

    /// Instruction byte.
    ins: u8,

    /// Parameter 1.
    p1: u8,

    /// Parameter 2.
    p2: u8,

    /// Command data.
    data: Vec<u8>,
}

impl Apdu {
    /// Maximum data length of a single APDU chunk.
    ///
    /// Larger payloads (signing blobs, consent artifacts) are split across
    /// multiple commands by the app layer.
    pub const MAX_CHUNK_LEN: usize = 250;

    /// Creates a new APDU command.
    ///
    /// # Panics
    ///
    /// Panics if `data` exceeds [`Self::MAX_CHUNK_LEN`]; chunking is the
    /// caller's responsibility.
    #[must_use]
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        assert!(
            data.len() <= Self::MAX_CHUNK_LEN,
            "APDU data must be chunked to at most {} bytes",
            Self::MAX_CHUNK_LEN
        );
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
        }
    }

    /// Returns the class byte.
    #[must_use]
    pub const fn cla(&self) -> u8 {
        self.cla
    }

    /// Returns the instruction byte.
    #[must_use]
    pub const fn ins(&self) -> u8 {
        self.ins
    }

    /// Returns parameter 1.
    #[must_use]
    pub const fn p1(&self) -> u8 {
        self.p1
    }

    /// Returns parameter 2.
    #[must_use]
    pub const fn p2(&self) -> u8 {
        self.p2
    }

    /// Returns the command data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the APDU to bytes (`CLA INS P1 P2 Lc Data`).
    ///
    /// `Lc` is always emitted, even when zero; the Ledger HID framing
    /// expects a complete five-byte header.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(5 + self.data.len());
        bytes.push(self.cla);
        bytes.push(self.ins);
        bytes.push(self.p1);
        bytes.push(self.p2);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// An APDU response from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data.
    data: Vec<u8>,

    /// Status word 1.
    sw1: u8,

    /// Status word 2.
    sw2: u8,
}

impl ApduResponse {
    /// Success status word (`0x9000`).
    pub const SW_SUCCESS: u16 = 0x9000;

    /// Parses a response from raw bytes (data followed by `SW1 SW2`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the response is shorter than the
    /// two-byte status word.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Decode("APDU response too short".to_string()));
        }

        let len = bytes.len();
        let sw1 = bytes[len - 2];
        let sw2 = bytes[len - 1];
        let data = bytes[..len - 2].to_vec();

        Ok(Self { data, sw1, sw2 })
    }

    /// Returns the response data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the response and returns the data.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Returns the full status word (return code) as a [`u16`].
    #[must_use]
    pub const fn return_code(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Checks if the response indicates success (`SW = 0x9000`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.return_code() == Self::SW_SUCCESS
    }

    /// The ASCII error message embedded in a failed response, if any.
    ///
    /// Ledger apps return a printable description in the data section of
    /// most error responses.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() || self.data.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.data);
        if text.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            Some(text.into_owned())
        } else {
            None
        }
    }
}

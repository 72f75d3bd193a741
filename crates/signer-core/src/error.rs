//! Error types for the Ledger signer library.
//!
//! This module provides a comprehensive error type [`enum@Error`] that covers all
//! possible failure modes when signing Internet Computer requests with a
//! Ledger hardware wallet.
//!
//! # Error Categories
//!
//! - **Device errors**: transport discovery, app return codes, and device
//!   substitution detection
//! - **Identity errors**: derivation-path validation and principal checks
//! - **Consent-flow errors**: certificate verification, call rejection, and
//!   polling budgets
//!
//! Every variant carries enough structured data (return codes, versions,
//! reject messages) to be rendered to a human without re-deriving context.

use core::result::Result as CoreResult;

use candid::Error as CandidError;
use hex::FromHexError;
use serde_cbor::Error as CborError;
use thiserror::Error;

/// The specific way a device connection attempt failed.
///
/// Connection failures are surfaced immediately with a remediation-oriented
/// message; the library never retries connection attempts on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// A capable transport was found but no device is present on it.
    NoDeviceFound,

    /// The device is present but locked (PIN screen).
    DeviceLocked,

    /// A different application is open on the device.
    WrongAppOpen,

    /// No transport provider is capable in this environment.
    UnsupportedEnvironment,
}

impl ConnectionFailure {
    /// A short remediation hint for the failure.
    #[must_use]
    pub const fn remediation(&self) -> &'static str {
        match self {
            Self::NoDeviceFound => "Is the wallet connected and unlocked?",
            Self::DeviceLocked => "Unlock the device and try again.",
            Self::WrongAppOpen => {
                "Open the Internet Computer app on the device and try again."
            }
            Self::UnsupportedEnvironment => {
                "No usable transport was found. Close other wallet applications \
                 (e.g. Ledger Live) or set ICP_LEDGER_TCP to use an emulator."
            }
        }
    }
}

/// The main error type for the Ledger signer library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Connecting to the device failed.
    #[error("cannot connect to the Ledger device: {kind:?}. {}", kind.remediation())]
    Connection {
        /// How the connection attempt failed.
        kind: ConnectionFailure,
    },

    /// The device observed in a session holds a different key than the one
    /// this identity was created with.
    #[error("found an unexpected public key on the device; are you using the right wallet?")]
    DeviceSubstitution,

    /// The app returned a nonzero return code with no dedicated mapping.
    #[error("the Ledger app returned an error (code {code:#06x}): {message}")]
    DeviceProtocol {
        /// Raw device return code.
        code: u16,
        /// Message reported by the device, if any.
        message: String,
    },

    /// The device produced a signature that is not exactly 64 bytes.
    #[error("signature must be 64 bytes long (is {actual})")]
    SignatureLength {
        /// Length of the bytes actually returned.
        actual: usize,
    },

    // =========================================================================
    // Identity Errors
    // =========================================================================
    /// Creating the identity failed before it was fully initialized.
    #[error("failed to create the Ledger identity: {reason}")]
    IdentityCreation {
        /// What went wrong.
        reason: String,
    },

    /// The installed app is older than an operation requires.
    #[error("Ledger app version {current} is too old; please update to {min} or newer")]
    VersionTooOld {
        /// Version reported by the device.
        current: String,
        /// Minimum version the operation requires.
        min: String,
    },

    // =========================================================================
    // Consent-Flow Errors
    // =========================================================================
    /// The canister (or the replica) rejected the consent call.
    #[error("call rejected (code {code}): {message}")]
    CallRejected {
        /// Reject code, or 0 for an ICRC-21 level refusal.
        code: u64,
        /// Reject message or error description.
        message: String,
    },

    /// The response certificate failed verification.
    #[error("certificate verification failed: {reason}")]
    CertificateVerification {
        /// What check failed.
        reason: String,
    },

    /// Response bytes could not be decoded into the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The certified response stayed pending past the retry budget.
    #[error("request status still pending after {attempts} polling attempts")]
    PollingTimeout {
        /// Number of read-state attempts made.
        attempts: u32,
    },
}

impl Error {
    /// Shorthand for a [`Error::Connection`] with the given failure kind.
    #[must_use]
    pub const fn connection(kind: ConnectionFailure) -> Self {
        Self::Connection { kind }
    }
}

impl From<CborError> for Error {
    fn from(err: CborError) -> Self {
        Error::Decode(format!("cbor: {err}"))
    }
}

impl From<CandidError> for Error {
    fn from(err: CandidError) -> Self {
        Error::Decode(format!("candid: {err}"))
    }
}

impl From<FromHexError> for Error {
    fn from(err: FromHexError) -> Self {
        Error::Decode(format!("hex: {err}"))
    }
}

/// A specialized [`Result`] type for Ledger signer operations.
pub type Result<T> = CoreResult<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::SignatureLength { actual: 63 };
        assert_eq!(err.to_string(), "signature must be 64 bytes long (is 63)");

        let err = Error::VersionTooOld {
            current: "2.1.9".to_string(),
            min: "2.2.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Ledger app version 2.1.9 is too old; please update to 2.2.0 or newer"
        );

        let err = Error::DeviceProtocol {
            code: 0xFFFF,
            message: "unknown".to_string(),
        };
        assert!(err.to_string().contains("0xffff"));
    }

    #[test]
    fn connection_remediation() {
        let err = Error::connection(ConnectionFailure::WrongAppOpen);
        assert!(err.to_string().contains("Internet Computer app"));
    }

    #[test]
    fn from_cbor_error() {
        let cbor_err = serde_cbor::from_slice::<u8>(&[]).unwrap_err();
        let err: Error = cbor_err.into();
        assert!(matches!(err, Error::Decode(_)));
    }
}

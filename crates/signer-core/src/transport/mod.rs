//! Device transport discovery and abstraction.
//!
//! This module normalizes the environment-specific ways of reaching a Ledger
//! device into one handle type, [`Box<dyn Transport>`].
//!
//! # Provider Selection
//!
//! Transports are tried in a fixed priority order. Each provider exposes a
//! capability probe and a constructor; the first provider whose probe
//! reports the environment as capable wins deterministically:
//!
//! 1. [`tcp`]: a Speculos-style emulator, only capable when the operator
//!    opts in by setting `ICP_LEDGER_TCP`
//! 2. [`hid`]: local USB HID devices (the common case)
//!
//! The emulator entry comes first because its probe is false unless the
//! environment variable is set; the HID subsystem initializes on most
//! hosts, so the reverse order would shadow an explicitly requested
//! emulator.
//!
//! [`connect`] fails with a `NoDeviceFound` connection error when a capable
//! provider finds no device, and with `UnsupportedEnvironment` when no
//! provider is capable at all.
//!
//! # Resource Model
//!
//! The device is an exclusive resource: one open transport at a time. Every
//! transport implements an idempotent [`Transport::close`] and also releases
//! the underlying handle on [`Drop`], so an error (or panic) mid-operation
//! can never leave the device locked for subsequent sessions.

pub mod hid;
pub mod tcp;

use async_trait::async_trait;
use tracing::debug;

use crate::apdu::{Apdu, ApduResponse};
use crate::error::{ConnectionFailure, Error, Result};

pub use hid::HidTransport;
pub use tcp::TcpTransport;

/// A transport layer for exchanging APDUs with a Ledger device.
#[async_trait]
pub trait Transport: Send {
    /// Sends an APDU command and receives the response.
    ///
    /// # Errors
    ///
    /// Returns an error if communication fails; app-level return codes are
    /// carried inside the [`ApduResponse`], not surfaced here.
    async fn exchange(&mut self, apdu: &Apdu) -> Result<ApduResponse>;

    /// Releases the underlying device handle.
    ///
    /// Idempotent: closing an already-closed transport is a no-op. Dropping
    /// the transport has the same effect.
    fn close(&mut self);
}

/// One entry in the ordered transport registry.
pub struct TransportProvider {
    /// Short provider name, used in logs.
    pub name: &'static str,

    /// Whether this transport mechanism is usable in the current
    /// environment. A `true` here does not imply a device is present.
    pub probe: fn() -> bool,

    /// Opens a connection to a device over this transport.
    pub connect: fn() -> Result<Box<dyn Transport>>,
}

/// The fixed provider priority order.
const PROVIDERS: &[TransportProvider] = &[
    // Opt-in entries with narrow probes go before broadly-capable ones.
    TransportProvider {
        name: "tcp",
        probe: tcp::is_supported,
        connect: tcp::connect,
    },
    TransportProvider {
        name: "hid",
        probe: hid::is_supported,
        connect: hid::connect,
    },
];

/// Opens a connection to the first device found on a capable transport.
///
/// # Errors
///
/// - [`ConnectionFailure::NoDeviceFound`] if a capable transport has no
///   device attached
/// - [`ConnectionFailure::UnsupportedEnvironment`] if no transport provider
///   is capable in this environment
pub fn connect() -> Result<Box<dyn Transport>> {
    for provider in PROVIDERS {
        if (provider.probe)() {
            debug!(provider = provider.name, "opening device transport");
            return (provider.connect)();
        }
    }

    Err(Error::connection(ConnectionFailure::UnsupportedEnvironment))
}

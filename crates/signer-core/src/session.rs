//! Per-operation device sessions.
//!
//! The device is an exclusive resource, so every operation runs inside a
//! short-lived [`AppSession`]: connect, verify the device identity, run,
//! disconnect. Sessions never outlive one operation and never cache device
//! state across operations.
//!
//! A verified session re-fetches the public key for the derivation path and
//! compares it against the key the identity was created with. On mismatch
//! the session fails with [`Error::DeviceSubstitution`] before the operation
//! runs. The transport is released on every exit path, explicitly via
//! [`AppSession::close`] and as a backstop when the session is dropped.

use tracing::debug;

use crate::app::IcpApp;
use crate::error::{Error, Result};
use crate::keys::{DerivationPath, Secp256k1PublicKey};
use crate::transport::Transport;

/// Phases a session moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    VerifyingDeviceIdentity,
    Ready,
    Disconnecting,
}

/// An open, optionally identity-verified connection to the app.
pub struct AppSession {
    app: IcpApp,
    state: SessionState,
}

impl AppSession {
    /// Verifies that the device holds `expected` at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceSubstitution`] on a key mismatch.
    pub async fn verify(
        &mut self,
        path: &DerivationPath,
        expected: &Secp256k1PublicKey,
    ) -> Result<()> {
        self.state = SessionState::VerifyingDeviceIdentity;
        let reported = self.app.get_address_and_public_key(path).await?;
        if reported.public_key != *expected {
            debug!("device public key mismatch, refusing session");
            return Err(Error::DeviceSubstitution);
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    /// The app handle for running operations.
    pub fn app(&mut self) -> &mut IcpApp {
        &mut self.app
    }

    /// The session's current phase.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Disconnects. Dropping the session without calling this releases the
    /// transport all the same.
    pub fn close(mut self) {
        self.state = SessionState::Disconnecting;
        debug!("closing device session");
        self.app.close();
    }
}

/// Builds a session over an already-open transport.
///
/// Discovery lives in [`crate::transport::connect`]; identities feed its
/// result (or an injected test transport) here.
impl From<Box<dyn Transport>> for AppSession {
    fn from(transport: Box<dyn Transport>) -> Self {
        Self {
            app: IcpApp::new(transport),
            state: SessionState::Connecting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    const GENERATOR_HEX: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

    fn key() -> Secp256k1PublicKey {
        Secp256k1PublicKey::from_raw(&hex::decode(GENERATOR_HEX).unwrap()).unwrap()
    }

    fn address_response(key: &Secp256k1PublicKey) -> crate::apdu::ApduResponse {
        let principal = key.principal();
        let mut data = key.as_raw().to_vec();
        data.extend_from_slice(principal.as_slice());
        data.extend_from_slice(principal.to_text().as_bytes());
        MockTransport::ok_response(&data)
    }

    #[tokio::test]
    async fn injected_transport_verifies_and_becomes_ready() {
        let key = key();
        let (transport, log) = MockTransport::new(vec![address_response(&key)]);

        let mut session = AppSession::from(Box::new(transport) as Box<dyn Transport>);
        assert_eq!(session.state(), SessionState::Connecting);

        let path = DerivationPath::from_index(0).unwrap();
        session.verify(&path, &key).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        session.close();
        assert!(log.lock().unwrap().closed >= 1);
    }
}

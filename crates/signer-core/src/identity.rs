//! Signing identities.
//!
//! An [`Identity`] turns a canonical request into a submittable envelope:
//! it owns a sender principal, optionally a public key, and the ability to
//! produce signatures over request content. [`LedgerIdentity`] backs these
//! with a hardware device; [`AnonymousIdentity`] signs nothing and is what
//! the consent flow submits its own calls with.
//!
//! # Device Sessions
//!
//! A [`LedgerIdentity`] holds no open transport. Every operation opens a
//! fresh session, verifies the device still holds the key the identity was
//! created with, runs, and closes. Two wallets with the same seed phrase
//! are interchangeable; any other device fails the session check.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> icp_ledger_signer_core::Result<()> {
//! use icp_ledger_signer_core::identity::{Identity, LedgerIdentity};
//!
//! let identity = LedgerIdentity::create(0).await?;
//! println!("principal: {}", identity.sender());
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use candid::Principal;
use tracing::debug;

use crate::app::TransactionKind;
use crate::consent::ConsentVerifier;
use crate::error::{Error, Result};
use crate::keys::{DerivationPath, Secp256k1PublicKey};
use crate::request::{Envelope, RequestContent};
use crate::session::AppSession;
use crate::transport::{self, Transport};
use crate::version::{self, Version, SIGN_WITH_CONTEXT_MIN_VERSION};

/// Opens fresh device transports for per-operation sessions.
pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn Transport>> + Send + Sync>;

/// A signature produced by an identity, with the key to verify it.
///
/// Both fields are `None` for identities that do not sign; the envelope
/// then goes out anonymous.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    /// DER-encoded public key.
    pub public_key: Option<Vec<u8>>,

    /// 64-byte RS signature over the request's signable bytes.
    pub signature: Option<Vec<u8>>,
}

/// A principal that can turn request content into submittable envelopes.
#[async_trait]
pub trait Identity: Send + Sync {
    /// The principal requests are sent as.
    fn sender(&self) -> Principal;

    /// The DER-encoded public key, when the identity has one.
    fn public_key(&self) -> Option<Vec<u8>>;

    /// Produces a signature for the request content.
    async fn sign(&self, content: &RequestContent) -> Result<Signature>;

    /// Signs the content and wraps it into its CBOR envelope.
    async fn transform_request(&self, content: &RequestContent) -> Result<Vec<u8>> {
        let signature = self.sign(content).await?;
        match (signature.public_key, signature.signature) {
            (Some(public_key), Some(signature)) => {
                Envelope::signed(content, public_key, signature).to_cbor()
            }
            _ => Envelope::anonymous(content).to_cbor(),
        }
    }

    /// The version of the signing app backing this identity, if any.
    ///
    /// The default is `None`, which makes version gates pass; only
    /// hardware-backed identities report one.
    async fn installed_app_version(&self) -> Result<Option<Version>> {
        Ok(None)
    }
}

/// The identity of the anonymous principal. Envelopes carry no signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

#[async_trait]
impl Identity for AnonymousIdentity {
    fn sender(&self) -> Principal {
        Principal::anonymous()
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        None
    }

    async fn sign(&self, _content: &RequestContent) -> Result<Signature> {
        Ok(Signature::default())
    }
}

/// An identity backed by a key on a Ledger device.
pub struct LedgerIdentity {
    path: DerivationPath,
    public_key: Secp256k1PublicKey,
    /// Set by [`Self::flag_upcoming_stake_transaction`], consumed by
    /// exactly the next payload signing, whether it succeeds or not.
    stake_flag: AtomicBool,
    consent: Option<ConsentVerifier>,
    transport_factory: TransportFactory,
}

impl std::fmt::Debug for LedgerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerIdentity")
            .field("path", &self.path)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl LedgerIdentity {
    /// Creates an identity for the key at derivation index `index`.
    ///
    /// Connects to the device, fetches the public key, and checks that the
    /// principal the device reports is the one derivable from that key.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityCreation`] for an out-of-range index or a
    ///   principal mismatch
    /// - connection errors from transport discovery
    pub async fn create(index: u32) -> Result<Self> {
        Self::create_with_transport(index, Box::new(transport::connect)).await
    }

    /// Like [`Self::create`], over a caller-supplied transport source.
    pub async fn create_with_transport(index: u32, factory: TransportFactory) -> Result<Self> {
        let path = DerivationPath::from_index(index)?;

        let mut session = AppSession::from(factory()?);
        let fetched = session.app().get_address_and_public_key(&path).await;
        session.close();

        let reported = fetched?;
        if reported.principal != reported.public_key.principal() {
            return Err(Error::IdentityCreation {
                reason: "the principal reported by the device does not match its public key"
                    .to_string(),
            });
        }

        debug!(path = %path, principal = %reported.principal, "created Ledger identity");
        Ok(Self {
            path,
            public_key: reported.public_key,
            stake_flag: AtomicBool::new(false),
            consent: None,
            transport_factory: factory,
        })
    }

    /// Attaches a consent verifier; call requests are then signed with
    /// their certified consent context.
    #[must_use]
    pub fn with_consent_verifier(mut self, verifier: ConsentVerifier) -> Self {
        self.consent = Some(verifier);
        self
    }

    /// The derivation path this identity signs under.
    #[must_use]
    pub const fn derivation_path(&self) -> &DerivationPath {
        &self.path
    }

    /// Marks the next signing as a neuron-stake transaction, so the device
    /// shows the staking review flow. One-shot: the flag is cleared by the
    /// next [`Self::sign_payload`] even if it fails.
    pub fn flag_upcoming_stake_transaction(&self) {
        self.stake_flag.store(true, Ordering::SeqCst);
    }

    /// Signs raw payload bytes on the device.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceSubstitution`] when the connected device does not
    ///   hold this identity's key
    /// - [`Error::SignatureLength`] when the device returns anything but a
    ///   64-byte signature
    pub async fn sign_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        // Consume the flag before any device I/O; a failed attempt must
        // not leave it armed for an unrelated later signing.
        let kind = if self.stake_flag.swap(false, Ordering::SeqCst) {
            TransactionKind::Stake
        } else {
            TransactionKind::Default
        };

        let mut session = self.open_session().await?;
        let signed = session.app().sign(&self.path, payload, kind).await;
        session.close();
        signed
    }

    /// Shows the principal on the device screen and waits for the user to
    /// confirm it.
    pub async fn show_address_and_public_key_on_device(&self) -> Result<()> {
        let mut session = self.open_session().await?;
        let shown = session.app().show_address_and_public_key(&self.path).await;
        session.close();
        shown.map(|_| ())
    }

    /// Reads the app's supported-token registry.
    pub async fn get_supported_tokens(&self) -> Result<Vec<crate::app::TokenInfo>> {
        let mut session = self.open_session().await?;
        let tokens = session.app().get_supported_tokens().await;
        session.close();
        tokens
    }

    /// Queries the installed app version from the device.
    pub async fn get_version(&self) -> Result<Version> {
        let mut session = self.open_session().await?;
        let queried = session.app().get_version().await;
        session.close();
        queried
    }

    /// Signs a call together with its certified consent context.
    async fn sign_call_with_consent(
        &self,
        content: &RequestContent,
        verifier: &ConsentVerifier,
    ) -> Result<Vec<u8>> {
        // Gate on the app version before any network traffic.
        version::assert_app_version(self, &SIGN_WITH_CONTEXT_MIN_VERSION).await?;

        let RequestContent::Call {
            canister_id,
            method_name,
            arg,
            ..
        } = content
        else {
            return Err(Error::Decode(
                "consent-bound signing applies to call requests only".to_string(),
            ));
        };

        let artifacts = verifier
            .request_consent(*canister_id, method_name, arg)
            .await?;
        let call = content.to_signable()?;

        let mut session = self.open_session().await?;
        let signed = session
            .app()
            .sign_with_context(
                &self.path,
                &artifacts.consent_request,
                &call,
                &artifacts.certificate,
                verifier.custom_root_key(),
            )
            .await;
        session.close();
        signed
    }

    async fn open_session(&self) -> Result<AppSession> {
        let mut session = AppSession::from((self.transport_factory)()?);
        if let Err(err) = session.verify(&self.path, &self.public_key).await {
            session.close();
            return Err(err);
        }
        Ok(session)
    }
}

#[async_trait]
impl Identity for LedgerIdentity {
    fn sender(&self) -> Principal {
        self.public_key.principal()
    }

    fn public_key(&self) -> Option<Vec<u8>> {
        Some(self.public_key.to_der())
    }

    async fn sign(&self, content: &RequestContent) -> Result<Signature> {
        let signature = match (content, &self.consent) {
            (RequestContent::Call { .. }, Some(verifier)) => {
                self.sign_call_with_consent(content, verifier).await?
            }
            _ => self.sign_payload(&content.to_signable()?).await?,
        };
        Ok(Signature {
            public_key: Some(self.public_key.to_der()),
            signature: Some(signature),
        })
    }

    async fn installed_app_version(&self) -> Result<Option<Version>> {
        self.get_version().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::error::ConnectionFailure;
    use crate::transport::testing::{MockLog, MockTransport};

    const GENERATOR_HEX: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

    fn device_key() -> Secp256k1PublicKey {
        Secp256k1PublicKey::from_raw(&hex::decode(GENERATOR_HEX).unwrap()).unwrap()
    }

    fn address_response(key: &Secp256k1PublicKey, principal: Principal) -> crate::apdu::ApduResponse {
        let mut data = key.as_raw().to_vec();
        data.extend_from_slice(principal.as_slice());
        data.extend_from_slice(principal.to_text().as_bytes());
        MockTransport::ok_response(&data)
    }

    /// A factory handing out the given transports in order, with their
    /// logs for later inspection.
    fn scripted_factory(
        sessions: Vec<Vec<crate::apdu::ApduResponse>>,
    ) -> (TransportFactory, Vec<std::sync::Arc<Mutex<MockLog>>>) {
        let mut transports = VecDeque::new();
        let mut logs = Vec::new();
        for responses in sessions {
            let (transport, log) = MockTransport::new(responses);
            transports.push_back(Box::new(transport) as Box<dyn Transport>);
            logs.push(log);
        }
        let transports = Mutex::new(transports);
        let factory = Box::new(move || {
            transports
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(Error::connection(ConnectionFailure::NoDeviceFound))
        });
        (factory, logs)
    }

    #[tokio::test]
    async fn create_verifies_the_reported_principal() {
        let key = device_key();
        let (factory, logs) =
            scripted_factory(vec![vec![address_response(&key, key.principal())]]);

        let identity = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap();
        assert_eq!(identity.sender(), key.principal());
        assert_eq!(
            Identity::public_key(&identity),
            Some(key.to_der())
        );
        // Transport released after the creation round trip.
        assert!(logs[0].lock().unwrap().closed >= 1);
    }

    #[tokio::test]
    async fn create_rejects_a_mismatched_principal() {
        let key = device_key();
        let (factory, logs) =
            scripted_factory(vec![vec![address_response(&key, Principal::anonymous())]]);

        let err = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityCreation { .. }));
        // Transport released on the failure path too.
        assert!(logs[0].lock().unwrap().closed >= 1);
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_indices_before_io() {
        let (factory, logs) = scripted_factory(vec![vec![]]);
        let err = LedgerIdentity::create_with_transport(256, factory)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityCreation { .. }));
        assert!(logs[0].lock().unwrap().sent.is_empty());
    }

    #[tokio::test]
    async fn sessions_reject_a_substituted_device() {
        let key = device_key();
        let other_key = Secp256k1PublicKey::from_raw(
            &hex::decode(
                // 2G, another valid point
                "04c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5\
                 1ae168fea63dc339a3c58419466ceaeef7f632653266d0e1236431a950cfe52a",
            )
            .unwrap(),
        )
        .unwrap();

        let (factory, _logs) = scripted_factory(vec![
            vec![address_response(&key, key.principal())],
            vec![address_response(&other_key, other_key.principal())],
        ]);

        let identity = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap();
        let err = identity.sign_payload(b"blob").await.unwrap_err();
        assert!(matches!(err, Error::DeviceSubstitution));
    }

    #[tokio::test]
    async fn stake_flag_is_consumed_by_exactly_one_signing() {
        let key = device_key();
        let sign_session = |key: &Secp256k1PublicKey| {
            vec![
                address_response(key, key.principal()),
                MockTransport::ok_response(&[]),
                MockTransport::ok_response(&[0x77; 64]),
            ]
        };
        let (factory, logs) = scripted_factory(vec![
            vec![address_response(&key, key.principal())],
            sign_session(&key),
            sign_session(&key),
        ]);

        let identity = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap();

        identity.flag_upcoming_stake_transaction();
        identity.sign_payload(b"stake").await.unwrap();
        identity.sign_payload(b"transfer").await.unwrap();

        // Session 1: the flagged signing runs with the stake kind.
        let first = logs[1].lock().unwrap();
        assert!(first.sent[1..].iter().all(|apdu| apdu.p2() == 0x01));
        // Session 2: the flag was consumed, back to the default kind.
        let second = logs[2].lock().unwrap();
        assert!(second.sent[1..].iter().all(|apdu| apdu.p2() == 0x00));
    }

    #[tokio::test]
    async fn stake_flag_is_consumed_even_when_signing_fails() {
        let key = device_key();
        let (factory, _logs) = scripted_factory(vec![
            vec![address_response(&key, key.principal())],
            // No device on the second session.
        ]);

        let identity = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap();

        identity.flag_upcoming_stake_transaction();
        identity.sign_payload(b"stake").await.unwrap_err();
        assert!(!identity.stake_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn read_state_requests_sign_over_their_canonical_cbor() {
        let key = device_key();
        let (factory, logs) = scripted_factory(vec![
            vec![address_response(&key, key.principal())],
            vec![
                address_response(&key, key.principal()),
                MockTransport::ok_response(&[]),
                MockTransport::ok_response(&[0x42; 64]),
            ],
        ]);

        let identity = LedgerIdentity::create_with_transport(0, factory)
            .await
            .unwrap();

        let content = RequestContent::read_request_status(identity.sender(), [1; 32]);
        let envelope = identity.transform_request(&content).await.unwrap();

        // The device saw the signable bytes of the same content. The first
        // two commands are the session verify and the INIT chunk.
        let log = logs[1].lock().unwrap();
        let signed: Vec<u8> = log.sent[2..]
            .iter()
            .flat_map(|apdu| apdu.data().iter().copied())
            .collect();
        assert_eq!(signed, content.to_signable().unwrap());

        // The envelope is a three-entry map: content + key + signature.
        assert_eq!(envelope[3], 0xA3);
    }

    #[tokio::test]
    async fn anonymous_identity_produces_unsigned_envelopes() {
        let identity = AnonymousIdentity;
        assert_eq!(identity.sender(), Principal::anonymous());
        assert!(identity.public_key().is_none());

        let content = RequestContent::read_request_status(Principal::anonymous(), [2; 32]);
        let envelope = identity.transform_request(&content).await.unwrap();
        assert_eq!(envelope[3], 0xA1);
    }
}

//! ICRC-21 consent messages, certified end to end.
//!
//! Before a call is signed with context, the target canister is asked to
//! render a human-readable consent message for it
//! (`icrc21_canister_call_consent_message`). The round trip is driven over
//! an anonymous envelope and its result is only accepted through a verified
//! replica certificate; nothing read from an unverified response ever
//! reaches the device.
//!
//! The display preference requested from canisters is `FieldsDisplay`, the
//! structured `{intent, fields}` shape small screens paginate; canisters
//! may still answer with a generic text message and both decode.
//!
//! HTTP is not this crate's concern. The replica connection is abstracted
//! behind [`ReplicaTransport`]; callers plug in whatever agent they use.

use async_trait::async_trait;
use candid::{CandidType, Decode, Encode, Nat, Principal};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::certificate::{Certificate, LookupResult};
use crate::error::{Error, Result};
use crate::request::{Envelope, RequestContent};

/// The ICRC-21 endpoint method name.
pub const CONSENT_MESSAGE_METHOD: &str = "icrc21_canister_call_consent_message";

/// The mainnet root public key (DER). Certificates verify against this key
/// unless a custom one is supplied (local replicas, testnets).
pub const MAINNET_ROOT_KEY: [u8; 133] = [
    0x30, 0x81, 0x82, 0x30, 0x1D, 0x06, 0x0D, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0xDC, 0x7C,
    0x05, 0x03, 0x01, 0x02, 0x01, 0x06, 0x0C, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x82, 0xDC, 0x7C,
    0x05, 0x03, 0x02, 0x01, 0x03, 0x61, 0x00, 0x81, 0x4C, 0x0E, 0x6E, 0xC7, 0x1F, 0xAB, 0x58,
    0x3B, 0x08, 0xBD, 0x81, 0x37, 0x3C, 0x25, 0x5C, 0x3C, 0x37, 0x1B, 0x2E, 0x84, 0x86, 0x3C,
    0x98, 0xA4, 0xF1, 0xE0, 0x8B, 0x74, 0x23, 0x5D, 0x14, 0xFB, 0x5D, 0x9C, 0x0C, 0xD5, 0x46,
    0xD9, 0x68, 0x5F, 0x91, 0x3A, 0x0C, 0x0B, 0x2C, 0xC5, 0x34, 0x15, 0x83, 0xBF, 0x4B, 0x43,
    0x92, 0xE4, 0x67, 0xDB, 0x96, 0xD6, 0x5B, 0x9B, 0xB4, 0xCB, 0x71, 0x71, 0x12, 0xF8, 0x47,
    0x2E, 0x0D, 0x5A, 0x4D, 0x14, 0x50, 0x5F, 0xFD, 0x74, 0x84, 0xB0, 0x12, 0x91, 0x09, 0x1C,
    0x5F, 0x87, 0xB9, 0x88, 0x83, 0x46, 0x3F, 0x98, 0x09, 0x1A, 0x0B, 0xAA, 0xAE,
];

// ============================================================================
// ICRC-21 candid types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub struct ConsentMessageMetadata {
    pub utc_offset_minutes: Option<i16>,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, CandidType, Deserialize)]
pub enum DisplaySpec {
    GenericDisplay,
    FieldsDisplay,
}

#[derive(Debug, Clone, CandidType, Deserialize)]
pub struct ConsentMessageSpec {
    pub metadata: ConsentMessageMetadata,
    pub device_spec: Option<DisplaySpec>,
}

#[derive(Debug, Clone, CandidType, Deserialize)]
pub struct ConsentMessageRequest {
    pub arg: ByteBuf,
    pub method: String,
    pub user_preferences: ConsentMessageSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub enum ConsentMessage {
    FieldsDisplayMessage {
        intent: String,
        fields: Vec<(String, String)>,
    },
    GenericDisplayMessage(String),
}

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub struct ConsentInfo {
    pub metadata: ConsentMessageMetadata,
    pub consent_message: ConsentMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub struct ErrorInfo {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, CandidType, Deserialize)]
pub enum ConsentError {
    GenericError {
        description: String,
        error_code: Nat,
    },
    InsufficientPayment(ErrorInfo),
    UnsupportedCanisterCall(ErrorInfo),
    ConsentMessageUnavailable(ErrorInfo),
}

impl ConsentError {
    fn description(&self) -> String {
        match self {
            Self::GenericError { description, .. } => description.clone(),
            Self::InsufficientPayment(info) => {
                format!("insufficient payment: {}", info.description)
            }
            Self::UnsupportedCanisterCall(info) => {
                format!("unsupported canister call: {}", info.description)
            }
            Self::ConsentMessageUnavailable(info) => {
                format!("consent message unavailable: {}", info.description)
            }
        }
    }
}

#[derive(Debug, Clone, CandidType, Deserialize)]
pub enum ConsentMessageResponse {
    Ok(ConsentInfo),
    Err(ConsentError),
}

/// User preferences forwarded to the canister.
#[derive(Debug, Clone)]
pub struct ConsentPreferences {
    /// BCP-47 language tag.
    pub language: String,

    /// UTC offset for timestamp rendering, if known.
    pub utc_offset_minutes: Option<i16>,
}

impl Default for ConsentPreferences {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            utc_offset_minutes: None,
        }
    }
}

/// Candid-encodes the consent request for `method` with `arg`.
pub fn build_consent_args(
    method: &str,
    arg: &[u8],
    preferences: &ConsentPreferences,
) -> Result<Vec<u8>> {
    let request = ConsentMessageRequest {
        arg: ByteBuf::from(arg.to_vec()),
        method: method.to_string(),
        user_preferences: ConsentMessageSpec {
            metadata: ConsentMessageMetadata {
                utc_offset_minutes: preferences.utc_offset_minutes,
                language: preferences.language.clone(),
            },
            device_spec: Some(DisplaySpec::FieldsDisplay),
        },
    };
    Ok(candid::Encode!(&request)?)
}

// ============================================================================
// Replica transport
// ============================================================================

/// Outcome of submitting a call envelope to a replica.
#[derive(Debug, Clone)]
pub enum CallResponse {
    /// A certificate for the call's status came back synchronously.
    Certified(Vec<u8>),

    /// The call was accepted for asynchronous processing; poll for it.
    Accepted,

    /// The replica rejected the call without executing it.
    Rejected {
        reject_code: u64,
        reject_message: String,
    },
}

/// A connection to a replica, supplied by the caller.
///
/// Envelopes handed to this trait are complete CBOR bytes; implementations
/// only move them over HTTP (or any other channel) and hand bytes back.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Submits a call envelope to `/api/v3/canister/<id>/call`.
    async fn call(&self, canister_id: Principal, envelope: &[u8]) -> Result<CallResponse>;

    /// Submits a read-state envelope, returning the raw CBOR response
    /// (`{ certificate: <bytes> }`).
    async fn read_state(&self, canister_id: Principal, envelope: &[u8]) -> Result<Vec<u8>>;
}

/// Capped-backoff budget for status polling.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// The three byte artifacts of a certified consent round trip, plus the
/// decoded message. The artifacts go to the device verbatim.
#[derive(Debug, Clone)]
pub struct ConsentArtifacts {
    /// Canonical CBOR of the consent-message call (anonymous envelope).
    pub consent_request: Vec<u8>,

    /// The raw certificate proving the canister's response.
    pub certificate: Vec<u8>,

    /// The decoded consent message.
    pub consent_info: ConsentInfo,
}

/// A consent-message call ready for submission.
///
/// Holds the content map so the request id and the submitted envelope are
/// computed from the same ingress expiry.
#[derive(Debug, Clone)]
pub struct PreparedConsent {
    canister_id: Principal,
    content: RequestContent,
}

impl PreparedConsent {
    /// The id the replica will know this call by.
    #[must_use]
    pub fn request_id(&self) -> [u8; 32] {
        self.content.request_id()
    }

    /// The canister the call targets.
    #[must_use]
    pub const fn canister_id(&self) -> Principal {
        self.canister_id
    }
}

/// Drives the consent round trip against a replica.
pub struct ConsentVerifier {
    transport: Box<dyn ReplicaTransport>,
    root_key: Vec<u8>,
    preferences: ConsentPreferences,
    poll: PollPolicy,
}

/// What a verified certificate says about the call.
enum CertifiedStatus {
    Replied(Vec<u8>),
    Pending,
}

impl ConsentVerifier {
    /// A verifier against mainnet.
    #[must_use]
    pub fn new(transport: Box<dyn ReplicaTransport>) -> Self {
        Self {
            transport,
            root_key: MAINNET_ROOT_KEY.to_vec(),
            preferences: ConsentPreferences::default(),
            poll: PollPolicy::default(),
        }
    }

    /// Replaces the root key, for local replicas and testnets.
    #[must_use]
    pub fn with_root_key(mut self, root_key: Vec<u8>) -> Self {
        self.root_key = root_key;
        self
    }

    #[must_use]
    pub fn with_preferences(mut self, preferences: ConsentPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    #[must_use]
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// The root key when it differs from mainnet's.
    ///
    /// The device has the mainnet key built in, so only a custom key needs
    /// to travel with the signing context.
    #[must_use]
    pub fn custom_root_key(&self) -> Option<&[u8]> {
        (self.root_key != MAINNET_ROOT_KEY).then_some(self.root_key.as_slice())
    }

    /// Builds the anonymous consent-message call for `method` with `arg`.
    pub fn prepare(
        &self,
        canister_id: Principal,
        method: &str,
        arg: &[u8],
    ) -> Result<PreparedConsent> {
        let consent_arg = build_consent_args(method, arg, &self.preferences)?;
        Ok(PreparedConsent {
            canister_id,
            content: RequestContent::call(
                canister_id,
                CONSENT_MESSAGE_METHOD,
                consent_arg,
                Principal::anonymous(),
            ),
        })
    }

    /// Obtains a certified consent message for calling `method` on
    /// `canister_id` with `arg`.
    ///
    /// # Errors
    ///
    /// - [`Error::CallRejected`] when the replica or the canister refuses
    /// - [`Error::CertificateVerification`] when the response cannot be
    ///   certified against the root key
    /// - [`Error::PollingTimeout`] when the polling budget runs out
    pub async fn request_consent(
        &self,
        canister_id: Principal,
        method: &str,
        arg: &[u8],
    ) -> Result<ConsentArtifacts> {
        let prepared = self.prepare(canister_id, method, arg)?;
        self.submit(&prepared).await
    }

    /// Submits a prepared consent call and certifies its response.
    pub async fn submit(&self, prepared: &PreparedConsent) -> Result<ConsentArtifacts> {
        let content = &prepared.content;
        let canister_id = prepared.canister_id();
        let request_id = content.request_id();
        // The anonymous envelope has no signature fields, so the submitted
        // bytes are also the consent-request artifact the device checks.
        let envelope = Envelope::anonymous(content).to_cbor()?;

        debug!(canister = %canister_id, "requesting consent message");
        let certificate = match self.transport.call(canister_id, &envelope).await? {
            CallResponse::Certified(certificate) => {
                match self.certified_status(&certificate, canister_id, request_id)? {
                    CertifiedStatus::Replied(_) => certificate,
                    CertifiedStatus::Pending => {
                        self.poll_for_certificate(canister_id, request_id).await?
                    }
                }
            }
            CallResponse::Accepted => self.poll_for_certificate(canister_id, request_id).await?,
            CallResponse::Rejected {
                reject_code,
                reject_message,
            } => {
                return Err(Error::CallRejected {
                    code: reject_code,
                    message: reject_message,
                })
            }
        };

        let CertifiedStatus::Replied(reply) =
            self.certified_status(&certificate, canister_id, request_id)?
        else {
            return Err(Error::PollingTimeout {
                attempts: self.poll.max_attempts,
            });
        };

        let consent_info = decode_consent_reply(&reply)?;
        Ok(ConsentArtifacts {
            consent_request: envelope,
            certificate,
            consent_info,
        })
    }

    /// Reads `request_status/<id>` over anonymous envelopes until a
    /// certificate proves the call replied, within the polling budget.
    async fn poll_for_certificate(
        &self,
        canister_id: Principal,
        request_id: [u8; 32],
    ) -> Result<Vec<u8>> {
        let mut delay = self.poll.initial_delay;
        for attempt in 1..=self.poll.max_attempts {
            trace!(attempt, "polling request status");
            sleep(delay).await;
            delay = (delay * 2).min(self.poll.max_delay);

            let content = RequestContent::read_request_status(Principal::anonymous(), request_id);
            let envelope = Envelope::anonymous(&content).to_cbor()?;
            let response = self.transport.read_state(canister_id, &envelope).await?;
            let certificate = extract_certificate(&response)?;

            match self.certified_status(&certificate, canister_id, request_id)? {
                CertifiedStatus::Replied(_) => return Ok(certificate),
                CertifiedStatus::Pending => {}
            }
        }
        Err(Error::PollingTimeout {
            attempts: self.poll.max_attempts,
        })
    }

    /// Verifies a certificate and reads the call status out of it.
    ///
    /// Verification happens before any lookup; an unverifiable certificate
    /// yields nothing, not even a status.
    fn certified_status(
        &self,
        certificate: &[u8],
        canister_id: Principal,
        request_id: [u8; 32],
    ) -> Result<CertifiedStatus> {
        let certificate = Certificate::from_cbor(certificate)?;
        certificate.verify(canister_id, &self.root_key)?;

        let status_path: [&[u8]; 3] = [b"request_status", &request_id, b"status"];
        let status = match certificate.tree.lookup_path(&status_path) {
            LookupResult::Found(status) => status,
            // Not in this partial tree (yet): the call is still in flight.
            LookupResult::Absent | LookupResult::Unknown => return Ok(CertifiedStatus::Pending),
        };

        match status {
            b"replied" => {
                let reply_path: [&[u8]; 3] = [b"request_status", &request_id, b"reply"];
                match certificate.tree.lookup_path(&reply_path) {
                    LookupResult::Found(reply) => Ok(CertifiedStatus::Replied(reply.to_vec())),
                    _ => Err(Error::CertificateVerification {
                        reason: "status is replied but the reply is not certified".to_string(),
                    }),
                }
            }
            b"rejected" => Err(self.certified_rejection(&certificate, request_id)),
            b"processing" | b"received" => Ok(CertifiedStatus::Pending),
            // Terminal: the call completed but the reply has been pruned.
            b"done" => Err(Error::Decode(
                "request status is done and the reply is no longer available".to_string(),
            )),
            other => Err(Error::Decode(format!(
                "unknown request status {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn certified_rejection(&self, certificate: &Certificate, request_id: [u8; 32]) -> Error {
        let lookup = |leaf: &[u8]| {
            let path: [&[u8]; 3] = [b"request_status", &request_id, leaf];
            match certificate.tree.lookup_path(&path) {
                LookupResult::Found(bytes) => Some(bytes.to_vec()),
                _ => None,
            }
        };

        let code = lookup(b"reject_code")
            .and_then(|bytes| leb128::read::unsigned(&mut bytes.as_slice()).ok())
            .unwrap_or(0);
        let message = lookup(b"reject_message")
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| "call rejected".to_string());
        Error::CallRejected { code, message }
    }
}

/// Pulls the certificate bytes out of a read-state response.
fn extract_certificate(response: &[u8]) -> Result<Vec<u8>> {
    #[derive(Deserialize)]
    struct ReadStateResponse {
        certificate: ByteBuf,
    }

    let response: ReadStateResponse = serde_cbor::from_slice(response)?;
    Ok(response.certificate.into_vec())
}

/// Decodes the candid reply into the consent info, mapping ICRC-21 errors
/// to call rejections.
fn decode_consent_reply(reply: &[u8]) -> Result<ConsentInfo> {
    match candid::Decode!(reply, ConsentMessageResponse)? {
        ConsentMessageResponse::Ok(info) => Ok(info),
        ConsentMessageResponse::Err(err) => Err(Error::CallRejected {
            code: 0,
            message: err.description(),
        }),
    }
}

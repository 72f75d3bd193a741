//! Canonical request encoding and request-id hashing.
//!
//! Requests destined for a replica are CBOR maps wrapped in an envelope
//! `{ content, sender_pubkey?, sender_sig? }`. The device signs the
//! self-describing CBOR encoding of `{ content }`, so the exact byte
//! encoding produced here is load-bearing: any drift changes the signed
//! payload and the request id.
//!
//! Request ids use the representation-independent hash: each field is
//! hashed as `sha256(name) || sha256(value)`, the pairs are sorted
//! bytewise, concatenated and hashed again. Naturals are LEB128-encoded,
//! strings are UTF-8, blobs are raw, and arrays concatenate the hashes of
//! their elements.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use candid::Principal;
use serde::Serialize;
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// How far in the future a request expires.
const INGRESS_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// A content map ready to be signed and submitted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum RequestContent {
    /// An update call to a canister method.
    Call {
        canister_id: Principal,
        method_name: String,
        arg: ByteBuf,
        sender: Principal,
        ingress_expiry: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        nonce: Option<ByteBuf>,
    },
    /// A read of paths in the replica state tree.
    ReadState {
        sender: Principal,
        paths: Vec<Vec<ByteBuf>>,
        ingress_expiry: u64,
    },
}

impl RequestContent {
    /// Builds a call request expiring [`INGRESS_EXPIRY`] from now.
    #[must_use]
    pub fn call(
        canister_id: Principal,
        method_name: impl Into<String>,
        arg: Vec<u8>,
        sender: Principal,
    ) -> Self {
        Self::Call {
            canister_id,
            method_name: method_name.into(),
            arg: ByteBuf::from(arg),
            sender,
            ingress_expiry: expiry_from_now(),
            nonce: None,
        }
    }

    /// Builds a read of `request_status/<request_id>` for polling a
    /// submitted call.
    #[must_use]
    pub fn read_request_status(sender: Principal, request_id: [u8; 32]) -> Self {
        Self::ReadState {
            sender,
            paths: vec![vec![
                ByteBuf::from(b"request_status".to_vec()),
                ByteBuf::from(request_id.to_vec()),
            ]],
            ingress_expiry: expiry_from_now(),
        }
    }

    /// The representation-independent hash identifying this request.
    #[must_use]
    pub fn request_id(&self) -> [u8; 32] {
        let fields = match self {
            Self::Call {
                canister_id,
                method_name,
                arg,
                sender,
                ingress_expiry,
                nonce,
            } => {
                let mut fields = vec![
                    ("request_type", Value::String("call")),
                    ("canister_id", Value::Bytes(canister_id.as_slice())),
                    ("method_name", Value::String(method_name)),
                    ("arg", Value::Bytes(arg)),
                    ("sender", Value::Bytes(sender.as_slice())),
                    ("ingress_expiry", Value::Nat(*ingress_expiry)),
                ];
                if let Some(nonce) = nonce {
                    fields.push(("nonce", Value::Bytes(nonce)));
                }
                fields
            }
            Self::ReadState {
                sender,
                paths,
                ingress_expiry,
            } => {
                let paths = paths
                    .iter()
                    .map(|path| {
                        Value::Array(path.iter().map(|label| Value::Bytes(label)).collect())
                    })
                    .collect();
                vec![
                    ("request_type", Value::String("read_state")),
                    ("sender", Value::Bytes(sender.as_slice())),
                    ("paths", Value::Array(paths)),
                    ("ingress_expiry", Value::Nat(*ingress_expiry)),
                ]
            }
        };
        representation_independent_hash(&fields)
    }

    /// The bytes the device signs: self-describing CBOR of the content
    /// wrapped in an envelope without signature fields.
    pub fn to_signable(&self) -> Result<Vec<u8>> {
        to_self_describing_cbor(&Envelope {
            content: self,
            sender_pubkey: None,
            sender_sig: None,
        })
    }
}

/// The wire envelope around a request content map.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub content: &'a RequestContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_pubkey: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_sig: Option<ByteBuf>,
}

impl<'a> Envelope<'a> {
    /// An envelope for anonymous submission, no signature attached.
    #[must_use]
    pub const fn anonymous(content: &'a RequestContent) -> Self {
        Self {
            content,
            sender_pubkey: None,
            sender_sig: None,
        }
    }

    /// An envelope carrying a DER public key and signature.
    #[must_use]
    pub fn signed(content: &'a RequestContent, der_pubkey: Vec<u8>, signature: Vec<u8>) -> Self {
        Self {
            content,
            sender_pubkey: Some(ByteBuf::from(der_pubkey)),
            sender_sig: Some(ByteBuf::from(signature)),
        }
    }

    /// Serializes the envelope as self-describing CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        to_self_describing_cbor(self)
    }
}

/// Serializes a value as CBOR prefixed with the self-describe tag 55799.
pub fn to_self_describing_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut serializer = serde_cbor::Serializer::new(&mut bytes);
    serializer.self_describe()?;
    value.serialize(&mut serializer)?;
    Ok(bytes)
}

/// Current time plus [`INGRESS_EXPIRY`], in nanoseconds since the epoch.
fn expiry_from_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now + INGRESS_EXPIRY).as_nanos() as u64
}

/// A field value in the representation-independent hash.
enum Value<'a> {
    Bytes(&'a [u8]),
    String(&'a str),
    Nat(u64),
    Array(Vec<Value<'a>>),
}

fn hash_value(value: &Value<'_>) -> [u8; 32] {
    match value {
        Value::Bytes(bytes) => Sha256::digest(bytes).into(),
        Value::String(s) => Sha256::digest(s.as_bytes()).into(),
        Value::Nat(n) => {
            let mut encoded = Vec::new();
            // Vec<u8> writes are infallible.
            let _ = leb128::write::unsigned(&mut encoded, *n);
            Sha256::digest(&encoded).into()
        }
        Value::Array(items) => {
            let mut hasher = Sha256::new();
            for item in items {
                hasher.update(hash_value(item));
            }
            hasher.finalize().into()
        }
    }
}

fn representation_independent_hash(fields: &[(&str, Value<'_>)]) -> [u8; 32] {
    let mut pairs: Vec<([u8; 32], [u8; 32])> = fields
        .iter()
        .map(|(name, value)| {
            (
                Sha256::digest(name.as_bytes()).into(),
                hash_value(value),
            )
        })
        .collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (name_hash, value_hash) in pairs {
        hasher.update(name_hash);
        hasher.update(value_hash);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_matches_interface_spec_example() {
        // Minimal call map from the interface specification's worked
        // example of request-id computation.
        let fields = [
            ("request_type", Value::String("call")),
            (
                "canister_id",
                Value::Bytes(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0xD2]),
            ),
            ("method_name", Value::String("hello")),
            ("arg", Value::Bytes(b"DIDL\x00\xFD*")),
        ];
        assert_eq!(
            hex::encode(representation_independent_hash(&fields)),
            "8781291c347db32a9d8c10eb62b710fce5a93be676474c42babc74c51858f94b"
        );
    }

    #[test]
    fn request_id_is_stable_across_clones() {
        let content = RequestContent::call(
            Principal::management_canister(),
            "install_code",
            vec![1, 2, 3],
            Principal::anonymous(),
        );
        assert_eq!(content.request_id(), content.clone().request_id());
    }

    #[test]
    fn request_id_depends_on_arg() {
        let a = RequestContent::Call {
            canister_id: Principal::anonymous(),
            method_name: "m".to_string(),
            arg: ByteBuf::from(vec![1]),
            sender: Principal::anonymous(),
            ingress_expiry: 1,
            nonce: None,
        };
        let b = RequestContent::Call {
            canister_id: Principal::anonymous(),
            method_name: "m".to_string(),
            arg: ByteBuf::from(vec![2]),
            sender: Principal::anonymous(),
            ingress_expiry: 1,
            nonce: None,
        };
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn signable_is_self_describing_cbor() {
        let content = RequestContent::read_request_status(Principal::anonymous(), [7; 32]);
        let signable = content.to_signable().unwrap();
        // CBOR self-describe tag 55799.
        assert_eq!(&signable[..3], &[0xD9, 0xD9, 0xF7]);
        // A one-key map {"content": ...} follows the tag.
        assert_eq!(signable[3], 0xA1);
    }

    #[test]
    fn envelope_skips_absent_signature_fields() {
        let content = RequestContent::read_request_status(Principal::anonymous(), [0; 32]);
        let anonymous = Envelope::anonymous(&content).to_cbor().unwrap();
        let signed = Envelope::signed(&content, vec![1; 88], vec![2; 64])
            .to_cbor()
            .unwrap();
        assert!(signed.len() > anonymous.len());
        assert_eq!(anonymous[3], 0xA1);
        assert_eq!(signed[3], 0xA3);
    }

    #[test]
    fn read_state_paths_shape() {
        let content = RequestContent::read_request_status(Principal::anonymous(), [9; 32]);
        match &content {
            RequestContent::ReadState { paths, .. } => {
                assert_eq!(paths.len(), 1);
                assert_eq!(paths[0][0].as_slice(), b"request_status");
                assert_eq!(paths[0][1].as_slice(), &[9; 32]);
            }
            RequestContent::Call { .. } => panic!("expected read_state"),
        }
    }
}

//! Replica certificate decoding and verification.
//!
//! A certificate is a CBOR value `{ tree, signature, delegation? }` where
//! `tree` is a partial state tree and `signature` is a BLS12-381 threshold
//! signature over the tree's root hash. Verification checks the signature
//! against the root public key (or, through a single level of delegation,
//! against a subnet key certified by the root), then values are read out of
//! the tree by path lookup.
//!
//! # Hash Tree
//!
//! Trees are encoded as tagged CBOR arrays:
//!
//! ```text
//! [0]                 Empty
//! [1, left, right]    Fork
//! [2, label, subtree] Labeled
//! [3, bytes]          Leaf
//! [4, digest]         Pruned
//! ```
//!
//! Digests are domain-separated SHA-256 (`ic-hashtree-empty`, `-fork`,
//! `-labeled`, `-leaf`); a pruned node stands in for its subtree's digest,
//! so pruning never changes the root hash.

use core::fmt;

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{G1Affine, G1Projective, G2Affine, G2Prepared, Gt, multi_miller_loop};
use candid::Principal;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::{Error, Result};

/// Domain-separation tag of the IC BLS signature scheme.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Prefix of the signed message, ahead of the root hash.
const STATE_ROOT_DOMAIN: &[u8] = b"\x0Dic-state-root";

/// Length of a G2 public key in compressed form.
const BLS_PUBKEY_LEN: usize = 96;

/// Length of a G1 signature in compressed form.
const BLS_SIGNATURE_LEN: usize = 48;

/// A partial state tree with pruned branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashTree {
    Empty,
    Fork(Box<HashTree>, Box<HashTree>),
    Labeled(Vec<u8>, Box<HashTree>),
    Leaf(Vec<u8>),
    Pruned([u8; 32]),
}

/// Outcome of a path lookup in a partial tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult<'a> {
    /// The path leads to a leaf with this value.
    Found(&'a [u8]),

    /// The tree proves the path is absent.
    Absent,

    /// The path runs into a pruned branch; presence cannot be decided.
    Unknown,
}

impl HashTree {
    /// The root hash of the (sub)tree.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        fn sep(hasher: &mut Sha256, tag: &str) {
            hasher.update([tag.len() as u8]);
            hasher.update(tag.as_bytes());
        }

        let mut hasher = Sha256::new();
        match self {
            Self::Empty => sep(&mut hasher, "ic-hashtree-empty"),
            Self::Fork(left, right) => {
                sep(&mut hasher, "ic-hashtree-fork");
                hasher.update(left.digest());
                hasher.update(right.digest());
            }
            Self::Labeled(label, subtree) => {
                sep(&mut hasher, "ic-hashtree-labeled");
                hasher.update(label);
                hasher.update(subtree.digest());
            }
            Self::Leaf(bytes) => {
                sep(&mut hasher, "ic-hashtree-leaf");
                hasher.update(bytes);
            }
            Self::Pruned(digest) => return *digest,
        }
        hasher.finalize().into()
    }

    /// Looks up a value by path.
    #[must_use]
    pub fn lookup_path(&self, path: &[&[u8]]) -> LookupResult<'_> {
        let Some((label, rest)) = path.split_first() else {
            return match self {
                Self::Leaf(bytes) => LookupResult::Found(bytes),
                Self::Pruned(_) => LookupResult::Unknown,
                Self::Empty | Self::Fork(..) | Self::Labeled(..) => LookupResult::Absent,
            };
        };

        match self.find_label(label) {
            LabelLookup::Found(subtree) => subtree.lookup_path(rest),
            LabelLookup::Unknown => LookupResult::Unknown,
            LabelLookup::Absent => LookupResult::Absent,
        }
    }

    /// Searches the fork spine at this level for a labeled subtree.
    fn find_label(&self, label: &[u8]) -> LabelLookup<'_> {
        match self {
            Self::Labeled(l, subtree) if l.as_slice() == label => LabelLookup::Found(subtree),
            Self::Labeled(..) | Self::Leaf(_) | Self::Empty => LabelLookup::Absent,
            Self::Pruned(_) => LabelLookup::Unknown,
            Self::Fork(left, right) => match left.find_label(label) {
                LabelLookup::Absent => right.find_label(label),
                LabelLookup::Unknown => match right.find_label(label) {
                    found @ LabelLookup::Found(_) => found,
                    _ => LabelLookup::Unknown,
                },
                found => found,
            },
        }
    }
}

enum LabelLookup<'a> {
    Found(&'a HashTree),
    Absent,
    Unknown,
}

impl<'de> Deserialize<'de> for HashTree {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TreeVisitor;

        impl<'de> Visitor<'de> for TreeVisitor {
            type Value = HashTree;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a tagged hash-tree array")
            }

            fn visit_seq<A>(self, mut seq: A) -> core::result::Result<HashTree, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let tag: u8 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::custom("hash tree node is missing its tag"))?;
                let missing = || de::Error::custom("hash tree node is truncated");
                match tag {
                    0 => Ok(HashTree::Empty),
                    1 => {
                        let left: HashTree = seq.next_element()?.ok_or_else(missing)?;
                        let right: HashTree = seq.next_element()?.ok_or_else(missing)?;
                        Ok(HashTree::Fork(Box::new(left), Box::new(right)))
                    }
                    2 => {
                        let label: ByteBuf = seq.next_element()?.ok_or_else(missing)?;
                        let subtree: HashTree = seq.next_element()?.ok_or_else(missing)?;
                        Ok(HashTree::Labeled(label.into_vec(), Box::new(subtree)))
                    }
                    3 => {
                        let bytes: ByteBuf = seq.next_element()?.ok_or_else(missing)?;
                        Ok(HashTree::Leaf(bytes.into_vec()))
                    }
                    4 => {
                        let digest: ByteBuf = seq.next_element()?.ok_or_else(missing)?;
                        let digest: [u8; 32] = digest
                            .as_slice()
                            .try_into()
                            .map_err(|_| de::Error::custom("pruned digest must be 32 bytes"))?;
                        Ok(HashTree::Pruned(digest))
                    }
                    other => Err(de::Error::custom(format!(
                        "unknown hash tree tag {other}"
                    ))),
                }
            }
        }

        deserializer.deserialize_seq(TreeVisitor)
    }
}

/// A signature delegating certification to a subnet key.
#[derive(Debug, Clone, Deserialize)]
pub struct Delegation {
    pub subnet_id: ByteBuf,
    pub certificate: ByteBuf,
}

/// A decoded replica certificate.
#[derive(Debug, Clone, Deserialize)]
pub struct Certificate {
    pub tree: HashTree,
    pub signature: ByteBuf,
    #[serde(default)]
    pub delegation: Option<Delegation>,
}

impl Certificate {
    /// Decodes a certificate from its CBOR encoding.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    /// Verifies the certificate against `root_key` (DER-encoded).
    ///
    /// When a delegation is present, the delegation certificate is verified
    /// against the root key first, `effective_canister_id` is checked
    /// against the delegated canister ranges, and this certificate is then
    /// verified against the subnet key. Only one level of delegation is
    /// accepted.
    pub fn verify(&self, effective_canister_id: Principal, root_key: &[u8]) -> Result<()> {
        let signing_key = match &self.delegation {
            None => root_key.to_vec(),
            Some(delegation) => delegation.subnet_key(effective_canister_id, root_key)?,
        };

        let mut message =
            Vec::with_capacity(STATE_ROOT_DOMAIN.len() + 32);
        message.extend_from_slice(STATE_ROOT_DOMAIN);
        message.extend_from_slice(&self.tree.digest());

        let pubkey = raw_bls_key(&signing_key)?;
        let signature: &[u8; BLS_SIGNATURE_LEN] =
            self.signature.as_slice().try_into().map_err(|_| {
                Error::CertificateVerification {
                    reason: format!(
                        "signature must be {BLS_SIGNATURE_LEN} bytes (is {})",
                        self.signature.len()
                    ),
                }
            })?;

        trace!("verifying certificate signature");
        if !bls_verify(signature, pubkey, &message) {
            return Err(Error::CertificateVerification {
                reason: "signature does not match the tree root hash".to_string(),
            });
        }
        Ok(())
    }
}

impl Delegation {
    /// Extracts and certifies the subnet's public key.
    fn subnet_key(&self, effective_canister_id: Principal, root_key: &[u8]) -> Result<Vec<u8>> {
        let inner = Certificate::from_cbor(&self.certificate)?;
        if inner.delegation.is_some() {
            return Err(Error::CertificateVerification {
                reason: "nested delegations are not accepted".to_string(),
            });
        }
        inner.verify(effective_canister_id, root_key)?;

        let subnet_path: [&[u8]; 3] = [b"subnet", &self.subnet_id, b"canister_ranges"];
        let LookupResult::Found(ranges) = inner.tree.lookup_path(&subnet_path) else {
            return Err(Error::CertificateVerification {
                reason: "delegation certificate does not certify canister ranges".to_string(),
            });
        };
        let ranges: Vec<(ByteBuf, ByteBuf)> = serde_cbor::from_slice(ranges)?;
        let in_range = ranges.iter().any(|(start, end)| {
            Principal::from_slice(start) <= effective_canister_id
                && effective_canister_id <= Principal::from_slice(end)
        });
        if !in_range {
            return Err(Error::CertificateVerification {
                reason: "canister is outside the delegated subnet's ranges".to_string(),
            });
        }

        let key_path: [&[u8]; 3] = [b"subnet", &self.subnet_id, b"public_key"];
        match inner.tree.lookup_path(&key_path) {
            LookupResult::Found(key) => Ok(key.to_vec()),
            _ => Err(Error::CertificateVerification {
                reason: "delegation certificate does not certify the subnet key".to_string(),
            }),
        }
    }
}

/// Strips the DER wrapping of a BLS12-381 G2 public key.
fn raw_bls_key(der: &[u8]) -> Result<&[u8; BLS_PUBKEY_LEN]> {
    if der.len() < BLS_PUBKEY_LEN {
        return Err(Error::CertificateVerification {
            reason: format!("BLS public key too short ({} bytes)", der.len()),
        });
    }
    // The compressed point is the last 96 bytes of the DER encoding.
    der[der.len() - BLS_PUBKEY_LEN..]
        .try_into()
        .map_err(|_| Error::CertificateVerification {
            reason: "malformed BLS public key".to_string(),
        })
}

/// Checks `e(signature, g2) == e(hash(message), pubkey)`.
fn bls_verify(
    signature: &[u8; BLS_SIGNATURE_LEN],
    pubkey: &[u8; BLS_PUBKEY_LEN],
    message: &[u8],
) -> bool {
    let Some(signature) = Option::<G1Affine>::from(G1Affine::from_compressed(signature)) else {
        return false;
    };
    let Some(pubkey) = Option::<G2Affine>::from(G2Affine::from_compressed(pubkey)) else {
        return false;
    };

    let hashed =
        <G1Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(message, BLS_DST);

    let pairing = multi_miller_loop(&[
        (&-signature, &G2Prepared::from(G2Affine::generator())),
        (&G1Affine::from(hashed), &G2Prepared::from(pubkey)),
    ])
    .final_exponentiation();
    pairing == Gt::identity()
}

/// Fixture builders shared by certificate and consent-flow tests.
#[cfg(test)]
pub(crate) mod testing {
    use bls12_381::Scalar;

    use super::*;

    pub(crate) fn fork(l: HashTree, r: HashTree) -> HashTree {
        HashTree::Fork(Box::new(l), Box::new(r))
    }

    pub(crate) fn labeled(l: &[u8], t: HashTree) -> HashTree {
        HashTree::Labeled(l.to_vec(), Box::new(t))
    }

    pub(crate) fn leaf(bytes: &[u8]) -> HashTree {
        HashTree::Leaf(bytes.to_vec())
    }

    /// Signs the state-root message for `tree` with a locally generated
    /// BLS key, returning the certificate and the matching DER "root key".
    pub(crate) fn self_signed_certificate(tree: HashTree, secret: u64) -> (Certificate, Vec<u8>) {
        let sk = Scalar::from(secret);
        let pk = G2Affine::from(G2Affine::generator() * sk);

        let mut message = STATE_ROOT_DOMAIN.to_vec();
        message.extend_from_slice(&tree.digest());
        let hashed =
            <G1Projective as HashToCurve<ExpandMsgXmd<Sha256>>>::hash_to_curve(&message, BLS_DST);
        let signature = G1Affine::from(hashed * sk);

        // Any DER prefix works; only the trailing 96 bytes are the key.
        let mut der = vec![0x30; 37];
        der.extend_from_slice(&pk.to_compressed());

        let certificate = Certificate {
            tree,
            signature: ByteBuf::from(signature.to_compressed().to_vec()),
            delegation: None,
        };
        (certificate, der)
    }

    /// Serializable mirror of [`Certificate`] for building test fixtures.
    #[derive(serde::Serialize)]
    pub(crate) struct CertificateWire {
        tree: serde_cbor::Value,
        signature: ByteBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        delegation: Option<DelegationWire>,
    }

    #[derive(serde::Serialize)]
    pub(crate) struct DelegationWire {
        subnet_id: ByteBuf,
        certificate: ByteBuf,
    }

    impl CertificateWire {
        pub(crate) fn to_cbor(&self) -> Vec<u8> {
            serde_cbor::to_vec(self).unwrap()
        }
    }

    impl From<&Certificate> for CertificateWire {
        fn from(certificate: &Certificate) -> Self {
            fn tree_value(tree: &HashTree) -> serde_cbor::Value {
                use serde_cbor::Value;
                match tree {
                    HashTree::Empty => Value::Array(vec![Value::Integer(0)]),
                    HashTree::Fork(l, r) => {
                        Value::Array(vec![Value::Integer(1), tree_value(l), tree_value(r)])
                    }
                    HashTree::Labeled(label, t) => Value::Array(vec![
                        Value::Integer(2),
                        Value::Bytes(label.clone()),
                        tree_value(t),
                    ]),
                    HashTree::Leaf(bytes) => {
                        Value::Array(vec![Value::Integer(3), Value::Bytes(bytes.clone())])
                    }
                    HashTree::Pruned(digest) => {
                        Value::Array(vec![Value::Integer(4), Value::Bytes(digest.to_vec())])
                    }
                }
            }

            Self {
                tree: tree_value(&certificate.tree),
                signature: certificate.signature.clone(),
                delegation: certificate.delegation.as_ref().map(|d| DelegationWire {
                    subnet_id: d.subnet_id.clone(),
                    certificate: d.certificate.clone(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{self_signed_certificate, CertificateWire};
    use super::*;

    /// The pruned example tree from the interface specification.
    fn example_tree() -> HashTree {
        use super::testing::{fork, labeled};
        use HashTree::{Empty, Leaf};

        fork(
            fork(
                labeled(
                    b"a",
                    fork(
                        fork(labeled(b"x", Leaf(b"hello".to_vec())), Empty),
                        labeled(b"y", Leaf(b"world".to_vec())),
                    ),
                ),
                labeled(b"b", Leaf(b"good".to_vec())),
            ),
            fork(labeled(b"c", Empty), labeled(b"d", Leaf(b"morning".to_vec()))),
        )
    }

    #[test]
    fn digest_matches_interface_spec_example() {
        assert_eq!(
            hex::encode(example_tree().digest()),
            "eb5c5b2195e62d996b84c9bcc8259d19a83786a2f59e0878cec84c811f669aa0"
        );
    }

    #[test]
    fn pruning_preserves_the_root_hash() {
        let tree = example_tree();
        let full_digest = tree.digest();

        let pruned = match tree {
            HashTree::Fork(left, right) => {
                HashTree::Fork(Box::new(HashTree::Pruned(left.digest())), right)
            }
            _ => unreachable!(),
        };
        assert_eq!(pruned.digest(), full_digest);
    }

    #[test]
    fn lookup_finds_certified_values() {
        let tree = example_tree();
        assert_eq!(
            tree.lookup_path(&[b"a", b"x"]),
            LookupResult::Found(b"hello")
        );
        assert_eq!(tree.lookup_path(&[b"b"]), LookupResult::Found(b"good"));
        assert_eq!(
            tree.lookup_path(&[b"d"]),
            LookupResult::Found(b"morning")
        );
        assert_eq!(tree.lookup_path(&[b"nope"]), LookupResult::Absent);
        assert_eq!(tree.lookup_path(&[b"a", b"z"]), LookupResult::Absent);
    }

    #[test]
    fn lookup_through_pruned_branch_is_unknown() {
        let tree = HashTree::Fork(
            Box::new(HashTree::Pruned([0; 32])),
            Box::new(HashTree::Labeled(
                b"b".to_vec(),
                Box::new(HashTree::Leaf(b"good".to_vec())),
            )),
        );
        assert_eq!(tree.lookup_path(&[b"a", b"x"]), LookupResult::Unknown);
        assert_eq!(tree.lookup_path(&[b"b"]), LookupResult::Found(b"good"));
    }

    #[test]
    fn decodes_tagged_cbor_arrays() {
        // [1, [2, "lbl", [3, "val"]], [0]]
        let data = serde_cbor::to_vec(&serde_cbor::Value::Array(vec![
            serde_cbor::Value::Integer(1),
            serde_cbor::Value::Array(vec![
                serde_cbor::Value::Integer(2),
                serde_cbor::Value::Bytes(b"lbl".to_vec()),
                serde_cbor::Value::Array(vec![
                    serde_cbor::Value::Integer(3),
                    serde_cbor::Value::Bytes(b"val".to_vec()),
                ]),
            ]),
            serde_cbor::Value::Array(vec![serde_cbor::Value::Integer(0)]),
        ]))
        .unwrap();

        let tree: HashTree = serde_cbor::from_slice(&data).unwrap();
        assert_eq!(
            tree,
            HashTree::Fork(
                Box::new(HashTree::Labeled(
                    b"lbl".to_vec(),
                    Box::new(HashTree::Leaf(b"val".to_vec()))
                )),
                Box::new(HashTree::Empty),
            )
        );
    }

    #[test]
    fn verifies_a_well_signed_certificate() {
        let (certificate, root_key) = self_signed_certificate(example_tree(), 42);
        certificate
            .verify(Principal::anonymous(), &root_key)
            .unwrap();
    }

    #[test]
    fn rejects_a_certificate_signed_by_another_key() {
        let (certificate, _) = self_signed_certificate(example_tree(), 42);
        let (_, other_root_key) = self_signed_certificate(example_tree(), 43);
        let err = certificate
            .verify(Principal::anonymous(), &other_root_key)
            .unwrap_err();
        assert!(matches!(err, Error::CertificateVerification { .. }));
    }

    #[test]
    fn rejects_a_tampered_tree() {
        let (mut certificate, root_key) = self_signed_certificate(example_tree(), 42);
        certificate.tree = HashTree::Leaf(b"tampered".to_vec());
        let err = certificate
            .verify(Principal::anonymous(), &root_key)
            .unwrap_err();
        assert!(matches!(err, Error::CertificateVerification { .. }));
    }

    #[test]
    fn rejects_nested_delegations() {
        let (inner, root_key) = self_signed_certificate(example_tree(), 42);
        let mut inner_with_delegation = inner.clone();
        inner_with_delegation.delegation = Some(Delegation {
            subnet_id: ByteBuf::from(vec![1]),
            certificate: ByteBuf::from(CertificateWire::from(&inner).to_cbor()),
        });

        let outer = Certificate {
            tree: example_tree(),
            signature: ByteBuf::from(vec![0; BLS_SIGNATURE_LEN]),
            delegation: Some(Delegation {
                subnet_id: ByteBuf::from(vec![1]),
                certificate: ByteBuf::from(
                    CertificateWire::from(&inner_with_delegation).to_cbor(),
                ),
            }),
        };
        let err = outer.verify(Principal::anonymous(), &root_key).unwrap_err();
        match err {
            Error::CertificateVerification { reason } => {
                assert!(reason.contains("nested"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

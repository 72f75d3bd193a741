//! Key material and derivation paths.
//!
//! This module provides the two immutable pieces of identity state:
//!
//! - [`DerivationPath`]: which key on the device's master seed to use
//! - [`Secp256k1PublicKey`]: the raw/DER forms of the device's public key,
//!   and the self-authenticating principal derived from it
//!
//! # Derivation Paths
//!
//! The Internet Computer app derives keys under coin type 223:
//!
//! ```text
//! m/44'/223'/0'/0/<index>        index in [0, 255]
//! ```
//!
//! The index bound is enforced at construction, before any device I/O.
//!
//! # Example
//!
//! ```
//! use icp_ledger_signer_core::keys::DerivationPath;
//!
//! let path = DerivationPath::from_index(3).unwrap();
//! assert_eq!(path.to_string(), "m/44'/223'/0'/0/3");
//! assert!(DerivationPath::from_index(256).is_err());
//! ```

use core::fmt;

use candid::Principal;
use k256::PublicKey;

use crate::error::{Error, Result};

/// Hardened-derivation bit.
const HARDENED: u32 = 0x8000_0000;

/// SLIP-0044 coin type for the Internet Computer.
const COIN_TYPE: u32 = 223;

/// DER prefix of a SubjectPublicKeyInfo wrapping an uncompressed secp256k1
/// point (the 65-byte SEC1 encoding follows directly).
const DER_PREFIX: [u8; 23] = [
    0x30, 0x56, 0x30, 0x10, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x05,
    0x2B, 0x81, 0x04, 0x00, 0x0A, 0x03, 0x42, 0x00,
];

/// An immutable BIP-44 derivation path for the Internet Computer app.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    index: u8,
}

impl DerivationPath {
    /// Builds the path `m/44'/223'/0'/0/<index>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityCreation`] when `index` is outside
    /// `[0, 255]`; no device I/O happens for a rejected index.
    pub fn from_index(index: u32) -> Result<Self> {
        let index = u8::try_from(index).map_err(|_| Error::IdentityCreation {
            reason: format!("derivation index {index} must be between 0 and 255 inclusive"),
        })?;
        Ok(Self { index })
    }

    /// The account index, the only varying component.
    #[must_use]
    pub const fn index(&self) -> u8 {
        self.index
    }

    /// The five path components with hardening bits applied.
    #[must_use]
    pub const fn components(&self) -> [u32; 5] {
        [
            44 | HARDENED,
            COIN_TYPE | HARDENED,
            HARDENED,
            0,
            self.index as u32,
        ]
    }

    /// Serializes the path for the device: a component count byte followed
    /// by each component as little-endian u32.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let components = self.components();
        let mut bytes = Vec::with_capacity(1 + components.len() * 4);
        bytes.push(components.len() as u8);
        for component in components {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
        bytes
    }
}

impl Default for DerivationPath {
    fn default() -> Self {
        Self { index: 0 }
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/44'/{COIN_TYPE}'/0'/0/{}", self.index)
    }
}

/// A secp256k1 public key as reported by the device.
///
/// Fetched once at identity creation and immutable afterwards; every later
/// session compares the device's current key against this one to detect
/// device substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secp256k1PublicKey {
    /// Uncompressed SEC1 point (`0x04 || x || y`).
    raw: [u8; Self::RAW_LEN],
}

impl Secp256k1PublicKey {
    /// Length of the uncompressed SEC1 encoding.
    pub const RAW_LEN: usize = 65;

    /// Parses and validates an uncompressed SEC1 point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the bytes are not a valid point on
    /// the curve.
    pub fn from_raw(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::RAW_LEN] = bytes.try_into().map_err(|_| {
            Error::Decode(format!(
                "public key must be {} bytes (is {})",
                Self::RAW_LEN,
                bytes.len()
            ))
        })?;
        PublicKey::from_sec1_bytes(&raw)
            .map_err(|_| Error::Decode("invalid secp256k1 public key".to_string()))?;
        Ok(Self { raw })
    }

    /// Parses a DER-encoded SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on a malformed encoding.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DER_PREFIX.len() + Self::RAW_LEN || bytes[..DER_PREFIX.len()] != DER_PREFIX
        {
            return Err(Error::Decode(
                "invalid DER-encoded secp256k1 public key".to_string(),
            ));
        }
        Self::from_raw(&bytes[DER_PREFIX.len()..])
    }

    /// The raw SEC1 bytes.
    #[must_use]
    pub const fn as_raw(&self) -> &[u8; Self::RAW_LEN] {
        &self.raw
    }

    /// The DER-encoded SubjectPublicKeyInfo form, as placed in request
    /// envelopes.
    #[must_use]
    pub fn to_der(&self) -> Vec<u8> {
        let mut der = Vec::with_capacity(DER_PREFIX.len() + Self::RAW_LEN);
        der.extend_from_slice(&DER_PREFIX);
        der.extend_from_slice(&self.raw);
        der
    }

    /// The self-authenticating principal for this key.
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::self_authenticating(self.to_der())
    }

    /// Hex encoding of the raw key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Generator point of secp256k1: a known-valid public key.
    const GENERATOR_HEX: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

    fn generator_key() -> Secp256k1PublicKey {
        Secp256k1PublicKey::from_raw(&hex::decode(GENERATOR_HEX).unwrap()).unwrap()
    }

    #[test]
    fn derivation_path_formats() {
        let path = DerivationPath::from_index(0).unwrap();
        assert_eq!(path.to_string(), "m/44'/223'/0'/0/0");

        let path = DerivationPath::from_index(255).unwrap();
        assert_eq!(path.to_string(), "m/44'/223'/0'/0/255");
    }

    #[test]
    fn derivation_index_bounds() {
        for index in [0u32, 1, 254, 255] {
            assert!(DerivationPath::from_index(index).is_ok());
        }
        for index in [256u32, 1000, u32::MAX] {
            let err = DerivationPath::from_index(index).unwrap_err();
            assert!(matches!(err, Error::IdentityCreation { .. }));
        }
    }

    #[test]
    fn derivation_path_wire_encoding() {
        let path = DerivationPath::from_index(1).unwrap();
        let wire = path.to_wire();
        assert_eq!(wire.len(), 21);
        assert_eq!(wire[0], 5);
        // 44' little-endian
        assert_eq!(&wire[1..5], &[0x2C, 0x00, 0x00, 0x80]);
        // 223' little-endian
        assert_eq!(&wire[5..9], &[0xDF, 0x00, 0x00, 0x80]);
        // final component is the plain index
        assert_eq!(&wire[17..21], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn public_key_round_trips_der() {
        let key = generator_key();
        let der = key.to_der();
        assert_eq!(der.len(), 88);
        assert_eq!(Secp256k1PublicKey::from_der(&der).unwrap(), key);
    }

    #[test]
    fn public_key_rejects_invalid_point() {
        let err = Secp256k1PublicKey::from_raw(&[0x04; 65]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let err = Secp256k1PublicKey::from_raw(&[0x04; 33]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn principal_is_self_authenticating() {
        let key = generator_key();
        let principal = key.principal();
        assert_eq!(
            principal,
            Principal::self_authenticating(key.to_der())
        );
        // Self-authenticating principals are 29 bytes and end in 0x02.
        assert_eq!(principal.as_slice().len(), 29);
        assert_eq!(principal.as_slice()[28], 0x02);
    }
}

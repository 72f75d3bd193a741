//! Internet Computer Ledger Signer Core Library
//!
//! This crate signs Internet Computer requests with a Ledger hardware
//! wallet: secp256k1 keys derived on the device, canonical CBOR request
//! encoding, and the ICRC-21 consent flow for certified human-readable
//! signing.
//!
//! # Overview
//!
//! With [ICRC-21], canisters can describe a call in words before the user
//! approves it. This library drives that flow end to end: it asks the
//! canister for a consent message over an anonymous call, verifies the
//! replica's certificate for the response, and hands the certified
//! artifacts to the device so the screen shows exactly what is signed.
//!
//! This library provides:
//!
//! - **Identities**: the [`identity::Identity`] contract, a hardware-backed
//!   [`identity::LedgerIdentity`], and the anonymous identity
//! - **Request Canonicalization**: self-describing CBOR envelopes and
//!   representation-independent request ids
//! - **Consent Verification**: ICRC-21 round trips certified against the
//!   root key, including BLS12-381 certificate checks
//! - **Device Integration**: the Internet Computer app protocol over
//!   pluggable transports
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Identity    │   Request    │   Consent    │    Version    │
//! │   Adapters    │  Encoding    │  Verifier    │     Gate      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Internet Computer App Layer                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────────────┐ │
//! │  │  Keys / │  │  APDU   │  │   App   │  │   Certificate   │ │
//! │  │  Paths  │  │ Encode  │  │ Session │  │  Verification   │ │
//! │  └─────────┘  └─────────┘  └─────────┘  └─────────────────┘ │
//! ├─────────────────────────────────────────────────────────────┤
//! │               Transport Layer (USB HID / TCP)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ## Creating an Identity
//!
//! ```ignore
//! use icp_ledger_signer_core::identity::{Identity, LedgerIdentity};
//!
//! // Connects to the device and fetches the key at m/44'/223'/0'/0/0.
//! let identity = LedgerIdentity::create(0).await?;
//! println!("principal: {}", identity.sender());
//! ```
//!
//! ## Signing a Request
//!
//! ```ignore
//! use candid::Principal;
//! use icp_ledger_signer_core::identity::Identity;
//! use icp_ledger_signer_core::request::RequestContent;
//!
//! let content = RequestContent::call(
//!     Principal::from_text("ryjl3-tyaaa-aaaaa-aaaba-cai")?,
//!     "icrc1_transfer",
//!     arg_bytes,
//!     identity.sender(),
//! );
//! // The device shows the request; the result is a submittable envelope.
//! let envelope = identity.transform_request(&content).await?;
//! ```
//!
//! ## Consent-Verified Signing
//!
//! Attach a [`consent::ConsentVerifier`] and call requests go through the
//! certified ICRC-21 round trip before the device signs:
//!
//! ```ignore
//! use icp_ledger_signer_core::consent::ConsentVerifier;
//!
//! let verifier = ConsentVerifier::new(Box::new(my_replica_transport));
//! let identity = LedgerIdentity::create(0).await?.with_consent_verifier(verifier);
//! ```
//!
//! The replica connection itself is not this crate's concern; implement
//! [`consent::ReplicaTransport`] over whatever HTTP stack you use.
//!
//! # Security Considerations
//!
//! - Private keys never leave the Ledger hardware
//! - Every session re-checks the device's public key against the identity
//! - Consent messages are only trusted through a verified certificate
//! - Version gates keep consent-bound signing off firmware that predates it
//!
//! [ICRC-21]: https://github.com/dfinity/ICRC/blob/main/ICRCs/ICRC-21/icrc_21_consent_msg.md

// Modules
pub mod apdu;
pub mod app;
pub mod certificate;
pub mod consent;
pub mod error;
pub mod identity;
pub mod keys;
pub mod request;
pub mod session;
pub mod transport;
pub mod version;

// Re-exports for convenience
pub use app::{IcpApp, TokenInfo, TransactionKind};
pub use certificate::{Certificate, HashTree, LookupResult};
pub use consent::{CallResponse, ConsentInfo, ConsentVerifier, ReplicaTransport};
pub use error::{ConnectionFailure, Error, Result};
pub use identity::{AnonymousIdentity, Identity, LedgerIdentity};
pub use keys::{DerivationPath, Secp256k1PublicKey};
pub use request::{Envelope, RequestContent};
pub use session::AppSession;
pub use version::Version;

// Re-export the principal type requests are addressed with
pub use candid::Principal;

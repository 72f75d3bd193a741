//! Internet Computer Ledger app protocol.
//!
//! [`IcpApp`] speaks the app-level command set over any [`Transport`]:
//! key retrieval, version queries, chunked signing, context-bound signing,
//! and the supported-token registry.
//!
//! # Chunked Payloads
//!
//! Signing payloads exceed a single APDU, so they are split: an `INIT` chunk
//! carrying the serialized derivation path, then `ADD` chunks of up to
//! [`Apdu::MAX_CHUNK_LEN`] bytes, with the final chunk marked `LAST`. The
//! signature arrives in the response to the `LAST` chunk.
//!
//! # Return Codes
//!
//! Non-success status words map to typed errors where the cause is
//! actionable (locked device, wrong app open, stale firmware); everything
//! else surfaces as a protocol error carrying the raw code and the ASCII
//! message the app embeds in the response data.

use candid::Principal;
use tracing::debug;

use crate::apdu::{Apdu, ApduResponse};
use crate::error::{ConnectionFailure, Error, Result};
use crate::keys::{DerivationPath, Secp256k1PublicKey};
use crate::transport::Transport;
use crate::version::Version;

/// Class byte of the Internet Computer app.
const CLA: u8 = 0x11;

/// App instruction bytes.
mod ins {
    pub const GET_VERSION: u8 = 0x00;
    pub const GET_ADDR_SECP256K1: u8 = 0x01;
    pub const SIGN_SECP256K1: u8 = 0x02;
    pub const SIGN_WITH_CONTEXT: u8 = 0x03;
    pub const GET_SUPPORTED_TOKENS: u8 = 0x04;
}

/// Chunk position markers, sent in P1 of signing commands.
mod payload {
    pub const INIT: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const LAST: u8 = 0x02;
}

/// P1 of `GET_ADDR_SECP256K1`: require on-screen confirmation.
const P1_SHOW_ADDRESS: u8 = 0x01;

/// P2 of signing commands: transaction kind the app should display.
mod tx_kind {
    pub const DEFAULT: u8 = 0x00;
    pub const STAKE: u8 = 0x01;
}

/// Return code of a locked device.
const RC_DEVICE_LOCKED: u16 = 0x5515;

/// Return codes reported when the app is not the one open.
const RC_CLA_NOT_SUPPORTED: u16 = 0x6E00;
const RC_APP_NOT_OPEN: u16 = 0x6E01;

/// Return code of an instruction the installed app version predates.
const RC_INS_NOT_SUPPORTED: u16 = 0x6D00;

/// Expected signature length in a signing response.
const SIGNATURE_LEN: usize = 64;

/// How the app should display an upcoming signing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Regular payload review.
    Default,

    /// Neuron-stake review flow.
    Stake,
}

impl TransactionKind {
    const fn p2(self) -> u8 {
        match self {
            Self::Default => tx_kind::DEFAULT,
            Self::Stake => tx_kind::STAKE,
        }
    }
}

/// Key material reported by `GET_ADDR_SECP256K1`.
#[derive(Debug, Clone)]
pub struct AddressAndKey {
    /// Uncompressed secp256k1 public key.
    pub public_key: Secp256k1PublicKey,

    /// Principal the device derives from that key.
    pub principal: Principal,
}

/// One entry of the app's supported-token registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Token symbol, e.g. `ICP`.
    pub symbol: String,

    /// Ledger canister the token lives on.
    pub ledger_canister_id: Principal,

    /// Display decimals.
    pub decimals: u8,
}

/// The Internet Computer app, bound to an open transport.
pub struct IcpApp {
    transport: Box<dyn Transport>,
}

impl IcpApp {
    /// Wraps an open transport.
    #[must_use]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Releases the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Queries the installed app version. Never cached; callers that gate
    /// on the version want the live device state.
    pub async fn get_version(&mut self) -> Result<Version> {
        let data = self
            .exchange(Apdu::new(CLA, ins::GET_VERSION, 0, 0, vec![]))
            .await?;
        // test-mode flag, then major / minor / patch.
        if data.len() < 4 {
            return Err(Error::Decode("version response too short".to_string()));
        }
        Ok(Version::new(
            data[1].into(),
            data[2].into(),
            data[3].into(),
        ))
    }

    /// Fetches the public key and device-derived principal for a path.
    pub async fn get_address_and_public_key(
        &mut self,
        path: &DerivationPath,
    ) -> Result<AddressAndKey> {
        self.address_request(path, false).await
    }

    /// Like [`Self::get_address_and_public_key`], but the device shows the
    /// principal on screen and waits for user confirmation first.
    pub async fn show_address_and_public_key(
        &mut self,
        path: &DerivationPath,
    ) -> Result<AddressAndKey> {
        self.address_request(path, true).await
    }

    async fn address_request(
        &mut self,
        path: &DerivationPath,
        confirm: bool,
    ) -> Result<AddressAndKey> {
        let p1 = if confirm { P1_SHOW_ADDRESS } else { 0 };
        let data = self
            .exchange(Apdu::new(CLA, ins::GET_ADDR_SECP256K1, p1, 0, path.to_wire()))
            .await?;

        // 65-byte key, 29-byte principal, textual principal follows.
        if data.len() < Secp256k1PublicKey::RAW_LEN + 29 {
            return Err(Error::Decode("address response too short".to_string()));
        }
        let public_key = Secp256k1PublicKey::from_raw(&data[..Secp256k1PublicKey::RAW_LEN])?;
        let principal =
            Principal::from_slice(&data[Secp256k1PublicKey::RAW_LEN..Secp256k1PublicKey::RAW_LEN + 29]);

        Ok(AddressAndKey {
            public_key,
            principal,
        })
    }

    /// Signs a pre-canonicalized payload, returning the 64-byte RS
    /// signature.
    pub async fn sign(
        &mut self,
        path: &DerivationPath,
        payload: &[u8],
        kind: TransactionKind,
    ) -> Result<Vec<u8>> {
        debug!(len = payload.len(), ?kind, "signing payload");
        let response = self
            .send_chunked(ins::SIGN_SECP256K1, kind.p2(), path, payload)
            .await?;
        Self::extract_signature(response)
    }

    /// Signs a call bound to its certified consent round trip.
    ///
    /// The payload concatenates the three artifacts, each with a
    /// little-endian u32 length prefix, followed by a fourth section for
    /// the root key (length zero when the device should use its built-in
    /// mainnet key).
    pub async fn sign_with_context(
        &mut self,
        path: &DerivationPath,
        consent_request: &[u8],
        call: &[u8],
        certificate: &[u8],
        root_key: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(
            16 + consent_request.len() + call.len() + certificate.len(),
        );
        for section in [consent_request, call, certificate, root_key.unwrap_or(&[])] {
            payload.extend_from_slice(&(section.len() as u32).to_le_bytes());
            payload.extend_from_slice(section);
        }

        debug!(len = payload.len(), "signing with consent context");
        let response = self
            .send_chunked(ins::SIGN_WITH_CONTEXT, tx_kind::DEFAULT, path, &payload)
            .await?;
        Self::extract_signature(response)
    }

    /// Reads the app's registry of supported ICRC tokens.
    pub async fn get_supported_tokens(&mut self) -> Result<Vec<TokenInfo>> {
        let data = self
            .exchange(Apdu::new(CLA, ins::GET_SUPPORTED_TOKENS, 0, 0, vec![]))
            .await?;
        parse_token_registry(&data)
    }

    /// Sends an INIT chunk with the path, then the payload in ADD/LAST
    /// chunks. Returns the data of the LAST response.
    async fn send_chunked(
        &mut self,
        instruction: u8,
        p2: u8,
        path: &DerivationPath,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.exchange(Apdu::new(CLA, instruction, payload::INIT, p2, path.to_wire()))
            .await?;

        let mut chunks = payload.chunks(Apdu::MAX_CHUNK_LEN).peekable();
        let mut last_data = Vec::new();
        while let Some(chunk) = chunks.next() {
            let p1 = if chunks.peek().is_some() {
                payload::ADD
            } else {
                payload::LAST
            };
            last_data = self
                .exchange(Apdu::new(CLA, instruction, p1, p2, chunk.to_vec()))
                .await?;
        }
        Ok(last_data)
    }

    /// Exchanges one APDU and maps non-success return codes.
    async fn exchange(&mut self, apdu: Apdu) -> Result<Vec<u8>> {
        let response = self.transport.exchange(&apdu).await?;
        if response.is_success() {
            return Ok(response.into_data());
        }
        Err(map_return_code(&response))
    }

    fn extract_signature(data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() != SIGNATURE_LEN {
            return Err(Error::SignatureLength { actual: data.len() });
        }
        Ok(data)
    }
}

impl Drop for IcpApp {
    fn drop(&mut self) {
        self.transport.close();
    }
}

/// Maps a failed response to the error taxonomy.
fn map_return_code(response: &ApduResponse) -> Error {
    match response.return_code() {
        RC_DEVICE_LOCKED => Error::connection(ConnectionFailure::DeviceLocked),
        RC_CLA_NOT_SUPPORTED | RC_APP_NOT_OPEN => {
            Error::connection(ConnectionFailure::WrongAppOpen)
        }
        RC_INS_NOT_SUPPORTED => Error::DeviceProtocol {
            code: RC_INS_NOT_SUPPORTED,
            message: "instruction not supported; please update the Internet Computer app"
                .to_string(),
        },
        code => Error::DeviceProtocol {
            code,
            message: response
                .error_message()
                .unwrap_or_else(|| "unknown device error".to_string()),
        },
    }
}

/// Parses the token registry: a count byte, then per-token
/// `sym_len || symbol || principal_len || principal || decimals`.
fn parse_token_registry(data: &[u8]) -> Result<Vec<TokenInfo>> {
    fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
        if rest.len() < n {
            return Err(Error::Decode(
                "token registry response truncated".to_string(),
            ));
        }
        let (head, tail) = rest.split_at(n);
        *rest = tail;
        Ok(head)
    }

    let mut rest = data;
    let count = take(&mut rest, 1)?[0];
    let mut tokens = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let sym_len = take(&mut rest, 1)?[0] as usize;
        let symbol = String::from_utf8(take(&mut rest, sym_len)?.to_vec())
            .map_err(|_| Error::Decode("token symbol is not UTF-8".to_string()))?;
        let principal_len = take(&mut rest, 1)?[0] as usize;
        let ledger_canister_id = Principal::from_slice(take(&mut rest, principal_len)?);
        let decimals = take(&mut rest, 1)?[0];
        tokens.push(TokenInfo {
            symbol,
            ledger_canister_id,
            decimals,
        });
    }
    Ok(tokens)
}

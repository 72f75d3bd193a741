//! TCP transport for a Ledger emulator (Speculos-style).
//!
//! APDUs are exchanged over a plain TCP socket with a four-byte big-endian
//! length prefix. The emulator replies with a length-prefixed data section
//! followed by the two-byte status word.
//!
//! This provider is opt-in: its capability probe only reports the
//! environment as capable when `ICP_LEDGER_TCP` is set (e.g.
//! `ICP_LEDGER_TCP=127.0.0.1:9999`).

use std::io::{Read, Write};
use std::net::TcpStream;

use async_trait::async_trait;
use tracing::debug;

use super::Transport;
use crate::apdu::{Apdu, ApduResponse};
use crate::error::{ConnectionFailure, Error, Result};

/// Environment variable holding the emulator address.
pub const TCP_ENV_VAR: &str = "ICP_LEDGER_TCP";

/// Whether the TCP provider is enabled in this environment.
#[must_use]
pub fn is_supported() -> bool {
    std::env::var_os(TCP_ENV_VAR).is_some()
}

/// Connects to the emulator named by [`TCP_ENV_VAR`].
///
/// # Errors
///
/// - `UnsupportedEnvironment` if the variable is unset
/// - `NoDeviceFound` if the emulator is not listening
pub fn connect() -> Result<Box<dyn Transport>> {
    let address = std::env::var(TCP_ENV_VAR)
        .map_err(|_| Error::connection(ConnectionFailure::UnsupportedEnvironment))?;
    let transport = TcpTransport::open(&address)?;
    Ok(Box::new(transport))
}

/// A TCP transport for a Ledger emulator.
pub struct TcpTransport {
    /// The open socket; `None` once closed.
    stream: Option<TcpStream>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Connects to an emulator at `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns `NoDeviceFound` if the connection is refused.
    pub fn open(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|_| Error::connection(ConnectionFailure::NoDeviceFound))?;
        debug!(address, "connected to Ledger emulator");
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or(Error::connection(ConnectionFailure::NoDeviceFound))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
        let command = apdu.to_bytes();
        let stream = self.stream()?;

        let io_err = |e: std::io::Error| Error::DeviceProtocol {
            code: 0,
            message: format!("emulator I/O failed: {e}"),
        };

        stream
            .write_all(&(command.len() as u32).to_be_bytes())
            .map_err(io_err)?;
        stream.write_all(&command).map_err(io_err)?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).map_err(io_err)?;
        let data_len = u32::from_be_bytes(len_buf) as usize;

        // Data section, then the two status-word bytes.
        let mut response = vec![0u8; data_len + 2];
        stream.read_exact(&mut response).map_err(io_err)?;

        ApduResponse::from_bytes(response)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!("closed emulator connection");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn probe_follows_env_var() {
        // The variable is not set in the test environment.
        if std::env::var_os(TCP_ENV_VAR).is_none() {
            assert!(!is_supported());
        }
    }

    #[tokio::test]
    async fn exchange_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).unwrap();
            let mut command = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            socket.read_exact(&mut command).unwrap();

            // Echo one data byte plus a success status word.
            socket.write_all(&1u32.to_be_bytes()).unwrap();
            socket.write_all(&[0xAB, 0x90, 0x00]).unwrap();
            command
        });

        let mut transport = TcpTransport::open(&address).unwrap();
        let apdu = Apdu::new(0x11, 0x00, 0x00, 0x00, vec![]);
        let response = transport.exchange(&apdu).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.data(), &[0xAB]);
        assert_eq!(server.join().unwrap(), apdu.to_bytes());

        transport.close();
        transport.close(); // idempotent
    }

    #[test]
    fn open_refused_maps_to_no_device() {
        // Port 1 is almost certainly closed.
        let err = TcpTransport::open("127.0.0.1:1").unwrap_err();
        assert!(matches!(
            err,
            Error::Connection {
                kind: ConnectionFailure::NoDeviceFound
            }
        ));
    }
}

//! # ADB Protocol Engine
//!
//! A synchronous implementation of the device-side debug protocol spoken by
//! `adbd`, run directly over a byte transport without the desktop server.
//!
//! ## Overview
//!
//! - **Framing**: 24-byte checksummed headers with bounded payloads
//! - **Handshake**: CNXN exchange with RSA challenge/response authentication
//! - **Streams**: OPEN/WRTE/OKAY/CLSE multiplexing with one credit per write
//! - **Sync**: STAT/LIST/SEND/RECV file transfer inside a `sync:` stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Sync sub-protocol               │  STAT/LIST/SEND/RECV
//! ├─────────────────────────────────────────┤
//! │         Stream multiplexer              │  OPEN/WRTE/OKAY/CLSE
//! ├─────────────────────────────────────────┤
//! │         Handshake + auth                │  CNXN/AUTH
//! ├─────────────────────────────────────────┤
//! │         Message framer                  │  header + payload
//! ├─────────────────────────────────────────┤
//! │         Transport (TCP, USB)            │  supplied by the caller
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use adb_protocol::{AdbConnection, ConnectOptions, RsaSigner, SyncSession, Transport};
//!
//! fn list_sdcard<T: Transport>(transport: T, signer: RsaSigner) -> adb_protocol::Result<()> {
//!     let options = ConnectOptions::with_banner("workstation");
//!     let mut conn = AdbConnection::connect(transport, &[signer], &options)?;
//!
//!     let output = conn.command("shell", Some("getprop ro.product.model"), Duration::from_secs(5))?;
//!     println!("{}", String::from_utf8_lossy(&output));
//!
//!     let mut sync = SyncSession::open(&mut conn, Duration::from_secs(5))?;
//!     for entry in sync.list("/sdcard")? {
//!         println!("{}", entry?.name);
//!     }
//!     sync.close()?;
//!     conn.shutdown()
//! }
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: Byte transport boundary
//! - [`message`]: Message framing
//! - [`auth`]: Signer capability and RSA signer
//! - [`handshake`]: Connection state machine
//! - [`connection`]: Stream multiplexer
//! - [`sync`]: File-sync sub-protocol
//! - [`error`]: Error types

pub mod auth;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod message;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod mock;

pub use auth::{pad_for_signing, AuthSigner, RsaSigner, SHA1_DIGEST_INFO, TOKEN_SIZE};
pub use connection::{AdbConnection, Stream, StreamState, StreamingOutput};
pub use error::{AdbError, Phase, Result};
pub use handshake::{
    ConnectOptions, DeviceBanner, Handshake, HandshakeOutcome, HandshakeState,
    DEFAULT_AUTH_TIMEOUT,
};
pub use message::{
    checksum, AdbMessage, Command, Framer, MessageHeader, AUTH_RSAPUBLICKEY, AUTH_SIGNATURE,
    AUTH_TOKEN, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAX_PAYLOAD_LIMIT, PROTOCOL_VERSION,
};
pub use sync::{
    DirEntry, DirectoryListing, FileStat, SyncId, SyncSession, DEFAULT_PUSH_MODE, MAX_PATH,
    SYNC_DATA_MAX,
};
pub use transport::Transport;

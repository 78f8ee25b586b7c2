//! ADB message framing.
//!
//! # Wire Format
//!
//! Every message is a 24-byte header followed by an optional payload:
//!
//! ```text
//! +---------+------+------+-------------+---------------+-------------+
//! | command | arg0 | arg1 | data_length | data_checksum | magic       |
//! +---------+------+------+-------------+---------------+-------------+
//!    u32      u32    u32       u32           u32         !command
//! ```
//!
//! All fields are little-endian. The checksum is the sum of the payload bytes
//! modulo 2^32 and the magic is the bitwise complement of the command.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};

use crate::error::{AdbError, Phase, Result};
use crate::transport::{read_exact, write_all, Transport};

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Protocol version advertised in CNXN.
pub const PROTOCOL_VERSION: u32 = 0x0100_0000;

/// Maximum payload advertised by this side unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// Hard ceiling on any payload length, regardless of negotiation.
pub const MAX_PAYLOAD_LIMIT: usize = 1024 * 1024;

/// AUTH subtype: device challenge.
pub const AUTH_TOKEN: u32 = 1;
/// AUTH subtype: signed challenge.
pub const AUTH_SIGNATURE: u32 = 2;
/// AUTH subtype: public key offer.
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// Message command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Connect.
    Cnxn,
    /// Authenticate.
    Auth,
    /// Open a stream.
    Open,
    /// Acknowledge.
    Okay,
    /// Write stream data.
    Wrte,
    /// Close a stream.
    Clse,
    /// Legacy sync marker.
    Sync,
}

impl Command {
    const ALL: [Command; 7] = [
        Command::Cnxn,
        Command::Auth,
        Command::Open,
        Command::Okay,
        Command::Wrte,
        Command::Clse,
        Command::Sync,
    ];

    /// ASCII name of the command.
    pub const fn name(self) -> &'static str {
        match self {
            Command::Cnxn => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Wrte => "WRTE",
            Command::Clse => "CLSE",
            Command::Sync => "SYNC",
        }
    }

    /// Wire value: the ASCII name read as a little-endian u32.
    pub fn tag(self) -> u32 {
        let name = self.name().as_bytes();
        u32::from_le_bytes([name[0], name[1], name[2], name[3]])
    }

    /// Looks up a command from its wire value.
    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sum of payload bytes modulo 2^32.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Command tag.
    pub command: Command,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Length of the payload that follows.
    pub data_length: u32,
    /// Expected payload checksum.
    pub data_checksum: u32,
}

impl MessageHeader {
    /// Parses exactly [`HEADER_SIZE`] bytes.
    ///
    /// Fails on a short buffer, an unknown command, or a magic value that is
    /// not the complement of the command.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(AdbError::Framing(format!(
                "header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let tag = buf.get_u32_le();
        let arg0 = buf.get_u32_le();
        let arg1 = buf.get_u32_le();
        let data_length = buf.get_u32_le();
        let data_checksum = buf.get_u32_le();
        let magic = buf.get_u32_le();

        let command = Command::from_tag(tag)
            .ok_or_else(|| AdbError::Framing(format!("unknown command 0x{:08x}", tag)))?;

        if magic != !tag {
            return Err(AdbError::Framing(format!(
                "invalid magic for {}: expected 0x{:08x}, got 0x{:08x}",
                command, !tag, magic
            )));
        }

        Ok(Self {
            command,
            arg0,
            arg1,
            data_length,
            data_checksum,
        })
    }

    /// Serializes the header, computing the magic from the command.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let tag = self.command.tag();
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(tag);
        buf.put_u32_le(self.arg0);
        buf.put_u32_le(self.arg1);
        buf.put_u32_le(self.data_length);
        buf.put_u32_le(self.data_checksum);
        buf.put_u32_le(!tag);
        out
    }

    /// Checks a received payload against the header's checksum.
    pub fn verify_payload(&self, payload: &[u8]) -> Result<()> {
        let actual = checksum(payload);
        if actual != self.data_checksum {
            return Err(AdbError::Framing(format!(
                "checksum mismatch for {}: expected 0x{:08x}, got 0x{:08x}",
                self.command, self.data_checksum, actual
            )));
        }
        Ok(())
    }
}

/// A complete protocol message.
#[derive(Clone, PartialEq, Eq)]
pub struct AdbMessage {
    /// Command tag.
    pub command: Command,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Payload bytes, possibly empty.
    pub payload: Vec<u8>,
}

impl AdbMessage {
    /// Creates a message.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// Header describing this message.
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            command: self.command,
            arg0: self.arg0,
            arg1: self.arg1,
            data_length: self.payload.len() as u32,
            data_checksum: checksum(&self.payload),
        }
    }

    /// Encodes header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a complete message from a buffer holding header and payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(AdbError::Framing(format!(
                "insufficient data for header: need {} bytes, have {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let header = MessageHeader::decode(&bytes[..HEADER_SIZE])?;
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() != header.data_length as usize {
            return Err(AdbError::Framing(format!(
                "payload length mismatch: header says {}, have {}",
                header.data_length,
                payload.len()
            )));
        }
        header.verify_payload(payload)?;
        Ok(Self::new(header.command, header.arg0, header.arg1, payload))
    }
}

impl fmt::Debug for AdbMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdbMessage")
            .field("command", &self.command)
            .field("arg0", &self.arg0)
            .field("arg1", &self.arg1)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Sends and receives whole messages over a transport.
///
/// Owns the transport and enforces the negotiated maximum payload.
pub struct Framer<T> {
    transport: T,
    max_payload: usize,
}

impl<T: Transport> Framer<T> {
    /// Creates a framer with the given outgoing payload limit.
    pub fn new(transport: T, max_payload: usize) -> Self {
        Self {
            transport,
            max_payload,
        }
    }

    /// Current outgoing payload limit.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Replaces the payload limit after negotiation.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Borrows the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrows the transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consumes the framer, returning the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends one message. Header and payload go out as separate writes.
    pub fn send(&mut self, message: &AdbMessage, timeout: Duration) -> Result<()> {
        if message.payload.len() > self.max_payload {
            return Err(AdbError::PayloadTooLarge {
                size: message.payload.len(),
                max: self.max_payload,
            });
        }

        tracing::trace!(
            command = %message.command,
            arg0 = message.arg0,
            arg1 = message.arg1,
            len = message.payload.len(),
            "Send"
        );

        let deadline = Instant::now() + timeout;
        write_all(&mut self.transport, &message.header().encode(), deadline)?;
        if !message.payload.is_empty() {
            write_all(&mut self.transport, &message.payload, deadline)?;
        }
        Ok(())
    }

    /// Reads one message, verifying magic and checksum.
    pub fn receive(&mut self, timeout: Duration) -> Result<AdbMessage> {
        let deadline = Instant::now() + timeout;
        let header_bytes = read_exact(&mut self.transport, HEADER_SIZE, deadline)?;
        let header = MessageHeader::decode(&header_bytes)?;

        let len = header.data_length as usize;
        if len > MAX_PAYLOAD_LIMIT {
            return Err(AdbError::Framing(format!(
                "{} announces {} byte payload, limit is {}",
                header.command, len, MAX_PAYLOAD_LIMIT
            )));
        }

        let payload = if len > 0 {
            read_exact(&mut self.transport, len, deadline)?
        } else {
            Vec::new()
        };
        header.verify_payload(&payload)?;

        tracing::trace!(
            command = %header.command,
            arg0 = header.arg0,
            arg1 = header.arg1,
            len,
            "Recv"
        );

        Ok(AdbMessage::new(header.command, header.arg0, header.arg1, payload))
    }

    /// Closes the underlying transport.
    pub fn close(&mut self) -> Result<()> {
        self.transport
            .close()
            .map_err(|e| AdbError::from(e).during(Phase::Close))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_command_tags_are_ascii_le() {
        assert_eq!(Command::Cnxn.tag(), 0x4e58_4e43);
        assert_eq!(Command::Auth.tag(), 0x4854_5541);
        assert_eq!(Command::Open.tag(), 0x4e45_504f);
        assert_eq!(Command::Okay.tag(), 0x5941_4b4f);
        assert_eq!(Command::Wrte.tag(), 0x4554_5257);
        assert_eq!(Command::Clse.tag(), 0x4553_4c43);
        assert_eq!(Command::Sync.tag(), 0x434e_5953);
    }

    #[test]
    fn test_from_tag_unknown() {
        assert_eq!(Command::from_tag(0xdead_beef), None);
        assert_eq!(Command::from_tag(Command::Wrte.tag()), Some(Command::Wrte));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[0xff; 4]), 0x3fc);
    }

    fn word(bytes: &[u8], index: usize) -> u32 {
        u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn test_header_layout() {
        let msg = AdbMessage::new(Command::Open, 7, 0, b"shell:\0".to_vec());
        let encoded = msg.encode();

        assert_eq!(encoded.len(), HEADER_SIZE + 7);
        assert_eq!(&encoded[0..4], b"OPEN");
        assert_eq!(word(&encoded, 1), 7);
        assert_eq!(word(&encoded, 2), 0);
        assert_eq!(word(&encoded, 3), 7);
        assert_eq!(word(&encoded, 4), checksum(b"shell:\0"));
        assert_eq!(word(&encoded, 5), !Command::Open.tag());
        assert_eq!(&encoded[HEADER_SIZE..], b"shell:\0");
    }

    #[test]
    fn test_empty_payload_header() {
        let header = AdbMessage::new(Command::Clse, 1, 2, Vec::new()).header().encode();
        assert_eq!(word(&header, 3), 0);
        assert_eq!(word(&header, 4), 0);
        assert_eq!(word(&header, 5), !Command::Clse.tag());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let cases = [
            AdbMessage::new(Command::Cnxn, PROTOCOL_VERSION, 4096, b"host::\0".to_vec()),
            AdbMessage::new(Command::Okay, 12, 1, Vec::new()),
            AdbMessage::new(Command::Wrte, 1, 12, vec![0xffu8; DEFAULT_MAX_PAYLOAD]),
        ];
        for msg in cases {
            let decoded = AdbMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_mutated_payload_byte_fails_checksum() {
        let msg = AdbMessage::new(Command::Wrte, 1, 2, b"some payload".to_vec());
        let encoded = msg.encode();

        for i in HEADER_SIZE..encoded.len() {
            let mut corrupted = encoded.clone();
            corrupted[i] = corrupted[i].wrapping_add(1);
            let err = AdbMessage::decode(&corrupted).unwrap_err();
            assert!(
                matches!(err, AdbError::Framing(_)),
                "byte {} should break the checksum",
                i
            );
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = AdbMessage::new(Command::Okay, 1, 2, Vec::new()).header().encode();
        header[HEADER_SIZE - 1] ^= 0x01;
        let err = MessageHeader::decode(&header).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut header = AdbMessage::new(Command::Okay, 1, 2, Vec::new()).header().encode();
        header[0..4].copy_from_slice(b"NOPE");
        let err = MessageHeader::decode(&header).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn test_header_wrong_length() {
        let err = MessageHeader::decode(&[0u8; HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, AdbError::Framing(_)));
    }

    #[test]
    fn test_framer_receive_over_fragmented_reads() {
        let msg = AdbMessage::new(Command::Wrte, 3, 9, (0..200u8).collect::<Vec<_>>());
        let mut transport = MockTransport::new().with_read_piece(7);
        transport.push_message(&msg);

        let mut framer = Framer::new(transport, DEFAULT_MAX_PAYLOAD);
        assert_eq!(framer.receive(TIMEOUT).unwrap(), msg);
    }

    #[test]
    fn test_framer_receive_checksum_mismatch() {
        let msg = AdbMessage::new(Command::Wrte, 3, 9, b"abc".to_vec());
        let mut encoded = msg.encode();
        let last = encoded.len() - 1;
        encoded[last] = b'x';

        let mut transport = MockTransport::new();
        transport.push_incoming(&encoded);
        let mut framer = Framer::new(transport, DEFAULT_MAX_PAYLOAD);

        let err = framer.receive(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_framer_rejects_oversized_announcement() {
        let header = MessageHeader {
            command: Command::Wrte,
            arg0: 1,
            arg1: 1,
            data_length: (MAX_PAYLOAD_LIMIT + 1) as u32,
            data_checksum: 0,
        };
        let mut transport = MockTransport::new();
        transport.push_incoming(&header.encode());
        let mut framer = Framer::new(transport, DEFAULT_MAX_PAYLOAD);

        assert!(matches!(
            framer.receive(TIMEOUT).unwrap_err(),
            AdbError::Framing(_)
        ));
    }

    #[test]
    fn test_framer_send_rejects_payload_over_max() {
        let mut framer = Framer::new(MockTransport::new(), 16);
        let msg = AdbMessage::new(Command::Wrte, 1, 1, vec![0u8; 17]);

        let err = framer.send(&msg, TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::PayloadTooLarge { size: 17, max: 16 }));
        assert!(framer.transport().written().is_empty());
    }

    #[test]
    fn test_framer_send_survives_partial_writes() {
        let mut framer = Framer::new(MockTransport::new().with_write_piece(5), 64);
        let msg = AdbMessage::new(Command::Wrte, 1, 1, b"partial writes".to_vec());

        framer.send(&msg, TIMEOUT).unwrap();
        assert_eq!(framer.transport().written(), &msg.encode()[..]);
        assert_eq!(framer.transport().sent(), &[msg]);
    }
}

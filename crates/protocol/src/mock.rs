//! Scripted in-memory transport for engine tests.
//!
//! Written bytes are reassembled into messages and handed to an optional
//! responder closure, whose replies are queued for reading. Reads and writes
//! can be capped to small pieces to exercise the engine's looping.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::message::{AdbMessage, MessageHeader, HEADER_SIZE};
use crate::transport::Transport;

type Responder = Box<dyn FnMut(&AdbMessage) -> Vec<AdbMessage> + Send>;

pub(crate) struct MockTransport {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    pending: Vec<u8>,
    sent: Vec<AdbMessage>,
    responder: Option<Responder>,
    read_piece: usize,
    write_piece: usize,
    write_calls: usize,
    closed: bool,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            written: Vec::new(),
            pending: Vec::new(),
            sent: Vec::new(),
            responder: None,
            read_piece: usize::MAX,
            write_piece: usize::MAX,
            write_calls: 0,
            closed: false,
        }
    }

    /// Caps every read at `piece` bytes.
    pub(crate) fn with_read_piece(mut self, piece: usize) -> Self {
        self.read_piece = piece;
        self
    }

    /// Caps every write at `piece` bytes.
    pub(crate) fn with_write_piece(mut self, piece: usize) -> Self {
        self.write_piece = piece;
        self
    }

    /// Installs a device simulator that answers each complete message.
    pub(crate) fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&AdbMessage) -> Vec<AdbMessage> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub(crate) fn push_incoming(&mut self, bytes: &[u8]) {
        self.incoming.extend(bytes.iter().copied());
    }

    pub(crate) fn push_message(&mut self, message: &AdbMessage) {
        let encoded = message.encode();
        self.push_incoming(&encoded);
    }

    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.write_calls
    }

    /// Every complete message written so far.
    pub(crate) fn sent(&self) -> &[AdbMessage] {
        &self.sent
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    fn drain_pending(&mut self) {
        loop {
            if self.pending.len() < HEADER_SIZE {
                return;
            }
            let header = match MessageHeader::decode(&self.pending[..HEADER_SIZE]) {
                Ok(header) => header,
                Err(_) => return,
            };
            let total = HEADER_SIZE + header.data_length as usize;
            if self.pending.len() < total {
                return;
            }
            let message = AdbMessage::new(
                header.command,
                header.arg0,
                header.arg1,
                self.pending[HEADER_SIZE..total].to_vec(),
            );
            self.pending.drain(..total);

            if let Some(responder) = self.responder.as_mut() {
                for reply in responder(&message) {
                    let encoded = reply.encode();
                    self.incoming.extend(encoded.iter().copied());
                }
            }
            self.sent.push(message);
        }
    }
}

impl Transport for MockTransport {
    fn read(&mut self, max_len: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        if self.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data scripted"));
        }
        let n = max_len.min(self.read_piece).min(self.incoming.len());
        Ok(self.incoming.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        self.write_calls += 1;
        let n = data.len().min(self.write_piece);
        self.written.extend_from_slice(&data[..n]);
        self.pending.extend_from_slice(&data[..n]);
        self.drain_pending();
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

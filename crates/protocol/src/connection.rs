//! Stream multiplexer over one framed transport.
//!
//! An [`AdbConnection`] owns the transport and every open stream. There is no
//! background reader: whichever call is waiting reads the next message and
//! routes frames addressed to other streams into their queues.
//!
//! ```text
//! host                                  device
//!  | -- OPEN(local, 0, "shell:ls\0") -------->
//!  | <-- OKAY(remote, local) -----------------
//!  | <-- WRTE(remote, local, data) -----------
//!  | -- OKAY(local, remote) ----------------->   one credit per WRTE
//!  | <-- CLSE(remote, local) -----------------
//!  | -- CLSE(local, remote) ----------------->
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::auth::AuthSigner;
use crate::error::{AdbError, Phase, Result};
use crate::handshake::{ConnectOptions, DeviceBanner, Handshake};
use crate::message::{AdbMessage, Command, Framer, MAX_PAYLOAD_LIMIT};
use crate::transport::Transport;

/// Timeout for the single write of a CLSE.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// OPEN sent, waiting for OKAY.
    Opening,
    /// Ready for reads and writes.
    Open,
    /// Closed locally, waiting for the device's CLSE.
    Closing,
    /// Closed by the device; queued data may still be read.
    Closed,
}

/// Handle to a logical stream on an [`AdbConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    local_id: u32,
    remote_id: u32,
    destination: String,
}

impl Stream {
    /// Id assigned by this side.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Id assigned by the device.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Service the stream is connected to.
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

#[derive(Debug)]
struct StreamEntry {
    remote_id: u32,
    destination: String,
    state: StreamState,
    /// WRTE payloads that arrived while another call was reading.
    inbox: VecDeque<Vec<u8>>,
}

/// An authenticated connection to one device.
pub struct AdbConnection<T: Transport> {
    framer: Framer<T>,
    banner: DeviceBanner,
    device_version: u32,
    authenticated: bool,
    streams: HashMap<u32, StreamEntry>,
    next_local_id: u32,
    /// Local ids whose OPEN went unanswered; a late OKAY for one is a stray.
    retired: HashSet<u32>,
    /// Persistent streams keyed by destination, e.g. an interactive `shell:`.
    services: HashMap<String, Stream>,
}

impl<T: Transport> AdbConnection<T> {
    /// Performs the handshake over `transport`, trying `signers` in order.
    ///
    /// On failure the transport is closed before the error is returned.
    pub fn connect<S: AuthSigner>(
        transport: T,
        signers: &[S],
        options: &ConnectOptions,
    ) -> Result<Self> {
        let mut framer = Framer::new(transport, options.max_payload.clamp(1, MAX_PAYLOAD_LIMIT));
        let mut handshake = Handshake::new(signers, options);

        let outcome = match handshake.run(&mut framer) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(close_err) = framer.close() {
                    tracing::warn!(error = %close_err, "Failed to close transport after handshake error");
                }
                return Err(e);
            }
        };

        Ok(Self {
            framer,
            banner: outcome.banner,
            device_version: outcome.device_version,
            authenticated: outcome.authenticated,
            streams: HashMap::new(),
            next_local_id: 1,
            retired: HashSet::new(),
            services: HashMap::new(),
        })
    }

    /// Banner the device sent at connect time.
    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    /// Device readiness state from the banner.
    pub fn state(&self) -> &str {
        self.banner.state()
    }

    /// Protocol version the device reported.
    pub fn device_version(&self) -> u32 {
        self.device_version
    }

    /// Whether the device required authentication.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Negotiated maximum payload per message.
    pub fn max_payload(&self) -> usize {
        self.framer.max_payload()
    }

    /// Borrows the transport.
    pub fn transport(&self) -> &T {
        self.framer.transport()
    }

    /// State of a stream, or `None` once it has been forgotten.
    pub fn stream_state(&self, stream: &Stream) -> Option<StreamState> {
        self.streams.get(&stream.local_id).map(|e| e.state)
    }

    /// Number of streams the connection still tracks.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Opens a stream to `destination`, e.g. `shell:` or `sync:`.
    pub fn open(&mut self, destination: &str, timeout: Duration) -> Result<Stream> {
        let local_id = self.allocate_id();
        self.streams.insert(
            local_id,
            StreamEntry {
                remote_id: 0,
                destination: destination.to_string(),
                state: StreamState::Opening,
                inbox: VecDeque::new(),
            },
        );

        let mut payload = destination.as_bytes().to_vec();
        payload.push(0);
        let open = AdbMessage::new(Command::Open, local_id, 0, payload);
        if let Err(e) = self.send(&open, timeout, Phase::Open) {
            self.retire(local_id);
            return Err(e);
        }
        tracing::debug!(local_id, destination, "OPEN sent");

        let deadline = Instant::now() + timeout;
        loop {
            let message = match self.receive(deadline, Phase::Open) {
                Ok(message) => message,
                Err(e) => {
                    self.retire(local_id);
                    return Err(e);
                }
            };

            match message.command {
                Command::Okay if message.arg1 == local_id => {
                    let remote_id = message.arg0;
                    if let Some(entry) = self.streams.get_mut(&local_id) {
                        entry.remote_id = remote_id;
                        entry.state = StreamState::Open;
                    }
                    tracing::debug!(local_id, remote_id, destination, "Stream open");
                    return Ok(Stream {
                        local_id,
                        remote_id,
                        destination: destination.to_string(),
                    });
                }
                Command::Clse if message.arg1 == local_id => {
                    self.streams.remove(&local_id);
                    tracing::debug!(local_id, destination, "Device refused stream");
                    return Err(AdbError::StreamOpen {
                        destination: destination.to_string(),
                    });
                }
                Command::Okay if !self.is_known(message.arg1) => {
                    self.streams.remove(&local_id);
                    return Err(AdbError::Protocol(format!(
                        "OKAY for local id {} while opening stream {}",
                        message.arg1, local_id
                    )));
                }
                _ => self.route(message)?,
            }
        }
    }

    /// Writes `data`, one payload-sized WRTE at a time, each acknowledged
    /// before the next is sent.
    ///
    /// A timeout while waiting for acknowledgement fails the stream.
    pub fn write(&mut self, stream: &Stream, data: &[u8], timeout: Duration) -> Result<()> {
        self.require_open(stream)?;

        let max = self.framer.max_payload();
        for chunk in data.chunks(max) {
            let wrte = AdbMessage::new(Command::Wrte, stream.local_id, stream.remote_id, chunk);
            match self.write_chunk(stream, &wrte, timeout) {
                Err(e @ AdbError::Timeout { .. }) => {
                    self.fail_stream(stream, timeout);
                    return Err(e);
                }
                other => other?,
            }
        }
        Ok(())
    }

    fn write_chunk(&mut self, stream: &Stream, wrte: &AdbMessage, timeout: Duration) -> Result<()> {
        self.send(wrte, timeout, Phase::Write)?;
        tracing::trace!(local_id = stream.local_id, len = wrte.payload.len(), "WRTE sent");

        let deadline = Instant::now() + timeout;
        loop {
            let message = self.receive(deadline, Phase::Write)?;
            if message.command == Command::Okay && message.arg1 == stream.local_id {
                return Ok(());
            }
            self.route(message)?;
            if self.state_of(stream.local_id) != Some(StreamState::Open) {
                return Err(AdbError::StreamClosed {
                    local_id: stream.local_id,
                });
            }
        }
    }

    /// Reads the next payload addressed to `stream`.
    ///
    /// Returns `Ok(None)` once the device has closed the stream. Fails with
    /// [`AdbError::StreamClosed`] after a local [`close`](Self::close).
    pub fn read(&mut self, stream: &Stream, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let local_id = stream.local_id;
        let entry = self
            .streams
            .get_mut(&local_id)
            .ok_or(AdbError::StreamClosed { local_id })?;

        if let Some(data) = entry.inbox.pop_front() {
            if entry.state == StreamState::Open {
                let okay = AdbMessage::new(Command::Okay, local_id, entry.remote_id, Vec::new());
                self.send(&okay, timeout, Phase::Read)?;
            }
            return Ok(Some(data));
        }

        let state = entry.state;
        match state {
            StreamState::Closed => return Ok(None),
            StreamState::Open => {}
            StreamState::Opening | StreamState::Closing => {
                return Err(AdbError::StreamClosed { local_id });
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let message = self.receive(deadline, Phase::Read)?;
            if message.command == Command::Wrte && message.arg1 == local_id {
                self.check_remote(local_id, &message)?;
                let okay = AdbMessage::new(Command::Okay, local_id, message.arg0, Vec::new());
                self.send(&okay, timeout, Phase::Read)?;
                return Ok(Some(message.payload));
            }
            self.route(message)?;
            if self.state_of(local_id) == Some(StreamState::Closed) {
                return Ok(None);
            }
        }
    }

    /// Closes `stream` without waiting for the device to confirm.
    ///
    /// Closing an already closed or unknown stream is a no-op.
    pub fn close(&mut self, stream: &Stream) -> Result<()> {
        self.services.retain(|_, s| s.local_id != stream.local_id);

        let Some(entry) = self.streams.get_mut(&stream.local_id) else {
            return Ok(());
        };
        let state = entry.state;
        match state {
            StreamState::Open => {
                entry.state = StreamState::Closing;
                entry.inbox.clear();
                let clse = AdbMessage::new(Command::Clse, stream.local_id, entry.remote_id, Vec::new());
                tracing::debug!(local_id = stream.local_id, "CLSE sent");
                self.send(&clse, DEFAULT_CLOSE_TIMEOUT, Phase::Close)
            }
            StreamState::Closed => {
                self.streams.remove(&stream.local_id);
                Ok(())
            }
            StreamState::Opening | StreamState::Closing => Ok(()),
        }
    }

    /// Runs `service:command`, reads until the device closes the stream,
    /// and returns everything it wrote.
    pub fn command(
        &mut self,
        service: &str,
        command: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let stream = self.open(&destination(service, command), timeout)?;
        let mut output = Vec::new();
        let result = loop {
            match self.read(&stream, timeout) {
                Ok(Some(chunk)) => output.extend_from_slice(&chunk),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.close_quietly(&stream);
        result.map(|()| output)
    }

    /// Like [`command`](Self::command), but yields output chunks as they
    /// arrive.
    pub fn streaming_command(
        &mut self,
        service: &str,
        command: Option<&str>,
        timeout: Duration,
    ) -> Result<StreamingOutput<'_, T>> {
        let stream = self.open(&destination(service, command), timeout)?;
        Ok(StreamingOutput {
            conn: self,
            stream,
            timeout,
            finished: false,
        })
    }

    /// Returns the persistent stream for `destination`, opening it on first
    /// use or after the device closed it.
    pub fn service_stream(&mut self, destination: &str, timeout: Duration) -> Result<Stream> {
        if let Some(stream) = self.services.get(destination) {
            if self.is_open(stream.local_id) {
                return Ok(stream.clone());
            }
            let stale = stream.clone();
            self.close_quietly(&stale);
        }

        let stream = self.open(destination, timeout)?;
        self.services.insert(destination.to_string(), stream.clone());
        Ok(stream)
    }

    /// Closes and forgets the persistent stream for `destination`.
    pub fn forget_service(&mut self, destination: &str) -> Result<()> {
        match self.services.remove(destination) {
            Some(stream) => self.close(&stream),
            None => Ok(()),
        }
    }

    /// Sends CLSE for every open stream and forgets all streams.
    ///
    /// Failures are logged and never abort the teardown.
    pub fn close_all_streams(&mut self) {
        let open: Vec<(u32, u32)> = self
            .streams
            .iter()
            .filter(|(_, e)| e.state == StreamState::Open)
            .map(|(&local, e)| (local, e.remote_id))
            .collect();

        for (local_id, remote_id) in open {
            let clse = AdbMessage::new(Command::Clse, local_id, remote_id, Vec::new());
            if let Err(e) = self.send(&clse, DEFAULT_CLOSE_TIMEOUT, Phase::Close) {
                tracing::warn!(local_id, error = %e, "Failed to close stream during shutdown");
            }
        }
        self.streams.clear();
        self.services.clear();
    }

    /// Closes every open stream best-effort, then the transport.
    pub fn shutdown(mut self) -> Result<()> {
        self.close_all_streams();
        tracing::debug!("Closing transport");
        self.framer.close()
    }

    /// Applies a frame that is not the one the current call is waiting for.
    fn route(&mut self, message: AdbMessage) -> Result<()> {
        let local_id = message.arg1;
        match message.command {
            Command::Wrte => {
                if !self.is_open(local_id) {
                    tracing::debug!(local_id, len = message.payload.len(), "Dropping WRTE for inactive stream");
                    return Ok(());
                }
                self.check_remote(local_id, &message)?;
                if let Some(entry) = self.streams.get_mut(&local_id) {
                    entry.inbox.push_back(message.payload);
                }
            }
            Command::Clse => {
                let known = self
                    .streams
                    .get(&local_id)
                    .map(|e| (e.state, e.remote_id, e.destination.clone()));
                match known {
                    Some((StreamState::Closing, _, _)) => {
                        self.streams.remove(&local_id);
                        tracing::debug!(local_id, "Stream close confirmed");
                    }
                    Some((StreamState::Open, remote_id, destination)) => {
                        if let Some(entry) = self.streams.get_mut(&local_id) {
                            entry.state = StreamState::Closed;
                        }
                        tracing::debug!(local_id, destination = %destination, "Device closed stream");
                        let reply = AdbMessage::new(Command::Clse, local_id, remote_id, Vec::new());
                        self.send(&reply, DEFAULT_CLOSE_TIMEOUT, Phase::Close)?;
                    }
                    None if self.retired.remove(&local_id) => {
                        tracing::debug!(local_id, "Abandoned stream closed");
                    }
                    Some((StreamState::Opening, _, _)) | Some((StreamState::Closed, _, _)) | None => {
                        tracing::debug!(local_id, "Ignoring CLSE");
                    }
                }
            }
            Command::Okay if self.retired.contains(&local_id) => {
                tracing::debug!(local_id, remote_id = message.arg0, "Closing stream accepted after OPEN was abandoned");
                let clse = AdbMessage::new(Command::Clse, local_id, message.arg0, Vec::new());
                self.send(&clse, DEFAULT_CLOSE_TIMEOUT, Phase::Close)?;
            }
            Command::Okay => {
                tracing::debug!(local_id, "Ignoring unsolicited OKAY");
            }
            other => {
                return Err(AdbError::Protocol(format!(
                    "unexpected {} after connect (arg0={}, arg1={})",
                    other, message.arg0, message.arg1
                )));
            }
        }
        Ok(())
    }

    fn check_remote(&self, local_id: u32, message: &AdbMessage) -> Result<()> {
        match self.streams.get(&local_id) {
            Some(entry) if entry.remote_id != message.arg0 => Err(AdbError::Protocol(format!(
                "{} for stream {} from remote id {}, expected {}",
                message.command, local_id, message.arg0, entry.remote_id
            ))),
            _ => Ok(()),
        }
    }

    fn fail_stream(&mut self, stream: &Stream, timeout: Duration) {
        let Some(entry) = self.streams.get_mut(&stream.local_id) else {
            return;
        };
        if entry.state != StreamState::Open {
            return;
        }
        entry.state = StreamState::Closing;
        let clse = AdbMessage::new(Command::Clse, stream.local_id, entry.remote_id, Vec::new());
        if let Err(e) = self.send(&clse, timeout, Phase::Close) {
            tracing::warn!(local_id = stream.local_id, error = %e, "Failed to close stalled stream");
        }
    }

    fn close_quietly(&mut self, stream: &Stream) {
        if let Err(e) = self.close(stream) {
            tracing::warn!(local_id = stream.local_id, error = %e, "Failed to close stream");
        }
    }

    fn require_open(&self, stream: &Stream) -> Result<()> {
        if self.is_open(stream.local_id) {
            Ok(())
        } else {
            Err(AdbError::StreamClosed {
                local_id: stream.local_id,
            })
        }
    }

    /// Whether `local_id` names a tracked stream or an abandoned OPEN.
    fn is_known(&self, local_id: u32) -> bool {
        self.streams.contains_key(&local_id) || self.retired.contains(&local_id)
    }

    fn retire(&mut self, local_id: u32) {
        self.streams.remove(&local_id);
        self.retired.insert(local_id);
    }

    fn is_open(&self, local_id: u32) -> bool {
        self.state_of(local_id) == Some(StreamState::Open)
    }

    fn state_of(&self, local_id: u32) -> Option<StreamState> {
        self.streams.get(&local_id).map(|e| e.state)
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_local_id;
            self.next_local_id = self.next_local_id.wrapping_add(1);
            if id != 0 && !self.is_known(id) {
                return id;
            }
        }
    }

    fn send(&mut self, message: &AdbMessage, timeout: Duration, phase: Phase) -> Result<()> {
        self.framer
            .send(message, timeout)
            .map_err(|e| e.during(phase))
    }

    fn receive(&mut self, deadline: Instant, phase: Phase) -> Result<AdbMessage> {
        let now = Instant::now();
        if now >= deadline {
            return Err(AdbError::Timeout {
                phase,
                detail: "no reply from device".to_string(),
            });
        }
        self.framer
            .receive(deadline - now)
            .map_err(|e| e.during(phase))
    }
}

impl<T: Transport> std::fmt::Debug for AdbConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbConnection")
            .field("state", &self.banner.state())
            .field("max_payload", &self.framer.max_payload())
            .field("streams", &self.streams.len())
            .finish()
    }
}

fn destination(service: &str, command: Option<&str>) -> String {
    let service = service.trim_end_matches(':');
    match command {
        Some(command) => format!("{}:{}", service, command),
        None => format!("{}:", service),
    }
}

/// Output chunks of a running command, ending when the device closes the
/// stream.
///
/// Dropping the iterator early closes the stream.
pub struct StreamingOutput<'a, T: Transport> {
    conn: &'a mut AdbConnection<T>,
    stream: Stream,
    timeout: Duration,
    finished: bool,
}

impl<T: Transport> StreamingOutput<'_, T> {
    /// The underlying stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Stops reading and closes the stream.
    pub fn cancel(mut self) -> Result<()> {
        self.finished = true;
        self.conn.close(&self.stream)
    }
}

impl<T: Transport> Iterator for StreamingOutput<'_, T> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.conn.read(&self.stream, self.timeout) {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finished = true;
                self.conn.close_quietly(&self.stream);
                None
            }
            Err(e) => {
                self.finished = true;
                self.conn.close_quietly(&self.stream);
                Some(Err(e))
            }
        }
    }
}

impl<T: Transport> Drop for StreamingOutput<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_quietly(&self.stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DEFAULT_MAX_PAYLOAD, PROTOCOL_VERSION};
    use crate::mock::MockTransport;

    const TIMEOUT: Duration = Duration::from_secs(1);
    const REMOTE_OFFSET: u32 = 100;

    struct NoSigner;

    impl AuthSigner for NoSigner {
        fn sign(&self, _token: &[u8]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn public_key(&self) -> Vec<u8> {
            Vec::new()
        }
    }

    fn okay(local: u32) -> AdbMessage {
        AdbMessage::new(Command::Okay, local.wrapping_add(REMOTE_OFFSET), local, Vec::new())
    }

    fn wrte(local: u32, data: &[u8]) -> AdbMessage {
        AdbMessage::new(Command::Wrte, local.wrapping_add(REMOTE_OFFSET), local, data.to_vec())
    }

    fn clse(local: u32) -> AdbMessage {
        AdbMessage::new(Command::Clse, local.wrapping_add(REMOTE_OFFSET), local, Vec::new())
    }

    /// Connects to a simulated device; `device` answers everything after CNXN.
    fn connect<F>(mut device: F) -> AdbConnection<MockTransport>
    where
        F: FnMut(&AdbMessage) -> Vec<AdbMessage> + Send + 'static,
    {
        let transport = MockTransport::new()
            .with_read_piece(7)
            .with_responder(move |msg| match msg.command {
                Command::Cnxn => vec![AdbMessage::new(
                    Command::Cnxn,
                    PROTOCOL_VERSION,
                    DEFAULT_MAX_PAYLOAD as u32,
                    b"device::ro.product.model=Test\0".to_vec(),
                )],
                _ => device(msg),
            });
        AdbConnection::connect(transport, &[] as &[NoSigner], &ConnectOptions::default()).unwrap()
    }

    /// A device that accepts every OPEN and acknowledges every WRTE.
    fn accepting(msg: &AdbMessage) -> Vec<AdbMessage> {
        match msg.command {
            Command::Open => vec![okay(msg.arg0)],
            Command::Wrte => vec![okay(msg.arg0)],
            _ => vec![],
        }
    }

    fn sent(conn: &AdbConnection<MockTransport>, command: Command) -> Vec<AdbMessage> {
        conn.transport()
            .sent()
            .iter()
            .filter(|m| m.command == command)
            .cloned()
            .collect()
    }

    #[test]
    fn test_connect_records_banner() {
        let conn = connect(accepting);
        assert_eq!(conn.state(), "device");
        assert_eq!(conn.banner().property("ro.product.model"), Some("Test"));
        assert!(!conn.is_authenticated());
        assert_eq!(conn.max_payload(), DEFAULT_MAX_PAYLOAD);
    }

    #[test]
    fn test_connect_failure_closes_transport() {
        let transport = MockTransport::new().with_responder(|msg| match msg.command {
            Command::Cnxn => vec![AdbMessage::new(Command::Cnxn, PROTOCOL_VERSION, 4096, b"bogus".to_vec())],
            _ => vec![],
        });
        let err = AdbConnection::connect(transport, &[] as &[NoSigner], &ConnectOptions::default())
            .unwrap_err();
        assert!(matches!(err, AdbError::MalformedBanner(_)));
    }

    #[test]
    fn test_open_assigns_ids() {
        let mut conn = connect(accepting);

        let first = conn.open("shell:", TIMEOUT).unwrap();
        let second = conn.open("sync:", TIMEOUT).unwrap();

        assert_eq!(first.local_id(), 1);
        assert_eq!(first.remote_id(), 101);
        assert_eq!(second.local_id(), 2);
        assert_eq!(second.destination(), "sync:");

        let opens = sent(&conn, Command::Open);
        assert_eq!(opens[0].arg0, 1);
        assert_eq!(opens[0].arg1, 0);
        assert_eq!(opens[0].payload, b"shell:\0");
    }

    #[test]
    fn test_open_refused() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![AdbMessage::new(Command::Clse, 0, msg.arg0, Vec::new())],
            _ => vec![],
        });

        let err = conn.open("nope:", TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::StreamOpen { ref destination } if destination == "nope:"));
        assert!(!err.is_fatal());
        assert_eq!(conn.open_streams(), 0);
    }

    #[test]
    fn test_open_mismatched_okay_is_protocol_error() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![AdbMessage::new(Command::Okay, 5, msg.arg0 + 40, Vec::new())],
            _ => vec![],
        });

        let err = conn.open("shell:", TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }

    #[test]
    fn test_open_timeout_names_phase() {
        let mut conn = connect(|_| vec![]);
        let err = conn.open("shell:", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Open));
        assert_eq!(conn.open_streams(), 0);
    }

    #[test]
    fn test_late_okay_after_write_timeout_does_not_break_open() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open if msg.arg0 == 1 => vec![okay(1)],
            // The acknowledgement for the stalled WRTE shows up ahead of the new stream's OKAY.
            Command::Open => vec![okay(1), okay(msg.arg0)],
            _ => vec![],
        });
        let stalled = conn.open("shell:", TIMEOUT).unwrap();
        let err = conn.write(&stalled, b"ls\n", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Write));

        let sync = conn.open("sync:", TIMEOUT).unwrap();
        assert_eq!(sync.local_id(), 2);
        assert_eq!(conn.stream_state(&sync), Some(StreamState::Open));
        assert_eq!(conn.stream_state(&stalled), Some(StreamState::Closing));
    }

    #[test]
    fn test_late_okay_after_open_timeout_is_closed() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open if msg.arg0 == 1 => vec![],
            Command::Open => vec![okay(1), okay(msg.arg0)],
            _ => vec![],
        });
        let err = conn.open("shell:", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Open));

        let sync = conn.open("sync:", TIMEOUT).unwrap();
        assert_eq!(sync.local_id(), 2);

        // The device-side stream for the abandoned OPEN is closed again.
        let closes = sent(&conn, Command::Clse);
        assert_eq!(closes.len(), 1);
        assert_eq!((closes[0].arg0, closes[0].arg1), (1, 101));
    }

    #[test]
    fn test_abandoned_id_is_not_reused_until_closed() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open if msg.arg0 == 1 => vec![],
            Command::Open => vec![okay(msg.arg0)],
            _ => vec![],
        });
        conn.open("shell:", Duration::from_millis(20)).unwrap_err();
        conn.next_local_id = 1;

        let stream = conn.open("shell:", TIMEOUT).unwrap();
        assert_eq!(stream.local_id(), 2);
    }

    #[test]
    fn test_write_splits_into_acknowledged_chunks() {
        let mut conn = connect(accepting);
        let stream = conn.open("shell:", TIMEOUT).unwrap();

        let data = vec![0x42u8; DEFAULT_MAX_PAYLOAD * 2 + 1808];
        conn.write(&stream, &data, TIMEOUT).unwrap();

        let writes = sent(&conn, Command::Wrte);
        let sizes: Vec<usize> = writes.iter().map(|m| m.payload.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert!(writes.iter().all(|m| m.arg0 == 1 && m.arg1 == 101));
    }

    #[test]
    fn test_write_without_ack_times_out_and_fails_stream() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0)],
            _ => vec![],
        });
        let stream = conn.open("shell:", TIMEOUT).unwrap();

        let err = conn.write(&stream, b"ls\n", Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.phase(), Some(Phase::Write));
        assert_eq!(conn.stream_state(&stream), Some(StreamState::Closing));

        let err = conn.write(&stream, b"ls\n", TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::StreamClosed { local_id: 1 }));
    }

    #[test]
    fn test_clse_during_write() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0)],
            Command::Wrte => vec![clse(msg.arg0)],
            _ => vec![],
        });
        let stream = conn.open("shell:", TIMEOUT).unwrap();

        let err = conn.write(&stream, b"x", TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::StreamClosed { .. }));
        assert_eq!(conn.stream_state(&stream), Some(StreamState::Closed));
    }

    #[test]
    fn test_read_until_close() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0), wrte(msg.arg0, b"hello"), clse(msg.arg0)],
            _ => vec![],
        });
        let stream = conn.open("shell:echo hello", TIMEOUT).unwrap();

        assert_eq!(conn.read(&stream, TIMEOUT).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(conn.read(&stream, TIMEOUT).unwrap(), None);
        assert_eq!(conn.read(&stream, TIMEOUT).unwrap(), None);

        let okays = sent(&conn, Command::Okay);
        assert_eq!(okays.len(), 1);
        assert_eq!((okays[0].arg0, okays[0].arg1), (1, 101));

        // The device's CLSE is answered exactly once.
        assert_eq!(sent(&conn, Command::Clse).len(), 1);
    }

    #[test]
    fn test_read_close_before_data_is_empty() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0), clse(msg.arg0)],
            _ => vec![],
        });
        let stream = conn.open("shell:true", TIMEOUT).unwrap();
        assert_eq!(conn.read(&stream, TIMEOUT).unwrap(), None);
    }

    #[test]
    fn test_closed_stream_rejects_io() {
        let mut conn = connect(accepting);
        let stream = conn.open("shell:", TIMEOUT).unwrap();

        conn.close(&stream).unwrap();
        conn.close(&stream).unwrap();

        assert!(matches!(
            conn.read(&stream, TIMEOUT).unwrap_err(),
            AdbError::StreamClosed { local_id: 1 }
        ));
        assert!(matches!(
            conn.write(&stream, b"x", TIMEOUT).unwrap_err(),
            AdbError::StreamClosed { local_id: 1 }
        ));
        assert_eq!(sent(&conn, Command::Clse).len(), 1);
    }

    #[test]
    fn test_frames_for_other_streams_are_queued() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open if msg.arg0 == 1 => vec![okay(1)],
            Command::Open => vec![okay(2), wrte(1, b"for one"), wrte(2, b"for two")],
            _ => vec![],
        });
        let one = conn.open("shell:", TIMEOUT).unwrap();
        let two = conn.open("shell:", TIMEOUT).unwrap();

        assert_eq!(conn.read(&two, TIMEOUT).unwrap(), Some(b"for two".to_vec()));
        // Stream one's data waited in its queue and is acknowledged on read.
        assert_eq!(sent(&conn, Command::Okay).len(), 1);
        assert_eq!(conn.read(&one, TIMEOUT).unwrap(), Some(b"for one".to_vec()));

        let okays = sent(&conn, Command::Okay);
        assert_eq!(okays.len(), 2);
        assert_eq!(okays[1].arg0, 1);
    }

    #[test]
    fn test_wrte_from_wrong_remote_is_protocol_error() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![
                okay(msg.arg0),
                AdbMessage::new(Command::Wrte, 999, msg.arg0, b"x".to_vec()),
            ],
            _ => vec![],
        });
        let stream = conn.open("shell:", TIMEOUT).unwrap();
        let err = conn.read(&stream, TIMEOUT).unwrap_err();
        assert!(matches!(err, AdbError::Protocol(_)));
    }

    #[test]
    fn test_unexpected_cnxn_is_protocol_error() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0), AdbMessage::new(Command::Cnxn, 0, 0, Vec::new())],
            _ => vec![],
        });
        let stream = conn.open("shell:", TIMEOUT).unwrap();
        let err = conn.read(&stream, TIMEOUT).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_command_collects_output() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => {
                assert_eq!(msg.payload, b"shell:echo hi\0");
                vec![okay(msg.arg0), wrte(msg.arg0, b"hi"), wrte(msg.arg0, b"\n"), clse(msg.arg0)]
            }
            _ => vec![],
        });

        let output = conn.command("shell", Some("echo hi"), TIMEOUT).unwrap();
        assert_eq!(output, b"hi\n");
        assert_eq!(conn.open_streams(), 0);
    }

    #[test]
    fn test_command_without_argument() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => {
                assert_eq!(msg.payload, b"reboot:\0");
                vec![okay(msg.arg0), clse(msg.arg0)]
            }
            _ => vec![],
        });
        assert!(conn.command("reboot", None, TIMEOUT).unwrap().is_empty());
    }

    #[test]
    fn test_streaming_command_yields_chunks() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![
                okay(msg.arg0),
                wrte(msg.arg0, b"line 1\n"),
                wrte(msg.arg0, b"line 2\n"),
                clse(msg.arg0),
            ],
            _ => vec![],
        });

        let chunks: Vec<Vec<u8>> = conn
            .streaming_command("shell", Some("cat log"), TIMEOUT)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks, vec![b"line 1\n".to_vec(), b"line 2\n".to_vec()]);
    }

    #[test]
    fn test_streaming_command_drop_closes_stream() {
        let mut conn = connect(|msg| match msg.command {
            Command::Open => vec![okay(msg.arg0), wrte(msg.arg0, b"a"), wrte(msg.arg0, b"b")],
            _ => vec![],
        });

        {
            let mut output = conn.streaming_command("shell", Some("logcat"), TIMEOUT).unwrap();
            assert_eq!(output.next().unwrap().unwrap(), b"a");
        }

        let closes = sent(&conn, Command::Clse);
        assert_eq!(closes.len(), 1);
        assert_eq!((closes[0].arg0, closes[0].arg1), (1, 101));
    }

    #[test]
    fn test_service_stream_is_reused() {
        let mut conn = connect(accepting);

        let first = conn.service_stream("shell:", TIMEOUT).unwrap();
        let again = conn.service_stream("shell:", TIMEOUT).unwrap();
        assert_eq!(first, again);
        assert_eq!(sent(&conn, Command::Open).len(), 1);

        conn.forget_service("shell:").unwrap();
        let fresh = conn.service_stream("shell:", TIMEOUT).unwrap();
        assert_ne!(fresh.local_id(), first.local_id());
    }

    #[test]
    fn test_close_all_streams_is_best_effort() {
        let mut conn = connect(accepting);
        let shell = conn.open("shell:", TIMEOUT).unwrap();
        conn.open("sync:", TIMEOUT).unwrap();
        conn.service_stream("shell:", TIMEOUT).unwrap();
        conn.close(&shell).unwrap();

        conn.close_all_streams();

        // The stream already closing is not closed twice.
        assert_eq!(sent(&conn, Command::Clse).len(), 3);
        assert_eq!(conn.open_streams(), 0);
        conn.shutdown().unwrap();
    }

    #[test]
    fn test_local_ids_skip_zero_and_live_ids() {
        let mut conn = connect(accepting);
        conn.next_local_id = u32::MAX;

        let last = conn.open("shell:", TIMEOUT).unwrap();
        let wrapped = conn.open("shell:", TIMEOUT).unwrap();
        assert_eq!(last.local_id(), u32::MAX);
        assert_eq!(wrapped.local_id(), 1);
    }
}

//! File-sync sub-protocol carried inside a `sync:` stream.
//!
//! # Sub-frame format
//!
//! ```text
//! +--------+----------+---------------------+
//! | id [4] | word u32 | payload (word bytes) |
//! +--------+----------+---------------------+
//! ```
//!
//! Requests (`STAT`, `LIST`, `SEND`, `RECV`) carry a path payload. `DATA` and
//! `FAIL` carry `word` bytes. In replies, `STAT`, `DENT` and the `DONE` that
//! ends a listing are fixed records; the `DONE` that ends a push carries the
//! file mtime in `word`.
//!
//! Sub-frames are independent of WRTE boundaries: incoming stream data is
//! buffered and frames are cut from the buffer.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};

use crate::connection::{AdbConnection, Stream};
use crate::error::{AdbError, Phase, Result};
use crate::transport::Transport;

/// Largest DATA chunk the device accepts.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Longest device path accepted in a request.
pub const MAX_PATH: usize = 1024;

/// Mode sent with SEND when the caller has no preference (`-rw-r--r--`).
pub const DEFAULT_PUSH_MODE: u32 = 0o100644;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

/// Sub-frame header size.
const SYNC_HEADER_SIZE: usize = 8;

/// Longest FAIL message accepted from the device.
const MAX_FAIL_MESSAGE: usize = 4096;

/// Sync sub-frame identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncId {
    /// Metadata request, and its 16-byte reply.
    Stat,
    /// Directory listing request.
    List,
    /// Start of a push; the payload is `path,mode`.
    Send,
    /// Start of a pull.
    Recv,
    /// One chunk of file content.
    Data,
    /// End of a push or of a listing.
    Done,
    /// Device accepted a push.
    Okay,
    /// Device rejected a request; the payload is the reason.
    Fail,
    /// One directory entry of a listing.
    Dent,
}

impl SyncId {
    const ALL: [SyncId; 9] = [
        SyncId::Stat,
        SyncId::List,
        SyncId::Send,
        SyncId::Recv,
        SyncId::Data,
        SyncId::Done,
        SyncId::Okay,
        SyncId::Fail,
        SyncId::Dent,
    ];

    /// The four ASCII bytes on the wire.
    pub const fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            SyncId::Stat => b"STAT",
            SyncId::List => b"LIST",
            SyncId::Send => b"SEND",
            SyncId::Recv => b"RECV",
            SyncId::Data => b"DATA",
            SyncId::Done => b"DONE",
            SyncId::Okay => b"OKAY",
            SyncId::Fail => b"FAIL",
            SyncId::Dent => b"DENT",
        }
    }

    /// Looks up an id from its wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_bytes() == bytes)
    }
}

impl std::fmt::Display for SyncId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Result of STAT. A path that does not exist reports all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    /// POSIX mode bits, including the file type.
    pub mode: u32,
    /// Size in bytes.
    pub size: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: u32,
}

impl FileStat {
    /// Whether the device reported anything for the path.
    pub fn exists(&self) -> bool {
        self.mode != 0 || self.size != 0 || self.mtime != 0
    }

    /// Whether the mode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == 0o040000
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Unix mode bits, type included.
    pub mode: u32,
    /// Size in bytes, truncated to 32 bits by the device.
    pub size: u32,
    /// Modification time in seconds since the epoch.
    pub mtime: u32,
    /// Entry name without the directory part.
    pub name: String,
}

/// A sync session bound to one `sync:` stream.
///
/// Requests are strictly sequential. After any failure other than a rejected
/// local input the session refuses further requests; open a new one.
pub struct SyncSession<'a, T: Transport> {
    conn: &'a mut AdbConnection<T>,
    stream: Stream,
    inbox: BytesMut,
    timeout: Duration,
    chunk_size: usize,
    poisoned: bool,
}

impl<'a, T: Transport> SyncSession<'a, T> {
    /// Opens a fresh `sync:` stream on `conn`.
    pub fn open(conn: &'a mut AdbConnection<T>, timeout: Duration) -> Result<Self> {
        let stream = conn.open("sync:", timeout)?;
        Ok(Self::new(conn, stream, timeout))
    }

    /// Wraps a stream already opened for `sync:`.
    pub fn new(conn: &'a mut AdbConnection<T>, stream: Stream, timeout: Duration) -> Self {
        Self {
            conn,
            stream,
            inbox: BytesMut::new(),
            timeout,
            chunk_size: SYNC_DATA_MAX,
            poisoned: false,
        }
    }

    /// Sets the DATA chunk size used by push, capped at [`SYNC_DATA_MAX`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, SYNC_DATA_MAX);
        self
    }

    /// The underlying stream.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Stats a device path.
    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        self.guarded(|s| {
            s.request(SyncId::Stat, path.as_bytes())?;
            let mut record = s.read_bytes(16)?;
            let id = record.split_to(4);
            if id[..] != SyncId::Stat.as_bytes()[..] {
                return Err(unexpected(&id, "STAT"));
            }
            Ok(FileStat {
                mode: record.get_u32_le(),
                size: record.get_u32_le(),
                mtime: record.get_u32_le(),
            })
        })
    }

    /// Starts listing a device directory.
    ///
    /// The returned iterator is single-pass; abandoning it before the end
    /// leaves unread frames on the stream and makes the session unusable.
    pub fn list(&mut self, path: &str) -> Result<DirectoryListing<'_, 'a, T>> {
        self.check_usable()?;
        check_path(path.len())?;
        if let Err(e) = self.request(SyncId::List, path.as_bytes()) {
            self.poisoned = true;
            return Err(e);
        }
        Ok(DirectoryListing {
            session: self,
            done: false,
        })
    }

    /// Lists a device directory into a vector.
    pub fn list_all(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.list(path)?.collect()
    }

    /// Sends everything `source` yields to `path` on the device.
    ///
    /// A `mode` without file-type bits is treated as a regular file.
    pub fn push<R: Read>(&mut self, source: &mut R, path: &str, mode: u32, mtime: u32) -> Result<u64> {
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let header = format!("{},{}", path, mode);
        check_path(header.len())?;

        self.guarded(|s| {
            s.request(SyncId::Send, header.as_bytes())?;

            let mut chunk = vec![0u8; s.chunk_size];
            let mut total = 0u64;
            loop {
                let n = fill(source, &mut chunk)?;
                if n == 0 {
                    break;
                }
                s.send_frame(SyncId::Data, n as u32, &chunk[..n])?;
                total += n as u64;
            }
            s.send_frame(SyncId::Done, mtime, &[])?;

            let (id, word) = s.read_header()?;
            match id {
                SyncId::Okay => {
                    tracing::debug!(path, bytes = total, "Push complete");
                    Ok(total)
                }
                SyncId::Fail => Err(s.read_failure(word)),
                other => Err(unexpected(other.as_bytes(), "SEND")),
            }
        })
    }

    /// Pushes an in-memory buffer.
    pub fn push_bytes(&mut self, data: &[u8], path: &str, mode: u32, mtime: u32) -> Result<u64> {
        let mut source = data;
        self.push(&mut source, path, mode, mtime)
    }

    /// Copies the device file at `path` into `sink`.
    pub fn pull<W: Write>(&mut self, path: &str, sink: &mut W) -> Result<u64> {
        check_path(path.len())?;
        self.guarded(|s| {
            s.request(SyncId::Recv, path.as_bytes())?;

            let mut total = 0u64;
            loop {
                let (id, word) = s.read_header()?;
                match id {
                    SyncId::Data => {
                        if word as usize > SYNC_DATA_MAX {
                            return Err(AdbError::Protocol(format!(
                                "DATA chunk of {} bytes exceeds {}",
                                word, SYNC_DATA_MAX
                            )));
                        }
                        let data = s.read_bytes(word as usize)?;
                        sink.write_all(&data).map_err(AdbError::LocalIo)?;
                        total += data.len() as u64;
                    }
                    SyncId::Done => break,
                    SyncId::Fail => return Err(s.read_failure(word)),
                    other => return Err(unexpected(other.as_bytes(), "RECV")),
                }
            }
            sink.flush().map_err(AdbError::LocalIo)?;
            tracing::debug!(path, bytes = total, "Pull complete");
            Ok(total)
        })
    }

    /// Pulls a device file into memory.
    pub fn pull_bytes(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.pull(path, &mut data)?;
        Ok(data)
    }

    /// Closes the sync stream.
    pub fn close(self) -> Result<()> {
        self.conn.close(&self.stream)
    }

    fn guarded<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.check_usable()?;
        let result = op(self);
        if let Err(e) = &result {
            if !matches!(e, AdbError::Overflow(_)) {
                self.poisoned = true;
            }
        }
        result
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(AdbError::Sync(
                "session is unusable after an earlier failure".to_string(),
            ));
        }
        Ok(())
    }

    fn request(&mut self, id: SyncId, path: &[u8]) -> Result<()> {
        check_path(path.len())?;
        self.send_frame(id, path.len() as u32, path)
    }

    fn send_frame(&mut self, id: SyncId, word: u32, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::with_capacity(SYNC_HEADER_SIZE + payload.len());
        frame.put_slice(id.as_bytes());
        frame.put_u32_le(word);
        frame.put_slice(payload);
        self.conn
            .write(&self.stream, &frame, self.timeout)
            .map_err(|e| e.during(Phase::Sync))
    }

    fn read_header(&mut self) -> Result<(SyncId, u32)> {
        let mut header = self.read_bytes(SYNC_HEADER_SIZE)?;
        let raw = header.split_to(4);
        let id = SyncId::from_bytes(&raw).ok_or_else(|| unexpected(&raw, "sync request"))?;
        Ok((id, header.get_u32_le()))
    }

    fn read_failure(&mut self, len: u32) -> AdbError {
        if len as usize > MAX_FAIL_MESSAGE {
            return AdbError::Protocol(format!(
                "FAIL message of {} bytes exceeds {}",
                len, MAX_FAIL_MESSAGE
            ));
        }
        match self.read_bytes(len as usize) {
            Ok(message) => AdbError::Sync(String::from_utf8_lossy(&message).into_owned()),
            Err(e) => e,
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<BytesMut> {
        while self.inbox.len() < len {
            let chunk = self
                .conn
                .read(&self.stream, self.timeout)
                .map_err(|e| e.during(Phase::Sync))?;
            match chunk {
                Some(data) => self.inbox.extend_from_slice(&data),
                None => {
                    return Err(AdbError::Sync(format!(
                        "device closed the sync stream with {} of {} bytes received",
                        self.inbox.len(),
                        len
                    )));
                }
            }
        }
        Ok(self.inbox.split_to(len))
    }
}

/// Entries of a LIST reply, ending at the device's DONE record.
pub struct DirectoryListing<'s, 'a, T: Transport> {
    session: &'s mut SyncSession<'a, T>,
    done: bool,
}

impl<T: Transport> DirectoryListing<'_, '_, T> {
    fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        let (id, mode) = self.session.read_header()?;
        match id {
            SyncId::Dent => {
                let mut rest = self.session.read_bytes(12)?;
                let size = rest.get_u32_le();
                let mtime = rest.get_u32_le();
                let name_len = rest.get_u32_le() as usize;
                check_path(name_len)?;
                let name = self.session.read_bytes(name_len)?;
                Ok(Some(DirEntry {
                    mode,
                    size,
                    mtime,
                    name: String::from_utf8_lossy(&name).into_owned(),
                }))
            }
            SyncId::Done => {
                self.session.read_bytes(12)?;
                Ok(None)
            }
            SyncId::Fail => Err(self.session.read_failure(mode)),
            other => Err(unexpected(other.as_bytes(), "LIST")),
        }
    }
}

impl<T: Transport> Iterator for DirectoryListing<'_, '_, T> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.session.poisoned = true;
                Some(Err(e))
            }
        }
    }
}

impl<T: Transport> Drop for DirectoryListing<'_, '_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.session.poisoned = true;
        }
    }
}

fn check_path(len: usize) -> Result<()> {
    if len > MAX_PATH {
        return Err(AdbError::Overflow(format!(
            "path of {} bytes exceeds the {} byte limit",
            len, MAX_PATH
        )));
    }
    Ok(())
}

fn unexpected(id: &[u8], during: &str) -> AdbError {
    AdbError::Protocol(format!(
        "unexpected sync id {:?} in reply to {}",
        String::from_utf8_lossy(id),
        during
    ))
}

/// Reads until `buf` is full or the source is exhausted.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(AdbError::LocalIo(e)),
        }
    }
    Ok(filled)
}

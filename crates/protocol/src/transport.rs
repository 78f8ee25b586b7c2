//! The byte-transport boundary consumed by the engine.
//!
//! USB and TCP implementations live outside this crate. Both may deliver
//! fewer bytes than requested on read and accept fewer bytes than offered on
//! write, so the helpers here loop until the request is satisfied or the
//! deadline passes.

use std::io;
use std::time::{Duration, Instant};

use crate::error::{AdbError, Phase, Result};

/// A duplex, ordered byte channel with bounded-size writes.
pub trait Transport {
    /// Reads up to `max_len` bytes. An empty result means end of stream.
    fn read(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>>;

    /// Writes some prefix of `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    /// Releases the underlying channel.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        (**self).read(max_len, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        (**self).write(data, timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

fn remaining(deadline: Instant, phase: Phase, what: &str) -> Result<Duration> {
    let now = Instant::now();
    if now >= deadline {
        return Err(AdbError::Timeout {
            phase,
            detail: format!("deadline passed while {}", what),
        });
    }
    Ok(deadline - now)
}

/// Reads exactly `len` bytes, looping over short reads until `deadline`.
pub fn read_exact<T: Transport + ?Sized>(
    transport: &mut T,
    len: usize,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        let timeout = remaining(deadline, Phase::Read, "reading")?;
        let chunk = transport
            .read(len - buf.len(), timeout)
            .map_err(|e| AdbError::from(e).during(Phase::Read))?;
        if chunk.is_empty() {
            return Err(AdbError::ConnectionClosed(format!(
                "end of stream after {} of {} bytes",
                buf.len(),
                len
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    // A misbehaving transport may hand back more than asked for.
    buf.truncate(len);
    Ok(buf)
}

/// Writes all of `data`, retrying partial writes until `deadline`.
pub fn write_all<T: Transport + ?Sized>(
    transport: &mut T,
    data: &[u8],
    deadline: Instant,
) -> Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let timeout = remaining(deadline, Phase::Write, "writing")?;
        let written = transport
            .write(&data[offset..], timeout)
            .map_err(|e| AdbError::from(e).during(Phase::Write))?;
        if written == 0 {
            return Err(AdbError::ConnectionClosed(format!(
                "transport accepted no bytes after {} of {}",
                offset,
                data.len()
            )));
        }
        offset += written;
    }
    Ok(())
}

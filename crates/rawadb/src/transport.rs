//! TCP transport for devices in `adb tcpip` mode.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use adb_protocol::Transport;

/// Upper bound on a single read from the socket.
const READ_CHUNK: usize = 64 * 1024;

/// Socket timeouts must be non-zero.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Splits `host[:port]` into a host and a port.
///
/// Bracketed IPv6 (`[::1]:5555`) and bare IPv6 (`::1`) are accepted.
pub fn parse_serial(serial: &str, default_port: u16) -> io::Result<(String, u16)> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);

    if let Some(rest) = serial.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("unterminated '[' in {:?}", serial)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port).ok_or_else(|| invalid(format!("invalid port in {:?}", serial)))?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid(format!("unexpected {:?} after address", tail))),
        };
        return Ok((host.to_string(), port));
    }

    match serial.matches(':').count() {
        0 => Ok((serial.to_string(), default_port)),
        1 => {
            let (host, port) = serial.split_once(':').unwrap_or((serial, ""));
            let port = parse_port(port).ok_or_else(|| invalid(format!("invalid port in {:?}", serial)))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((serial.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse::<u16>().ok().filter(|&p| p != 0)
}

/// A device reached over TCP.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connects to `host[:port]`, trying each resolved address in turn.
    pub fn connect(serial: &str, default_port: u16, timeout: Duration) -> io::Result<Self> {
        let (host, port) = parse_serial(serial, default_port)?;

        let mut last_err = None;
        for addr in (host.as_str(), port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout.max(MIN_TIMEOUT)) {
                Ok(stream) => {
                    tracing::debug!(%addr, "TCP connected");
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", host),
            )
        }))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    /// Address of the device.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, max_len: usize, timeout: Duration) -> io::Result<Vec<u8>> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        let mut buf = vec![0u8; max_len.min(READ_CHUNK)];
        let n = loop {
            match self.stream.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        self.stream.set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        loop {
            match self.stream.write(data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

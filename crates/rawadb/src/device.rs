//! High-level device operations built on the protocol engine.
//!
//! Nothing here touches the wire directly: every call is a shell command, a
//! named service, or a sync session on the owned [`AdbConnection`].

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use adb_protocol::{
    AdbConnection, AdbError, AuthSigner, DeviceBanner, DirEntry, FileStat, Result, StreamingOutput,
    SyncSession, Transport,
};

use crate::config::Config;
use crate::transport::TcpTransport;

/// Where [`AdbDevice::install`] stages packages by default.
pub const DEFAULT_INSTALL_DIR: &str = "/data/local/tmp/";

/// A connected device.
pub struct AdbDevice<T: Transport = TcpTransport> {
    conn: AdbConnection<T>,
    timeout: Duration,
    chunk_size: usize,
    default_mode: u32,
}

impl AdbDevice<TcpTransport> {
    /// Connects to a device in TCP mode at `host[:port]`.
    pub fn connect_tcp<S: AuthSigner>(serial: &str, signers: &[S], config: &Config) -> Result<Self> {
        let transport =
            TcpTransport::connect(serial, config.connection.tcp_port, config.default_timeout())
                .map_err(AdbError::from)?;
        tracing::info!(peer = %transport.peer_addr(), "Connecting to device");
        Self::connect(transport, signers, config)
    }
}

impl<T: Transport> AdbDevice<T> {
    /// Performs the handshake over an arbitrary transport.
    pub fn connect<S: AuthSigner>(transport: T, signers: &[S], config: &Config) -> Result<Self> {
        let conn = AdbConnection::connect(transport, signers, &config.connect_options())?;
        Ok(Self::from_connection(conn, config))
    }

    /// Wraps an established connection.
    pub fn from_connection(conn: AdbConnection<T>, config: &Config) -> Self {
        Self {
            conn,
            timeout: config.default_timeout(),
            chunk_size: config.sync.chunk_size,
            default_mode: config.sync.default_mode,
        }
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut AdbConnection<T> {
        &mut self.conn
    }

    /// Per-call timeout used by every operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replaces the per-request timeout for later operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Device state from the banner, e.g. `device` or `recovery`.
    pub fn state(&self) -> &str {
        self.conn.state()
    }

    /// Banner the device sent in its CNXN.
    pub fn banner(&self) -> &DeviceBanner {
        self.conn.banner()
    }

    /// Whether the device asked for authentication and accepted us.
    pub fn is_authenticated(&self) -> bool {
        self.conn.is_authenticated()
    }

    /// Runs a shell command and returns its output.
    pub fn shell(&mut self, command: &str) -> Result<String> {
        let output = self.conn.command("shell", Some(command), self.timeout)?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Runs a shell command, yielding output as it arrives.
    pub fn streaming_shell(&mut self, command: &str) -> Result<StreamingOutput<'_, T>> {
        self.conn.streaming_command("shell", Some(command), self.timeout)
    }

    /// Streams `logcat` with extra command-line options.
    pub fn logcat(&mut self, options: &str) -> Result<StreamingOutput<'_, T>> {
        let command = if options.is_empty() {
            "logcat".to_string()
        } else {
            format!("logcat {}", options)
        };
        self.streaming_shell(&command)
    }

    /// Talks to a persistent interactive shell.
    ///
    /// Sends `command` (if any) followed by a newline. With a `delimiter`,
    /// reads until it appears in the output; otherwise returns the next chunk
    /// the shell produces. The echoed command and the delimiter are stripped.
    /// The shell stream stays open across calls.
    pub fn interactive_shell(&mut self, command: Option<&str>, delimiter: Option<&str>) -> Result<String> {
        let stream = self.conn.service_stream("shell:", self.timeout)?;

        if let Some(command) = command {
            let line = format!("{}\n", command);
            self.conn.write(&stream, line.as_bytes(), self.timeout)?;
        }

        let mut output = String::new();
        loop {
            match self.conn.read(&stream, self.timeout)? {
                Some(chunk) => output.push_str(&String::from_utf8_lossy(&chunk)),
                None => break,
            }
            match delimiter {
                Some(delim) if !output.contains(delim) => continue,
                _ => break,
            }
        }

        Ok(strip_interactive(&output, command, delimiter))
    }

    /// Stats a device path. Missing paths report all zeros.
    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        self.with_sync(|sync| sync.stat(path))
    }

    /// Lists a device directory, including `.` and `..` when the device
    /// reports them.
    pub fn list(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.with_sync(|sync| sync.list_all(path))
    }

    /// Pushes everything `source` yields to `path`.
    pub fn push<R: Read>(&mut self, source: &mut R, path: &str, mode: u32, mtime: u32) -> Result<u64> {
        self.with_sync(|sync| sync.push(source, path, mode, mtime))
    }

    /// Pushes a byte buffer with the configured default mode.
    pub fn push_bytes(&mut self, data: &[u8], path: &str) -> Result<u64> {
        let mode = self.default_mode;
        self.with_sync(|sync| sync.push_bytes(data, path, mode, unix_now()))
    }

    /// Pushes a local file or directory tree to `remote`.
    ///
    /// Directories are created on the device with `mkdir -p` before any file
    /// is sent. Returns the total number of bytes transferred.
    pub fn push_file(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        collect_tree(local, remote.trim_end_matches('/'), &mut dirs, &mut files)
            .map_err(AdbError::LocalIo)?;

        for dir in &dirs {
            tracing::debug!(dir = %dir, "Creating remote directory");
            self.shell(&format!("mkdir -p {}", quote(dir)))?;
        }

        let default_mode = self.default_mode;
        let chunk_size = self.chunk_size;
        let timeout = self.timeout;
        let mut sync = SyncSession::open(&mut self.conn, timeout)?.with_chunk_size(chunk_size);

        let mut total = 0;
        for (source, target) in &files {
            let metadata = fs::metadata(source).map_err(AdbError::LocalIo)?;
            let mut file = fs::File::open(source).map_err(AdbError::LocalIo)?;
            let mode = file_mode(&metadata).unwrap_or(default_mode);
            let mtime = file_mtime(&metadata);
            let sent = match sync.push(&mut file, target, mode, mtime) {
                Ok(sent) => sent,
                Err(e) => {
                    close_session(sync);
                    return Err(e);
                }
            };
            tracing::info!(source = %source.display(), target = %target, bytes = sent, "Pushed file");
            total += sent;
        }

        sync.close()?;
        Ok(total)
    }

    /// Pulls `path` into `sink`, returning the number of bytes written.
    pub fn pull<W: Write>(&mut self, path: &str, sink: &mut W) -> Result<u64> {
        self.with_sync(|sync| sync.pull(path, sink))
    }

    /// Pulls `path` into memory.
    pub fn pull_bytes(&mut self, path: &str) -> Result<Vec<u8>> {
        self.with_sync(|sync| sync.pull_bytes(path))
    }

    /// Pulls `path` into a local file, which is removed if the pull fails.
    pub fn pull_file(&mut self, path: &str, local: &Path) -> Result<u64> {
        let mut file = fs::File::create(local).map_err(AdbError::LocalIo)?;
        let result = self
            .pull(path, &mut file)
            .and_then(|n| file.flush().map(|()| n).map_err(AdbError::LocalIo));
        if result.is_err() {
            drop(file);
            if let Err(e) = fs::remove_file(local) {
                tracing::warn!(path = %local.display(), error = %e, "Failed to remove partial download");
            }
        }
        result
    }

    /// Reboots the device, optionally into `target` (e.g. `bootloader`).
    ///
    /// The device usually drops the connection right away, so the stream is
    /// closed best-effort.
    pub fn reboot(&mut self, target: Option<&str>) -> Result<()> {
        let destination = format!("reboot:{}", target.unwrap_or(""));
        let stream = self.conn.open(&destination, self.timeout)?;
        if let Err(e) = self.conn.close(&stream) {
            tracing::debug!(error = %e, "Ignoring close failure after reboot");
        }
        Ok(())
    }

    /// Reboots into the bootloader.
    pub fn reboot_bootloader(&mut self) -> Result<()> {
        self.reboot(Some("bootloader"))
    }

    /// Remounts system partitions read-write.
    pub fn remount(&mut self) -> Result<String> {
        self.service("remount")
    }

    /// Restarts adbd as root.
    pub fn root(&mut self) -> Result<String> {
        self.service("root")
    }

    /// Re-enables dm-verity on userdebug builds.
    pub fn enable_verity(&mut self) -> Result<String> {
        self.service("enable-verity")
    }

    /// Disables dm-verity on userdebug builds.
    pub fn disable_verity(&mut self) -> Result<String> {
        self.service("disable-verity")
    }

    /// Pushes an APK to `destination_dir` (default [`DEFAULT_INSTALL_DIR`])
    /// and installs it with `pm install`. Returns the `pm` output.
    pub fn install(&mut self, apk: &Path, destination_dir: Option<&str>, replace: bool) -> Result<String> {
        let name = apk.file_name().ok_or_else(|| {
            AdbError::LocalIo(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", apk.display()),
            ))
        })?;
        let dir = destination_dir.unwrap_or(DEFAULT_INSTALL_DIR);
        let target = format!("{}/{}", dir.trim_end_matches('/'), name.to_string_lossy());

        self.push_file(apk, &target)?;

        let mut command = String::from("pm install");
        if replace {
            command.push_str(" -r");
        }
        command.push(' ');
        command.push_str(&quote(&target));
        self.shell(&command)
    }

    /// Removes a package, optionally keeping its data and cache.
    pub fn uninstall(&mut self, package: &str, keep_data: bool) -> Result<String> {
        let mut command = String::from("pm uninstall");
        if keep_data {
            command.push_str(" -k");
        }
        command.push(' ');
        command.push_str(&quote(package));
        self.shell(&command)
    }

    /// Closes every stream and the transport.
    pub fn close(self) -> Result<()> {
        self.conn.shutdown()
    }

    fn service(&mut self, name: &str) -> Result<String> {
        let output = self.conn.command(name, None, self.timeout)?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Runs `op` on a fresh sync session, closing it afterwards.
    fn with_sync<R>(&mut self, op: impl FnOnce(&mut SyncSession<'_, T>) -> Result<R>) -> Result<R> {
        let mut sync =
            SyncSession::open(&mut self.conn, self.timeout)?.with_chunk_size(self.chunk_size);
        match op(&mut sync) {
            Ok(value) => {
                sync.close()?;
                Ok(value)
            }
            Err(e) => {
                close_session(sync);
                Err(e)
            }
        }
    }
}

impl<T: Transport> std::fmt::Debug for AdbDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbDevice")
            .field("conn", &self.conn)
            .field("timeout", &self.timeout)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

fn close_session<T: Transport>(sync: SyncSession<'_, T>) {
    if let Err(e) = sync.close() {
        tracing::warn!(error = %e, "Failed to close sync stream");
    }
}

/// Walks `local`, pairing every file with its device path and recording the
/// device directories to create, parents first.
fn collect_tree(
    local: &Path,
    remote: &str,
    dirs: &mut Vec<String>,
    files: &mut Vec<(PathBuf, String)>,
) -> io::Result<()> {
    if !local.is_dir() {
        files.push((local.to_path_buf(), remote.to_string()));
        return Ok(());
    }

    dirs.push(remote.to_string());
    let mut entries = fs::read_dir(local)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name() else { continue };
        let child = format!("{}/{}", remote, name.to_string_lossy());
        collect_tree(&path, &child, dirs, files)?;
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

fn file_mtime(metadata: &fs::Metadata) -> u32 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or_else(unix_now)
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Double-quotes a shell argument.
fn quote(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Removes the shell's echo of `command` and the trailing `delimiter`.
fn strip_interactive(output: &str, command: Option<&str>, delimiter: Option<&str>) -> String {
    let mut text = output;

    if let Some(command) = command {
        if let Some(rest) = text.strip_prefix(command) {
            text = rest.trim_start_matches(['\r', '\n']);
        }
    }

    if let Some(delim) = delimiter {
        if let Some(pos) = text.rfind(delim) {
            text = &text[..pos];
        }
    }

    text.to_string()
}

//! The binary file transfer protocol spoken after `sync:` is acknowledged.
//!
//! Every message is a four byte ASCII opcode, a little-endian `u32`, and for
//! most opcodes a payload of that many bytes. `DONE` on a push is the
//! exception: its integer is the file's mtime and no payload follows.
//!
//! A connection carries one logical file operation (`stat`, `push` or
//! `pull`, each possibly preceded by the `STAT` it needs) and then `QUIT`.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use super::config::AdbConfig;
use super::error::{AdbError, AdbResult};
use super::session::Session;

/// Largest DATA payload the daemon accepts.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

#[cfg(not(unix))]
const DEFAULT_PUSH_MODE: u32 = S_IFREG | 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOpcode {
    Stat,
    Send,
    Data,
    Done,
    Recv,
    Quit,
    Fail,
    Okay,
}

impl SyncOpcode {
    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            SyncOpcode::Stat => b"STAT",
            SyncOpcode::Send => b"SEND",
            SyncOpcode::Data => b"DATA",
            SyncOpcode::Done => b"DONE",
            SyncOpcode::Recv => b"RECV",
            SyncOpcode::Quit => b"QUIT",
            SyncOpcode::Fail => b"FAIL",
            SyncOpcode::Okay => b"OKAY",
        }
    }

    pub fn from_bytes(raw: &[u8; 4]) -> Option<Self> {
        Some(match raw {
            b"STAT" => SyncOpcode::Stat,
            b"SEND" => SyncOpcode::Send,
            b"DATA" => SyncOpcode::Data,
            b"DONE" => SyncOpcode::Done,
            b"RECV" => SyncOpcode::Recv,
            b"QUIT" => SyncOpcode::Quit,
            b"FAIL" => SyncOpcode::Fail,
            b"OKAY" => SyncOpcode::Okay,
            _ => return None,
        })
    }
}

impl fmt::Display for SyncOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A client-to-daemon sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest<'a> {
    Stat { path: &'a str },
    Send { path: &'a str, mode: u32 },
    Data(&'a [u8]),
    Done { mtime: u32 },
    Recv { path: &'a str },
    Quit,
}

impl SyncRequest<'_> {
    pub fn opcode(&self) -> SyncOpcode {
        match self {
            SyncRequest::Stat { .. } => SyncOpcode::Stat,
            SyncRequest::Send { .. } => SyncOpcode::Send,
            SyncRequest::Data(_) => SyncOpcode::Data,
            SyncRequest::Done { .. } => SyncOpcode::Done,
            SyncRequest::Recv { .. } => SyncOpcode::Recv,
            SyncRequest::Quit => SyncOpcode::Quit,
        }
    }

    pub fn encode(&self) -> AdbResult<Vec<u8>> {
        let payload: Vec<u8> = match self {
            SyncRequest::Stat { path } | SyncRequest::Recv { path } => path.as_bytes().to_vec(),
            SyncRequest::Send { path, mode } => format!("{path},{mode}").into_bytes(),
            SyncRequest::Data(data) => {
                if data.len() > SYNC_DATA_MAX {
                    return Err(AdbError::protocol(
                        "encoding DATA",
                        format!("{} bytes exceeds {SYNC_DATA_MAX}", data.len()),
                    ));
                }
                data.to_vec()
            }
            SyncRequest::Done { mtime } => return Ok(header(SyncOpcode::Done, *mtime).to_vec()),
            SyncRequest::Quit => Vec::new(),
        };
        let len = u32::try_from(payload.len()).map_err(|_| {
            AdbError::protocol(
                format!("encoding {}", self.opcode()),
                "payload longer than u32::MAX",
            )
        })?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&header(self.opcode(), len));
        frame.extend_from_slice(&payload);
        Ok(frame)
    }
}

fn header(opcode: SyncOpcode, value: u32) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(opcode.as_bytes());
    raw[4..].copy_from_slice(&value.to_le_bytes());
    raw
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHeader {
    pub opcode: SyncOpcode,
    pub length: u32,
}

/// Result of a sync `STAT`. A zero `mode` means the path does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatResult {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl StatResult {
    pub fn exists(&self) -> bool {
        self.mode != 0
    }

    pub fn is_regular_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(u64::from(self.mtime))
    }
}

/// Check that `local` can be pushed: it must be a regular file.
/// Runs before any connection is opened.
pub fn check_push_source(local: &Path) -> AdbResult<fs::Metadata> {
    let meta = fs::metadata(local).map_err(|e| AdbError::local_io(local, e))?;
    if !meta.is_file() {
        return Err(AdbError::target(local, "push source is not a regular file"));
    }
    Ok(meta)
}

/// Check that `local` can receive a pull: it must not be an existing directory.
pub fn check_pull_destination(local: &Path) -> AdbResult<()> {
    match fs::metadata(local) {
        Ok(meta) if meta.is_dir() => Err(AdbError::target(
            local,
            "pull destination is an existing directory",
        )),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn push_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn push_mode(_meta: &fs::Metadata) -> u32 {
    DEFAULT_PUSH_MODE
}

fn unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

// `dir/name` -> `dir/name.adb-pull.tmp`
fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(".adb-pull.tmp");
    PathBuf::from(name)
}

// Fill `buf` from `reader`, short only at end of file.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub struct SyncClient<S = TcpStream> {
    session: Session<S>,
    chunk_size: usize,
}

impl SyncClient<TcpStream> {
    /// Open a device-scoped connection and switch it to sync mode.
    pub fn connect(config: &AdbConfig, serial: &str) -> AdbResult<Self> {
        let session = Session::connect_device(config, serial)?;
        Self::start(session, config.sync_chunk_size)
    }
}

impl<S: Read + Write> SyncClient<S> {
    /// Send `sync:` on an already transport-scoped session.
    pub fn start(mut session: Session<S>, chunk_size: usize) -> AdbResult<Self> {
        session.send_command("sync:")?;
        Ok(Self {
            session,
            chunk_size: chunk_size.clamp(1, SYNC_DATA_MAX),
        })
    }

    pub fn into_session(self) -> Session<S> {
        self.session
    }

    fn send_request(&mut self, request: &SyncRequest<'_>) -> AdbResult<()> {
        let frame = request.encode()?;
        match request {
            SyncRequest::Stat { path } | SyncRequest::Recv { path } | SyncRequest::Send { path, .. } => {
                self.session
                    .set_in_flight(format!("{} {path}", request.opcode()));
            }
            SyncRequest::Quit => self.session.set_in_flight("QUIT"),
            SyncRequest::Data(_) | SyncRequest::Done { .. } => {}
        }
        log::trace!("-> sync {} ({} bytes)", request.opcode(), frame.len());
        self.session.send_raw(&frame)
    }

    fn read_header(&mut self) -> AdbResult<SyncHeader> {
        let raw = self.session.read_raw::<8>("reading sync header")?;
        let mut id = [0u8; 4];
        id.copy_from_slice(&raw[..4]);
        let opcode = SyncOpcode::from_bytes(&id).ok_or_else(|| {
            self.session.protocol_error(
                "reading sync header",
                format!("unknown sync opcode {:?}", String::from_utf8_lossy(&id)),
            )
        })?;
        let length = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Ok(SyncHeader { opcode, length })
    }

    fn read_failure(&mut self, length: u32) -> AdbError {
        let len = length as usize;
        if len > SYNC_DATA_MAX {
            return self.session.protocol_error(
                "reading sync FAIL message",
                format!("{len} byte message exceeds {SYNC_DATA_MAX}"),
            );
        }
        match self.session.read_exact_vec(len, "reading sync FAIL message") {
            Ok(message) => AdbError::RemoteFailure {
                context: self.session.in_flight().to_string(),
                message: String::from_utf8_lossy(&message).into_owned(),
            },
            Err(e) => e,
        }
    }

    // The daemon answers a refused push with FAIL and hangs up, so the next
    // write breaks. Prefer its message over the broken pipe when one is queued.
    fn send_transfer_frame(&mut self, request: &SyncRequest<'_>) -> AdbResult<()> {
        match self.send_request(request) {
            Err(err @ AdbError::ConnectionLost { .. }) => match self.read_header() {
                Ok(SyncHeader {
                    opcode: SyncOpcode::Fail,
                    length,
                }) => Err(self.read_failure(length)),
                _ => Err(err),
            },
            other => other,
        }
    }

    fn unexpected(&self, what: &str, expected: &str, got: SyncOpcode) -> AdbError {
        self.session
            .protocol_error(what, format!("expected {expected}, got {got}"))
    }

    /// `STAT` a remote path. A missing path yields `mode == 0`, not an error.
    pub fn stat(&mut self, path: &str) -> AdbResult<StatResult> {
        self.send_request(&SyncRequest::Stat { path })?;
        let raw = self.session.read_raw::<4>("reading STAT reply")?;
        match SyncOpcode::from_bytes(&raw) {
            Some(SyncOpcode::Stat) => {
                let mode = self.session.read_u32_le("reading STAT mode")?;
                let size = self.session.read_u32_le("reading STAT size")?;
                let mtime = self.session.read_u32_le("reading STAT mtime")?;
                Ok(StatResult { mode, size, mtime })
            }
            Some(SyncOpcode::Fail) => {
                let length = self.session.read_u32_le("reading FAIL length")?;
                Err(self.read_failure(length))
            }
            _ => Err(self.session.protocol_error(
                "reading STAT reply",
                format!("expected STAT, got {:?}", String::from_utf8_lossy(&raw)),
            )),
        }
    }

    /// Upload `local` to `remote`. Returns the number of bytes sent.
    pub fn push(&mut self, local: &Path, remote: &str) -> AdbResult<u64> {
        let meta = check_push_source(local)?;
        let mut file = File::open(local).map_err(|e| AdbError::local_io(local, e))?;

        let target = self.stat(remote)?;
        if target.exists() && !target.is_regular_file() {
            return Err(AdbError::target(
                remote,
                format!("remote target exists and is not a regular file (mode {:o})", target.mode),
            ));
        }

        self.send_request(&SyncRequest::Send {
            path: remote,
            mode: push_mode(&meta),
        })?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            let n = read_chunk(&mut file, &mut buf).map_err(|e| AdbError::local_io(local, e))?;
            if n == 0 {
                break;
            }
            self.send_transfer_frame(&SyncRequest::Data(&buf[..n]))?;
            sent += n as u64;
        }

        let mtime = meta.modified().map(unix_seconds).unwrap_or(0);
        self.send_transfer_frame(&SyncRequest::Done { mtime })?;

        let reply = self.read_header()?;
        match reply.opcode {
            SyncOpcode::Okay => {
                log::debug!("Pushed {sent} bytes to {remote}");
                Ok(sent)
            }
            SyncOpcode::Fail => Err(self.read_failure(reply.length)),
            other => Err(self.unexpected("reading push result", "OKAY or FAIL", other)),
        }
    }

    /// Download `remote` into `local`. Returns the number of bytes received.
    ///
    /// `RECV`'s closing `DONE` carries no mtime, so `preserve_mtime` applies
    /// the mtime from the `STAT` issued before the transfer.
    pub fn pull(&mut self, remote: &str, local: &Path, preserve_mtime: bool) -> AdbResult<u64> {
        check_pull_destination(local)?;

        let source = self.stat(remote)?;
        if !source.exists() {
            return Err(AdbError::target(remote, "remote file does not exist"));
        }
        if !source.is_regular_file() {
            return Err(AdbError::target(
                remote,
                format!("remote source is not a regular file (mode {:o})", source.mode),
            ));
        }

        // Received bytes go to a sibling file that replaces `local` only
        // after DONE, so a failed pull leaves any existing file untouched.
        let partial = partial_path(local);
        let result = self.receive_into(remote, &partial, source, preserve_mtime);
        let received = match result {
            Ok(received) => received,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };
        fs::rename(&partial, local).map_err(|e| {
            let _ = fs::remove_file(&partial);
            AdbError::local_io(local, e)
        })?;
        log::debug!("Pulled {received} bytes from {remote}");
        Ok(received)
    }

    fn receive_into(
        &mut self,
        remote: &str,
        partial: &Path,
        source: StatResult,
        preserve_mtime: bool,
    ) -> AdbResult<u64> {
        let mut file = File::create(partial).map_err(|e| AdbError::local_io(partial, e))?;
        self.send_request(&SyncRequest::Recv { path: remote })?;

        let mut received: u64 = 0;
        loop {
            let frame = self.read_header()?;
            match frame.opcode {
                SyncOpcode::Data => {
                    let len = frame.length as usize;
                    if len > SYNC_DATA_MAX {
                        return Err(self.session.protocol_error(
                            "reading DATA",
                            format!("{len} byte chunk exceeds {SYNC_DATA_MAX}"),
                        ));
                    }
                    let chunk = self.session.read_exact_vec(len, "reading DATA payload")?;
                    file.write_all(&chunk)
                        .map_err(|e| AdbError::local_io(partial, e))?;
                    received += len as u64;
                }
                SyncOpcode::Done => break,
                SyncOpcode::Fail => return Err(self.read_failure(frame.length)),
                other => return Err(self.unexpected("reading pull stream", "DATA or DONE", other)),
            }
        }
        file.flush().map_err(|e| AdbError::local_io(partial, e))?;

        if preserve_mtime {
            file.set_modified(source.modified())
                .map_err(|e| AdbError::local_io(partial, e))?;
        }
        Ok(received)
    }

    /// End the sync session. The connection closes when `self` drops.
    pub fn quit(mut self) -> AdbResult<()> {
        self.send_request(&SyncRequest::Quit)
    }
}

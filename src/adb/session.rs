//! One connection to the adb daemon and the framing primitives spoken on it.
//!
//! Host commands are ASCII strings prefixed with their length as exactly four
//! lowercase hex digits (`000chost:devices`). The daemon answers with a
//! four byte `OKAY`, or `FAIL` followed by a message framed the same way.
//! Sync-mode traffic on the same socket uses little-endian binary integers
//! instead; see [`super::sync`].
//!
//! A [`Session`] is owned by exactly one operation and is closed when it is
//! dropped, on every exit path.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::config::AdbConfig;
use super::error::{AdbError, AdbResult};

/// Longest command that fits a four hex digit length prefix.
pub const MAX_COMMAND_LEN: usize = 0xffff;

/// Build a host command frame: `%04x` length followed by the command bytes.
pub fn encode_command(cmd: &str) -> AdbResult<Vec<u8>> {
    let len = cmd.len();
    if len > MAX_COMMAND_LEN {
        return Err(AdbError::CommandTooLong { len });
    }
    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(format!("{len:04x}").as_bytes());
    frame.extend_from_slice(cmd.as_bytes());
    Ok(frame)
}

fn parse_hex_len(raw: &[u8; 4]) -> Option<usize> {
    if !raw.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    usize::from_str_radix(text, 16).ok()
}

pub struct Session<S = TcpStream> {
    stream: S,
    // command or opcode currently being exchanged, for error context
    in_flight: String,
    cancelled: Arc<AtomicBool>,
    // deregisters the socket from its CancelToken on drop
    registration: Option<Registration>,
}

impl Session<TcpStream> {
    /// Open a fresh connection to the daemon described by `config`.
    ///
    /// Refusal or timeout is reported as [`AdbError::DaemonUnavailable`],
    /// separate from anything that can go wrong once bytes start flowing.
    pub fn connect(config: &AdbConfig) -> AdbResult<Self> {
        let addr = config.socket_addr();
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|source| AdbError::DaemonUnavailable { addr, source })?;
        let configure = || -> io::Result<()> {
            stream.set_read_timeout(config.read_timeout)?;
            stream.set_write_timeout(config.write_timeout)?;
            stream.set_nodelay(true)
        };
        configure().map_err(|source| AdbError::ConnectionLost {
            context: "configuring socket".to_string(),
            source,
        })?;
        log::debug!("Connected to adb daemon at {addr}");
        Ok(Session::new(stream))
    }

    /// Connect and bind the connection to one device with
    /// `host:transport:<serial>`. Every later frame goes to that device.
    pub fn connect_device(config: &AdbConfig, serial: &str) -> AdbResult<Self> {
        let mut session = Self::connect(config)?;
        session.transport(serial)?;
        Ok(session)
    }

    /// A handle that can abort this session's blocked reads and writes from
    /// another thread.
    pub fn cancel_handle(&self) -> AdbResult<CancelHandle> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|source| AdbError::ConnectionLost {
                context: "cloning socket for cancellation".to_string(),
                source,
            })?;
        Ok(CancelHandle {
            stream,
            cancelled: Arc::clone(&self.cancelled),
        })
    }

    /// Tie this session to `token`: cancelling the token shuts the socket
    /// down. Fails with [`AdbError::Cancelled`] if the token already fired.
    pub fn attach(&mut self, token: &CancelToken) -> AdbResult<()> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|source| AdbError::ConnectionLost {
                context: "cloning socket for cancellation".to_string(),
                source,
            })?;
        let id = token.register(stream).ok_or_else(|| AdbError::Cancelled {
            context: "connecting".to_string(),
        })?;
        self.cancelled = Arc::clone(&token.inner.cancelled);
        self.registration = Some(Registration {
            token: Arc::clone(&token.inner),
            id,
        });
        Ok(())
    }
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            in_flight: String::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            registration: None,
        }
    }

    pub fn into_inner(mut self) -> S {
        self.registration = None;
        self.stream
    }

    pub(crate) fn set_in_flight(&mut self, what: impl Into<String>) {
        self.in_flight = what.into();
    }

    pub fn in_flight(&self) -> &str {
        &self.in_flight
    }

    fn context(&self, what: &str) -> String {
        if self.in_flight.is_empty() {
            what.to_string()
        } else {
            format!("{what} for '{}'", self.in_flight)
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn io_error(&self, source: io::Error, what: &str) -> AdbError {
        let context = self.context(what);
        if self.is_cancelled() {
            AdbError::Cancelled { context }
        } else if source.kind() == io::ErrorKind::UnexpectedEof {
            AdbError::Protocol {
                context,
                description: "short read: peer closed the connection".to_string(),
            }
        } else {
            AdbError::ConnectionLost { context, source }
        }
    }

    pub(crate) fn protocol_error(&self, what: &str, description: impl Into<String>) -> AdbError {
        AdbError::protocol(self.context(what), description)
    }

    /// Bind this connection to `serial`. Must precede any device-scoped frame.
    pub fn transport(&mut self, serial: &str) -> AdbResult<()> {
        self.send_command(&format!("host:transport:{serial}"))
    }

    /// Write one host command frame and read its acknowledgement.
    pub fn send_command(&mut self, cmd: &str) -> AdbResult<()> {
        self.write_command(cmd)?;
        self.read_ack()
    }

    /// Write one host command frame without waiting for the acknowledgement.
    pub fn write_command(&mut self, cmd: &str) -> AdbResult<()> {
        let frame = encode_command(cmd)?;
        self.set_in_flight(cmd);
        log::trace!("-> {}", String::from_utf8_lossy(&frame));
        self.send_raw(&frame)
    }

    /// Read an `OKAY`/`FAIL` acknowledgement.
    pub fn read_ack(&mut self) -> AdbResult<()> {
        match self.try_read_marker("reading acknowledgement")? {
            Some(marker) => self.check_ack(&marker),
            None => Err(self.protocol_error(
                "reading acknowledgement",
                "connection closed before acknowledgement",
            )),
        }
    }

    /// Read four bytes, or `None` if the peer closed the connection cleanly
    /// before sending any of them.
    pub fn try_read_marker(&mut self, what: &str) -> AdbResult<Option<[u8; 4]>> {
        let mut marker = [0u8; 4];
        let mut filled = 0;
        while filled < marker.len() {
            match self.stream.read(&mut marker[filled..]) {
                Ok(0) if self.is_cancelled() => {
                    return Err(AdbError::Cancelled {
                        context: self.context(what),
                    });
                }
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(self.protocol_error(
                        what,
                        format!("short read: got {filled} of 4 bytes"),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e, what)),
            }
        }
        Ok(Some(marker))
    }

    pub(crate) fn check_ack(&mut self, marker: &[u8; 4]) -> AdbResult<()> {
        match marker {
            b"OKAY" => Ok(()),
            b"FAIL" => {
                let message = self.read_framed_message()?;
                log::debug!("adb daemon FAIL for '{}': {message}", self.in_flight);
                Err(AdbError::RemoteFailure {
                    context: self.in_flight.clone(),
                    message,
                })
            }
            other => Err(self.protocol_error(
                "reading acknowledgement",
                format!(
                    "expected OKAY or FAIL, got {:?}",
                    String::from_utf8_lossy(other)
                ),
            )),
        }
    }

    /// Read a four hex digit length and then exactly that many bytes.
    pub fn read_framed_message(&mut self) -> AdbResult<String> {
        let raw = self.read_raw::<4>("reading message length")?;
        let len = parse_hex_len(&raw).ok_or_else(|| {
            self.protocol_error(
                "reading message length",
                format!("invalid hex length {:?}", String::from_utf8_lossy(&raw)),
            )
        })?;
        let body = self.read_exact_vec(len, "reading message body")?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Read until the peer closes the connection.
    pub fn read_all(&mut self) -> AdbResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e, "reading until close")),
            }
        }
        if self.is_cancelled() {
            return Err(AdbError::Cancelled {
                context: self.context("reading until close"),
            });
        }
        Ok(out)
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> AdbResult<()> {
        self.stream
            .write_all(bytes)
            .and_then(|_| self.stream.flush())
            .map_err(|e| self.io_error(e, "writing"))
    }

    pub fn read_raw<const N: usize>(&mut self, what: &str) -> AdbResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| self.io_error(e, what))?;
        Ok(buf)
    }

    pub fn read_exact_vec(&mut self, len: usize, what: &str) -> AdbResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| self.io_error(e, what))?;
        Ok(buf)
    }

    pub fn read_u32_le(&mut self, what: &str) -> AdbResult<u32> {
        Ok(u32::from_le_bytes(self.read_raw::<4>(what)?))
    }
}

/// Aborts a [`Session`] from another thread by shutting its socket down.
/// The blocked call returns [`AdbError::Cancelled`].
#[derive(Debug)]
pub struct CancelHandle {
    stream: TcpStream,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            log::debug!("Socket shutdown on cancel failed: {e}");
        }
    }
}

/// Cancels every operation started under it, from any thread.
///
/// Hand a clone to a [`super::Device`] (or [`super::AdbBackend`]); each
/// connection that device opens is registered here while it is alive.
/// Once cancelled, the token stays cancelled: blocked calls return
/// [`AdbError::Cancelled`] and later calls fail the same way.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Arc<AtomicBool>,
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, TcpStream>>,
}

impl TokenInner {
    fn sockets(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        // flag first, under the lock, so a concurrent register sees it
        let mut sockets = self.inner.sockets();
        self.inner.cancelled.store(true, Ordering::SeqCst);
        for (_, stream) in sockets.drain() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("Socket shutdown on cancel failed: {e}");
            }
        }
    }

    // None when already cancelled; the socket is shut down right away.
    fn register(&self, stream: TcpStream) -> Option<u64> {
        let mut sockets = self.inner.sockets();
        if self.is_cancelled() {
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        sockets.insert(id, stream);
        Some(id)
    }
}

struct Registration {
    token: Arc<TokenInner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.sockets().remove(&self.id);
    }
}

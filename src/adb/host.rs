//! One-shot host commands against the adb daemon.
//!
//! Each method opens its own [`Session`], uses it for exactly one command and
//! drops it. The daemon expects one connection per command; a transport-scoped
//! connection cannot be reused for a second command.

use std::io;
use std::net::TcpStream;

use super::config::AdbConfig;
use super::error::{AdbError, AdbResult};
use super::session::{CancelToken, Session};
use super::sync::SyncClient;
use super::types::{DeviceInfo, DeviceState, ForwardEntry, PortForward};

const ROOT_OK_REPLIES: [&str; 2] = ["restarting adbd as root", "already running as root"];
const REMOUNT_OK_TOKEN: &str = "remount succeeded";

/// Parse the `host:devices` body: one `serial<TAB>state` record per line.
/// The state is everything after the tab, so multi-word states such as
/// `no permissions (...)` survive intact.
pub fn parse_devices(body: &str) -> Vec<DeviceInfo> {
    body.lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            let serial = serial.trim();
            if serial.is_empty() {
                return None;
            }
            Some(DeviceInfo {
                serial: serial.to_string(),
                state: DeviceState::parse(state),
            })
        })
        .collect()
}

/// Parse the `list-forward` body: `serial local remote` per line.
pub fn parse_forwards(body: &str) -> Vec<ForwardEntry> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some(ForwardEntry {
                serial: parts.next()?.to_string(),
                local: parts.next()?.to_string(),
                remote: parts.next()?.to_string(),
            })
        })
        .collect()
}

/// Shell output as text with `\r\n` folded to `\n`.
pub fn normalize_line_endings(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace("\r\n", "\n")
}

// A device going down for reboot may reset the socket instead of closing it.
fn closed_by_peer(err: &AdbError) -> bool {
    matches!(
        err,
        AdbError::ConnectionLost { source, .. } if matches!(
            source.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
        )
    )
}

/// Client for the daemon's host services.
#[derive(Debug, Clone, Default)]
pub struct AdbServer {
    config: AdbConfig,
    cancel: Option<CancelToken>,
}

impl AdbServer {
    pub fn new(config: AdbConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Register every connection this client opens with `token`, so that
    /// cancelling it aborts whatever call is blocked.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    fn connect(&self) -> AdbResult<Session<TcpStream>> {
        let mut session = Session::connect(&self.config)?;
        if let Some(token) = &self.cancel {
            session.attach(token)?;
        }
        Ok(session)
    }

    fn connect_device(&self, serial: &str) -> AdbResult<Session<TcpStream>> {
        let mut session = self.connect()?;
        session.transport(serial)?;
        Ok(session)
    }

    // OKAY followed by one framed reply
    fn host_query(&self, command: &str) -> AdbResult<String> {
        let mut session = self.connect()?;
        session.send_command(command)?;
        session.read_framed_message()
    }

    // forward/killforward answer twice: request accepted, then the result
    fn host_command_double_ack(&self, command: &str) -> AdbResult<Session<TcpStream>> {
        let mut session = self.connect()?;
        session.send_command(command)?;
        session.read_ack()?;
        Ok(session)
    }

    // Run a device service and collect everything it prints until close.
    fn device_service(&self, serial: &str, service: &str) -> AdbResult<String> {
        let mut session = self.connect_device(serial)?;
        session.send_command(service)?;
        let output = session.read_all()?;
        Ok(normalize_line_endings(&output))
    }

    /// Daemon protocol version (`host:version`).
    pub fn version(&self) -> AdbResult<u32> {
        let reply = self.host_query("host:version")?;
        u32::from_str_radix(reply.trim(), 16).map_err(|_| {
            AdbError::protocol(
                "reading reply for 'host:version'",
                format!("version {reply:?} is not hex"),
            )
        })
    }

    pub fn list_devices(&self) -> AdbResult<Vec<DeviceInfo>> {
        let body = self.host_query("host:devices")?;
        let devices = parse_devices(&body);
        log::debug!("adb daemon lists {} device(s)", devices.len());
        Ok(devices)
    }

    /// A device the daemon does not know comes back as the daemon's FAIL
    /// (`device '<serial>' not found`).
    pub fn get_state(&self, serial: &str) -> AdbResult<DeviceState> {
        let reply = self.host_query(&format!("host-serial:{serial}:get-state"))?;
        Ok(DeviceState::parse(&reply))
    }

    /// Run `command` in the device shell and return its combined output.
    pub fn shell(&self, serial: &str, command: &str) -> AdbResult<String> {
        log::debug!("[{serial}] shell: {command}");
        self.device_service(serial, &format!("shell:{command}"))
    }

    pub fn restart_shell_as_root(&self, serial: &str) -> AdbResult<()> {
        let output = self.device_service(serial, "root:")?;
        if ROOT_OK_REPLIES.iter().any(|ok| output.contains(ok)) {
            log::debug!("[{serial}] root: {}", output.trim());
            Ok(())
        } else {
            Err(AdbError::RootRefused {
                output: output.trim().to_string(),
            })
        }
    }

    /// Fails with [`AdbError::RemountFailed`] unless the daemon reports
    /// success; production builds refuse this.
    pub fn remount_system_partition(&self, serial: &str) -> AdbResult<()> {
        let output = self.device_service(serial, "remount:")?;
        if output.contains(REMOUNT_OK_TOKEN) {
            Ok(())
        } else {
            log::warn!("[{serial}] remount refused: {}", output.trim());
            Err(AdbError::RemountFailed {
                output: output.trim().to_string(),
            })
        }
    }

    /// Reboot the device, optionally into `target` (`bootloader`, `recovery`, ...).
    ///
    /// The device drops the connection as it goes down, usually before any
    /// acknowledgement, so a close is the success path here. An explicit
    /// `FAIL` is still an error.
    pub fn reboot(&self, serial: &str, target: Option<&str>) -> AdbResult<()> {
        let mut session = self.connect_device(serial)?;
        session.write_command(&format!("reboot:{}", target.unwrap_or("")))?;
        match session.try_read_marker("reading reboot reply") {
            Ok(None) => {}
            Ok(Some(marker)) => {
                session.check_ack(&marker)?;
                match session.read_all() {
                    Ok(_) => {}
                    Err(e) if closed_by_peer(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            Err(e) if closed_by_peer(&e) => {}
            Err(e) => return Err(e),
        }
        log::debug!("[{serial}] reboot requested");
        Ok(())
    }

    /// Forward host `tcp:<local>` to device `tcp:<remote>`. A `local` of 0
    /// lets the daemon pick a free port, which is returned in the handle.
    pub fn forward_tcp_port(&self, serial: &str, local: u16, remote: u16) -> AdbResult<PortForward> {
        let command = format!("host-serial:{serial}:forward:tcp:{local};tcp:{remote}");
        let mut session = self.host_command_double_ack(&command)?;
        let local = if local == 0 {
            let reply = session.read_framed_message()?;
            reply.trim().parse::<u16>().map_err(|_| {
                session.protocol_error("reading allocated port", format!("{reply:?} is not a port"))
            })?
        } else {
            local
        };
        log::debug!("[{serial}] forwarding tcp:{local} -> tcp:{remote}");
        Ok(PortForward {
            serial: serial.to_string(),
            local,
            remote,
        })
    }

    pub fn kill_forward(&self, serial: &str, local: u16) -> AdbResult<()> {
        self.host_command_double_ack(&format!("host-serial:{serial}:killforward:tcp:{local}"))
            .map(drop)
    }

    pub fn remove_forward(&self, forward: PortForward) -> AdbResult<()> {
        self.kill_forward(&forward.serial, forward.local)
    }

    pub fn disable_all_forwards(&self, serial: &str) -> AdbResult<()> {
        self.host_command_double_ack(&format!("host-serial:{serial}:killforward-all"))
            .map(drop)
    }

    pub fn list_forwards(&self, serial: &str) -> AdbResult<Vec<ForwardEntry>> {
        let body = self.host_query(&format!("host-serial:{serial}:list-forward"))?;
        Ok(parse_forwards(&body))
    }

    /// Open a sync-mode connection to `serial`.
    pub fn sync(&self, serial: &str) -> AdbResult<SyncClient<TcpStream>> {
        let session = self.connect_device(serial)?;
        SyncClient::start(session, self.config.sync_chunk_size)
    }
}

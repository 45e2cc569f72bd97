// Per-serial facade over host commands and sync transfers.
// Every call opens and closes its own connection.
use std::collections::HashMap;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::config::AdbConfig;
use super::error::{AdbError, AdbResult, ErrorKind};
use super::host::AdbServer;
use super::session::CancelToken;
use super::sync::{StatResult, SyncClient, check_pull_destination, check_push_source};
use super::types::{DeviceState, ForwardEntry, PortForward};

#[derive(Debug)]
pub struct Device {
    serial: String,
    server: AdbServer,
    prop_cache: Mutex<HashMap<String, String>>,
}

impl Device {
    pub fn new(config: AdbConfig, serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            server: AdbServer::new(config),
            prop_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Abort this device's blocked calls (a `shell` that never ends, a long
    /// push or pull) by cancelling `token` from another thread.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.server = self.server.with_cancel_token(token);
        self
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.server.cancel_token()
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn server(&self) -> &AdbServer {
        &self.server
    }

    pub fn state(&self) -> AdbResult<DeviceState> {
        self.server.get_state(&self.serial)
    }

    pub fn shell(&self, command: &str) -> AdbResult<String> {
        self.server.shell(&self.serial, command)
    }

    pub fn get_prop(&self, name: &str) -> AdbResult<String> {
        Ok(self.shell(&format!("getprop {name}"))?.trim().to_string())
    }

    /// Like [`Device::get_prop`] but remembers the answer for the lifetime of
    /// this `Device`. Only use it for properties that cannot change at runtime.
    pub fn get_prop_cached(&self, name: &str) -> AdbResult<String> {
        if let Some(value) = self.cache().get(name) {
            return Ok(value.clone());
        }
        let value = self.get_prop(name)?;
        self.cache().insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn clear_prop_cache(&self) {
        self.cache().clear();
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // the map is never left half-updated, so a poisoned lock is still usable
        self.prop_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_sync(&self, sync: SyncClient<TcpStream>) {
        if let Err(e) = sync.quit() {
            log::debug!("[{}] QUIT after completed transfer failed: {e}", self.serial);
        }
    }

    pub fn stat(&self, path: &str) -> AdbResult<StatResult> {
        let mut sync = self.server.sync(&self.serial)?;
        let stat = sync.stat(path)?;
        self.finish_sync(sync);
        Ok(stat)
    }

    pub fn file_exists(&self, path: &str) -> AdbResult<bool> {
        Ok(self.stat(path)?.exists())
    }

    /// Upload a regular file. A source that is not a regular file is rejected
    /// before any connection is made.
    pub fn push(&self, local: &Path, remote: &str) -> AdbResult<u64> {
        check_push_source(local)?;
        let mut sync = self.server.sync(&self.serial)?;
        let sent = sync.push(local, remote)?;
        self.finish_sync(sync);
        Ok(sent)
    }

    pub fn pull(&self, remote: &str, local: &Path, preserve_mtime: bool) -> AdbResult<u64> {
        check_pull_destination(local)?;
        let mut sync = self.server.sync(&self.serial)?;
        let received = sync.pull(remote, local, preserve_mtime)?;
        self.finish_sync(sync);
        Ok(received)
    }

    pub fn forward_tcp_port(&self, local: u16, remote: u16) -> AdbResult<PortForward> {
        self.server.forward_tcp_port(&self.serial, local, remote)
    }

    pub fn remove_forward(&self, forward: PortForward) -> AdbResult<()> {
        self.server.remove_forward(forward)
    }

    pub fn disable_all_forwards(&self) -> AdbResult<()> {
        self.server.disable_all_forwards(&self.serial)
    }

    pub fn list_forwards(&self) -> AdbResult<Vec<ForwardEntry>> {
        self.server.list_forwards(&self.serial)
    }

    pub fn restart_shell_as_root(&self) -> AdbResult<()> {
        self.server.restart_shell_as_root(&self.serial)
    }

    pub fn remount_system_partition(&self) -> AdbResult<()> {
        self.server.remount_system_partition(&self.serial)
    }

    pub fn reboot(&self) -> AdbResult<()> {
        self.server.reboot(&self.serial, None)
    }

    pub fn reboot_into(&self, target: &str) -> AdbResult<()> {
        self.server.reboot(&self.serial, Some(target))
    }

    /// Poll `get-state` until the device reports `device`.
    ///
    /// A daemon FAIL (device not yet known) counts as "not ready"; anything
    /// else that goes wrong is returned immediately.
    pub fn wait_for_device(&self, timeout: Duration) -> AdbResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state() {
                Ok(DeviceState::Device) => return Ok(()),
                Ok(state) => log::debug!("[{}] state is {state}, waiting", self.serial),
                Err(e) if e.kind() == ErrorKind::RemoteFailure => {
                    log::debug!("[{}] not visible yet: {e}", self.serial)
                }
                Err(e) => return Err(e),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AdbError::Timeout {
                    duration: timeout,
                    description: format!("waiting for device {}", self.serial),
                });
            }
            std::thread::sleep(self.server.config().poll_interval.min(deadline - now));
        }
    }
}

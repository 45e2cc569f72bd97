// Async wrapper: each blocking protocol operation runs on tokio's blocking
// pool with its own connection, so concurrent calls never share a socket.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::config::AdbConfig;
use super::device::Device;
use super::error::{AdbError, AdbResult};
use super::host::AdbServer;
use super::session::CancelToken;
use super::sync::StatResult;
use super::types::{DeviceInfo, DeviceState, ForwardEntry, PortForward};

#[derive(Debug, Clone)]
pub struct AdbBackend {
    device: Arc<Device>,
}

impl AdbBackend {
    pub async fn list_devices(config: AdbConfig) -> AdbResult<Vec<DeviceInfo>> {
        tokio::task::spawn_blocking(move || AdbServer::new(config).list_devices()).await?
    }

    pub async fn server_version(config: AdbConfig) -> AdbResult<u32> {
        tokio::task::spawn_blocking(move || AdbServer::new(config).version()).await?
    }

    /// Attach to the first device in `device` state.
    pub async fn connect_first(config: AdbConfig) -> AdbResult<Self> {
        let devices = Self::list_devices(config.clone()).await?;
        let first = devices
            .into_iter()
            .find(|d| d.state.is_online())
            .ok_or(AdbError::NoDevices)?;
        Self::new_with_device(config, &first.serial).await
    }

    /// Handle for `serial` without asking the daemon whether it exists.
    pub fn new(config: AdbConfig, serial: &str) -> Self {
        Self {
            device: Arc::new(Device::new(config, serial)),
        }
    }

    /// Like [`AdbBackend::new`], with every call registered on `token`.
    /// Cancelling it makes in-flight and later calls return `Cancelled`.
    pub fn new_with_cancel(config: AdbConfig, serial: &str, token: CancelToken) -> Self {
        Self {
            device: Arc::new(Device::new(config, serial).with_cancel_token(token)),
        }
    }

    /// Attach to `serial`; fails with the daemon's message if it is unknown.
    pub async fn new_with_device(config: AdbConfig, serial: &str) -> AdbResult<Self> {
        let backend = Self::new(config, serial);
        let state = backend.state().await?;
        log::debug!("[{serial}] attached, state {state}");
        Ok(backend)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        self.device.serial()
    }

    async fn run<T, F>(&self, op: F) -> AdbResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Device) -> AdbResult<T> + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || op(&device)).await?
    }

    pub async fn state(&self) -> AdbResult<DeviceState> {
        self.run(|d| d.state()).await
    }

    pub async fn shell(&self, command: &str) -> AdbResult<String> {
        let command = command.to_string();
        self.run(move |d| d.shell(&command)).await
    }

    pub async fn get_prop(&self, name: &str) -> AdbResult<String> {
        let name = name.to_string();
        self.run(move |d| d.get_prop_cached(&name)).await
    }

    pub async fn stat(&self, path: &str) -> AdbResult<StatResult> {
        let path = path.to_string();
        self.run(move |d| d.stat(&path)).await
    }

    pub async fn file_exists(&self, path: &str) -> AdbResult<bool> {
        let path = path.to_string();
        self.run(move |d| d.file_exists(&path)).await
    }

    pub async fn push(&self, local: impl Into<PathBuf>, remote: &str) -> AdbResult<u64> {
        let local = local.into();
        let remote = remote.to_string();
        self.run(move |d| d.push(&local, &remote)).await
    }

    pub async fn pull(
        &self,
        remote: &str,
        local: impl Into<PathBuf>,
        preserve_mtime: bool,
    ) -> AdbResult<u64> {
        let remote = remote.to_string();
        let local = local.into();
        self.run(move |d| d.pull(&remote, &local, preserve_mtime))
            .await
    }

    pub async fn forward_tcp_port(&self, local: u16, remote: u16) -> AdbResult<PortForward> {
        self.run(move |d| d.forward_tcp_port(local, remote)).await
    }

    pub async fn remove_forward(&self, forward: PortForward) -> AdbResult<()> {
        self.run(move |d| d.remove_forward(forward)).await
    }

    pub async fn list_forwards(&self) -> AdbResult<Vec<ForwardEntry>> {
        self.run(|d| d.list_forwards()).await
    }

    pub async fn disable_all_forwards(&self) -> AdbResult<()> {
        self.run(|d| d.disable_all_forwards()).await
    }

    pub async fn restart_shell_as_root(&self) -> AdbResult<()> {
        self.run(|d| d.restart_shell_as_root()).await
    }

    pub async fn remount_system_partition(&self) -> AdbResult<()> {
        self.run(|d| d.remount_system_partition()).await
    }

    pub async fn reboot(&self, target: Option<&str>) -> AdbResult<()> {
        let target = target.map(str::to_string);
        self.run(move |d| match target {
            Some(target) => d.reboot_into(&target),
            None => d.reboot(),
        })
        .await
    }

    pub async fn wait_for_device(&self, timeout: Duration) -> AdbResult<()> {
        self.run(move |d| d.wait_for_device(timeout)).await
    }
}

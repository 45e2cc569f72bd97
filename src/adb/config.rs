// Connection settings for the local adb daemon
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::sync::SYNC_DATA_MAX;

/// Port the adb daemon listens on unless told otherwise.
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// DATA frame size used for pushes. Kept close to an Ethernet MTU so a frame
/// never straddles many TCP segments.
pub const DEFAULT_SYNC_CHUNK_SIZE: usize = 1490;

/// Environment variable the stock adb tools use for a non-default daemon port.
pub const ADB_PORT_ENV: &str = "ANDROID_ADB_SERVER_PORT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbConfig {
    pub host: IpAddr,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub sync_chunk_size: usize,
    pub poll_interval: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_ADB_PORT,
            connect_timeout: Duration::from_secs(2),
            read_timeout: None,
            write_timeout: None,
            sync_chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl AdbConfig {
    /// Default settings, with the port taken from `ANDROID_ADB_SERVER_PORT`
    /// when it is set to a valid port number.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(ADB_PORT_ENV) {
            Ok(raw) => match raw.trim().parse::<u16>() {
                Ok(port) => config.with_port(port),
                Err(_) => {
                    log::warn!("Ignoring invalid {ADB_PORT_ENV}={raw:?}");
                    config
                }
            },
            Err(_) => config,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Chunk size is clamped to `1..=SYNC_DATA_MAX`.
    pub fn with_sync_chunk_size(mut self, size: usize) -> Self {
        self.sync_chunk_size = size.clamp(1, SYNC_DATA_MAX);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

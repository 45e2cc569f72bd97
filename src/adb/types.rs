// Plain data returned by host commands
use serde::{Serialize, Serializer};
use std::fmt;

/// Connection state of a device as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    /// Any other state string (`bootloader`, `recovery`, `sideload`, ...), kept verbatim.
    Other(String),
}

impl DeviceState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            other => DeviceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceState::Device => "device",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Other(raw) => raw,
        }
    }

    pub fn is_online(&self) -> bool {
        *self == DeviceState::Device
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One `host:devices` record. Offline and unauthorized devices are listed too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
}

/// One `list-forward` record, specs kept as the daemon prints them (`tcp:8080`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardEntry {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

/// A TCP port forward registered with the daemon.
///
/// Dropping this does not remove the forward: it stays registered until
/// [`crate::adb::AdbServer::remove_forward`] (or `killforward-all`) is called
/// or the daemon restarts.
#[must_use = "port forwards stay registered with the daemon until removed"]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortForward {
    pub serial: String,
    pub local: u16,
    pub remote: u16,
}

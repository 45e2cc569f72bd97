// ADB module - pure Rust client for the adb host wire protocol.
// Talks to a locally running adb daemon over TCP: host commands
// (length-prefixed ASCII) and the binary sync protocol for file transfer.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod session;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-export the main types and functions for easy access
pub use backend::AdbBackend;
pub use config::{AdbConfig, DEFAULT_ADB_PORT, DEFAULT_SYNC_CHUNK_SIZE};
pub use device::Device;
pub use error::{AdbError, AdbResult, ErrorKind};
pub use host::AdbServer;
pub use session::{CancelHandle, CancelToken, Session};
pub use sync::{StatResult, SyncClient, SyncOpcode, SyncRequest};
pub use types::{DeviceInfo, DeviceState, ForwardEntry, PortForward};

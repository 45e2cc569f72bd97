pub mod adb;

pub use adb::{AdbBackend, AdbConfig, AdbError, AdbResult, AdbServer, Device, ErrorKind};

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for ADB operations.
pub type AdbResult<T> = Result<T, AdbError>;

/// The five failure buckets callers care about.
///
/// Every [`AdbError`] maps to exactly one of these through [`AdbError::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The daemon could not be reached or the socket died underneath us.
    Connection,
    /// The socket works but the bytes on it do not follow the protocol.
    Protocol,
    /// The daemon answered with a well-formed negative result.
    RemoteFailure,
    /// The request has nothing valid to act on: a bad local or remote
    /// transfer target, or no usable device.
    Target,
    /// Local filesystem failure.
    Io,
}

/// The error type for all ADB-related operations.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("adb daemon not running at {addr}: {source}")]
    DaemonUnavailable {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Connection to adb daemon lost while {context}: {source}")]
    ConnectionLost {
        context: String,
        source: std::io::Error,
    },

    #[error("Operation cancelled while {context}")]
    Cancelled { context: String },

    #[error("Operation timed out after {duration:?}: {description}")]
    Timeout {
        duration: std::time::Duration,
        description: String,
    },

    #[error("No online device attached to the adb daemon")]
    NoDevices,

    #[error("Task failed to complete: {source}")]
    TaskFailed {
        #[from]
        source: tokio::task::JoinError,
    },

    #[error("ADB protocol error while {context}: {description}")]
    Protocol { context: String, description: String },

    #[error("Command is {len} bytes, longer than the 65535 bytes a host frame can carry")]
    CommandTooLong { len: usize },

    #[error("adb daemon refused '{context}': {message}")]
    RemoteFailure { context: String, message: String },

    #[error("Could not restart adbd as root: {output}")]
    RootRefused { output: String },

    #[error("Remount of system partition failed: {output}")]
    RemountFailed { output: String },

    #[error("Invalid transfer target {path:?}: {reason}")]
    Target { path: PathBuf, reason: String },

    #[error("Local I/O error on {path:?}: {source}")]
    LocalIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl AdbError {
    /// Which of the five failure buckets this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdbError::DaemonUnavailable { .. }
            | AdbError::ConnectionLost { .. }
            | AdbError::Cancelled { .. }
            | AdbError::Timeout { .. }
            | AdbError::TaskFailed { .. } => ErrorKind::Connection,
            AdbError::Protocol { .. } | AdbError::CommandTooLong { .. } => ErrorKind::Protocol,
            AdbError::RemoteFailure { .. }
            | AdbError::RootRefused { .. }
            | AdbError::RemountFailed { .. } => ErrorKind::RemoteFailure,
            AdbError::Target { .. } | AdbError::NoDevices => ErrorKind::Target,
            AdbError::LocalIo { .. } => ErrorKind::Io,
        }
    }

    /// Whether restarting the whole operation could reasonably succeed.
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connection && !matches!(self, AdbError::Cancelled { .. })
    }

    /// The daemon's literal message, if the daemon sent one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            AdbError::RemoteFailure { message, .. } => Some(message),
            AdbError::RootRefused { output } | AdbError::RemountFailed { output } => Some(output),
            _ => None,
        }
    }

    pub(crate) fn protocol(context: impl Into<String>, description: impl Into<String>) -> Self {
        AdbError::Protocol {
            context: context.into(),
            description: description.into(),
        }
    }

    pub(crate) fn target(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AdbError::Target {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AdbError::LocalIo {
            path: path.into(),
            source,
        }
    }
}

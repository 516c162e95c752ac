//! Error types shared by the supervisor, the host and the resource governor.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the workspace.
pub type IsolationResult<T> = Result<T, IsolationError>;

#[derive(Debug, Error)]
pub enum IsolationError {
    /// Invalid limit values, frozen-options mutation and similar misuse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid affinity specification: {0}")]
    Format(String),

    /// A failed kernel call, carrying the OS error code.
    #[error("{operation} failed: {description} (os error {code})")]
    Os {
        operation: String,
        code: u32,
        description: String,
    },

    /// Access denied by the OS, kept apart from other OS failures.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to start host process: {0}")]
    StartFailed(String),

    #[error("host process {pid} exited with code {code} before signaling startup")]
    ExitedDuringStartup { pid: u32, code: i32 },

    /// Unrecoverable supervisor failure (restarts exhausted, unhandled exit error).
    #[error("{0}")]
    Terminal(String),

    /// Process-id enumeration found more members than the query buffer holds.
    #[error("resource-limit group has {assigned} processes, more than the {capacity} that can be listed")]
    ProcessListOverflow { assigned: u32, capacity: usize },

    #[error(transparent)]
    Remote(#[from] RemoteFault),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel closed by host")]
    ChannelClosed,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IsolationError {
    /// Builds an OS error from a raw code, remapping access denied.
    pub fn from_os_code(operation: impl Into<String>, code: u32) -> Self {
        const ERROR_ACCESS_DENIED: u32 = 5;

        let operation = operation.into();
        let description = std::io::Error::from_raw_os_error(code as i32).to_string();
        if code == ERROR_ACCESS_DENIED {
            return IsolationError::Unauthorized(format!("{}: {}", operation, description));
        }
        IsolationError::Os {
            operation,
            code,
            description,
        }
    }

    /// True if the error means the host end of the channel is gone.
    pub fn is_channel_closed(&self) -> bool {
        match self {
            IsolationError::ChannelClosed => true,
            IsolationError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Classification of a fault raised inside the host while serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    InvalidParameter,
    InvalidSpecification,
    ModuleLoad,
    ContainerNotFound,
    EntryPointNotFound,
    /// Fault raised by the invoked entry point itself.
    Workload,
    Internal,
}

/// A fault that crossed the channel from the host.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub struct RemoteFault {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            // The workload's own message is surfaced as-is.
            FaultKind::Workload => write!(f, "{}", self.message),
            kind => write!(f, "{:?}: {}", kind, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_maps_to_unauthorized() {
        let err = IsolationError::from_os_code("AssignProcessToJobObject", 5);
        assert!(matches!(err, IsolationError::Unauthorized(_)));
    }

    #[test]
    fn test_os_error_keeps_code() {
        match IsolationError::from_os_code("CreateJobObject", 87) {
            IsolationError::Os { code, operation, .. } => {
                assert_eq!(code, 87);
                assert_eq!(operation, "CreateJobObject");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_workload_fault_displays_raw_message() {
        let fault = RemoteFault::new(FaultKind::Workload, "boom");
        assert_eq!(fault.to_string(), "boom");

        let fault = RemoteFault::new(FaultKind::EntryPointNotFound, "x.y");
        assert_eq!(fault.to_string(), "EntryPointNotFound: x.y");
    }

    #[test]
    fn test_channel_closed_detection() {
        assert!(IsolationError::ChannelClosed.is_channel_closed());
        let io = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(IsolationError::Io(io).is_channel_closed());
        assert!(!IsolationError::Cancelled.is_channel_closed());
    }
}

//! Core error taxonomy
//!
//! Every command of the public surface fails with a `CoreError`. Layer-local
//! errors (`SshError`, `SftpError`, `StorageError`, `KeychainError`) are
//! folded into it at the service boundary.

use thiserror::Error;

use crate::config::{KeychainError, StorageError};
use crate::sftp::SftpError;
use crate::ssh::SshError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad credentials, unreadable key, rejected by server
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Unreachable host, handshake failure, timeout while connecting
    #[error("Connection failed: {0}")]
    Connectivity(String),

    /// Per-operation failure: permission denied, no such file, no such pid
    #[error("Channel error: {0}")]
    Channel(String),

    /// Remote output that could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The owning connection or channel was closed under the operation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A bounded operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Whether this failure says something about the transport itself.
    ///
    /// Only these count towards the consecutive-failure threshold that
    /// promotes a transport to `error`.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, CoreError::Timeout(_) | CoreError::Connectivity(_))
    }
}

impl From<SshError> for CoreError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => {
                CoreError::Authentication(msg)
            }
            SshError::ConnectionFailed(msg) => CoreError::Connectivity(msg),
            SshError::HostKeyRejected(msg) => CoreError::Connectivity(msg),
            SshError::Timeout(msg) => CoreError::Timeout(msg),
            SshError::IoError(e) => CoreError::Connectivity(e.to_string()),
            SshError::ChannelError(msg) => CoreError::Channel(msg),
            SshError::ProtocolError(msg) => CoreError::Channel(msg),
            SshError::Disconnected => CoreError::Cancelled("connection closed".to_string()),
        }
    }
}

impl From<SftpError> for CoreError {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::Disconnected => CoreError::Cancelled("SFTP channel closed".to_string()),
            SftpError::Timeout(path) => CoreError::Timeout(format!("SFTP request on {}", path)),
            other => CoreError::Channel(other.to_string()),
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<KeychainError> for CoreError {
    fn from(err: KeychainError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

// Serialized as the display string so command results can be shown directly
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

//! SFTP error types

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("No such file: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other status the server reported, with its text
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Local file error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The server did not answer a request in time
    #[error("SFTP request timed out: {0}")]
    Timeout(String),

    /// The SFTP channel or its connection went away
    #[error("SFTP channel closed")]
    Disconnected,
}

impl Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

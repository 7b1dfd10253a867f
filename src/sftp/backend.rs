//! SFTP backend
//!
//! The handful of SFTP requests the core issues, behind a trait so the
//! service can run against russh-sftp or an in-memory tree.

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::SftpError;
use super::types::FileEntry;

#[async_trait]
pub trait SftpBackend: Send + Sync {
    /// Raw entries, unsorted; may include `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, SftpError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, SftpError>;
    /// Create or truncate, then write all of `content`
    async fn write(&self, path: &str, content: &[u8]) -> Result<(), SftpError>;
    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;
    /// Create or truncate `path` and return a writer for streaming into it
    async fn create(&self, path: &str) -> Result<Box<dyn SftpWriter>, SftpError>;
}

/// An open remote file being filled chunk by chunk
#[async_trait]
pub trait SftpWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError>;
    /// Flush and close; the file is complete once this returns
    async fn finish(&mut self) -> Result<(), SftpError>;
}

/// Backend over a russh-sftp client session
pub struct RusshSftpBackend {
    sftp: SftpSession,
}

impl RusshSftpBackend {
    pub fn new(sftp: SftpSession) -> Self {
        Self { sftp }
    }
}

fn map_sftp_error(err: SftpErrorInner, path: &str) -> SftpError {
    match err {
        SftpErrorInner::Timeout => SftpError::Timeout(path.to_string()),
        SftpErrorInner::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::FileNotFound(path.to_string()),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            StatusCode::NoConnection | StatusCode::ConnectionLost => SftpError::Disconnected,
            _ => SftpError::Remote(format!("{}: {}", path, status.error_message)),
        },
        other => {
            let err_str = other.to_string();
            if err_str.contains("No such file") || err_str.contains("not found") {
                SftpError::FileNotFound(path.to_string())
            } else if err_str.contains("Permission denied") {
                SftpError::PermissionDenied(path.to_string())
            } else {
                SftpError::Remote(format!("{}: {}", path, err_str))
            }
        }
    }
}

struct RusshSftpWriter {
    file: File,
    path: String,
    written: u64,
}

#[async_trait]
impl SftpWriter for RusshSftpWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SftpError> {
        self.file.write_all(chunk).await.map_err(|e| {
            SftpError::Remote(format!("Failed to write {}: {}", self.path, e))
        })?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SftpError> {
        self.file
            .flush()
            .await
            .map_err(|e| SftpError::Remote(format!("Failed to flush {}: {}", self.path, e)))?;
        let _ = self.file.shutdown().await;
        debug!("Streamed {} bytes to {}", self.written, self.path);
        Ok(())
    }
}

#[async_trait]
impl SftpBackend for RusshSftpBackend {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        Ok(read_dir
            .map(|entry| FileEntry::new(entry.file_name(), entry.metadata().is_dir()))
            .collect())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        self.sftp
            .read(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), SftpError> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        file.write_all(content)
            .await
            .map_err(|e| SftpError::Remote(format!("Failed to write {}: {}", path, e)))?;
        file.flush()
            .await
            .map_err(|e| SftpError::Remote(format!("Failed to flush {}: {}", path, e)))?;
        // shutdown sends CLOSE so the next request observes the full file
        let _ = file.shutdown().await;

        debug!("Wrote {} bytes to {}", content.len(), path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn SftpWriter>, SftpError> {
        let file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        Ok(Box::new(RusshSftpWriter {
            file,
            path: path.to_string(),
            written: 0,
        }))
    }
}

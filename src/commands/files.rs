//! SFTP commands

use super::AppState;
use crate::error::CoreError;
use crate::sftp::FileEntry;

impl AppState {
    pub async fn sftp_list(
        &self,
        connection_id: &str,
        path: &str,
    ) -> Result<Vec<FileEntry>, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.list(connection_id, path).await
    }

    /// File contents as UTF-8 text (lossy)
    pub async fn sftp_read_file(&self, connection_id: &str, path: &str) -> Result<String, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.read_text(connection_id, path).await
    }

    pub async fn sftp_read_file_base64(
        &self,
        connection_id: &str,
        path: &str,
    ) -> Result<String, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.read_base64(connection_id, path).await
    }

    pub async fn sftp_write_file(
        &self,
        connection_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.write(connection_id, path, content).await
    }

    pub async fn sftp_create_dir(&self, connection_id: &str, path: &str) -> Result<(), CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.mkdir(connection_id, path).await
    }

    /// Returns the remote path written
    pub async fn sftp_upload_file(
        &self,
        connection_id: &str,
        local_path: &str,
        remote_dir: &str,
    ) -> Result<String, CoreError> {
        self.ensure_connected(connection_id).await?;
        self.sftp.upload(connection_id, local_path, remote_dir).await
    }
}

//! SFTP service
//!
//! Every call takes the connection's SFTP lease from the multiplexer, so
//! requests on one connection run one at a time in submission order.

use std::sync::Arc;

use base64::Engine;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::{join_remote_path, local_file_name, validate_remote_path};
use super::types::{listing_order, FileEntry};
use crate::error::CoreError;
use crate::mux::{ChannelMultiplexer, SftpLease};
use crate::ssh::TransportManager;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

pub struct SftpService {
    transports: Arc<TransportManager>,
    mux: Arc<ChannelMultiplexer>,
}

impl SftpService {
    pub fn new(transports: Arc<TransportManager>, mux: Arc<ChannelMultiplexer>) -> Self {
        Self { transports, mux }
    }

    async fn lease(&self, connection_id: &str) -> Result<SftpLease<'_>, CoreError> {
        let transport = self.transports.acquire(connection_id)?;
        self.mux.lock_sftp(&transport).await
    }

    /// Directory entries, directories first, then by name.
    pub async fn list(&self, connection_id: &str, path: &str) -> Result<Vec<FileEntry>, CoreError> {
        validate_remote_path(path)?;
        let mut lease = self.lease(connection_id).await?;
        let backend = lease.backend();
        let mut entries = lease.run("list", backend.read_dir(path)).await?;

        entries.retain(|e| e.name != "." && e.name != "..");
        entries.sort_by(listing_order);
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    pub async fn read_binary(&self, connection_id: &str, path: &str) -> Result<Vec<u8>, CoreError> {
        validate_remote_path(path)?;
        let mut lease = self.lease(connection_id).await?;
        let backend = lease.backend();
        lease.run("read", backend.read(path)).await
    }

    /// File contents as text; invalid UTF-8 is replaced
    pub async fn read_text(&self, connection_id: &str, path: &str) -> Result<String, CoreError> {
        let bytes = self.read_binary(connection_id, path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn read_base64(&self, connection_id: &str, path: &str) -> Result<String, CoreError> {
        let bytes = self.read_binary(connection_id, path).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Overwrite `path` with `content`, creating it if needed
    pub async fn write(
        &self,
        connection_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), CoreError> {
        validate_remote_path(path)?;
        let mut lease = self.lease(connection_id).await?;
        let backend = lease.backend();
        lease.run("write", backend.write(path, content)).await?;
        info!("Wrote {} bytes to {} on {}", content.len(), path, connection_id);
        Ok(())
    }

    pub async fn mkdir(&self, connection_id: &str, path: &str) -> Result<(), CoreError> {
        validate_remote_path(path)?;
        let mut lease = self.lease(connection_id).await?;
        let backend = lease.backend();
        lease.run("mkdir", backend.mkdir(path)).await
    }

    /// Copy a local file into `remote_dir`, keeping its name. Returns the remote path.
    ///
    /// The file is streamed in chunks and the operation timeout applies to
    /// each chunk, so a long transfer that keeps moving is not cut off.
    pub async fn upload(
        &self,
        connection_id: &str,
        local_path: &str,
        remote_dir: &str,
    ) -> Result<String, CoreError> {
        validate_remote_path(remote_dir)?;
        let name = local_file_name(local_path)?;
        let mut local_file = tokio::fs::File::open(local_path)
            .await
            .map_err(SftpError::LocalIo)?;
        let remote_path = join_remote_path(remote_dir, &name);

        let mut lease = self.lease(connection_id).await?;
        let backend = lease.backend();
        let mut writer = lease.run("upload open", backend.create(&remote_path)).await?;

        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut transferred: u64 = 0;
        loop {
            let bytes_read = local_file
                .read(&mut buffer)
                .await
                .map_err(SftpError::LocalIo)?;
            if bytes_read == 0 {
                break;
            }
            lease
                .run("upload write", writer.write_chunk(&buffer[..bytes_read]))
                .await?;
            transferred += bytes_read as u64;
        }
        lease.run("upload close", writer.finish()).await?;

        info!(
            "Uploaded {} to {} ({} bytes)",
            local_path, remote_path, transferred
        );
        Ok(remote_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::TransportState;
    use crate::testing::connected_manager;
    use std::time::Duration;

    async fn service() -> (Arc<crate::testing::FakeConnector>, Arc<SftpService>) {
        let (connector, transports, mux) = connected_manager("c1").await;
        (connector, Arc::new(SftpService::new(transports, mux)))
    }

    #[tokio::test]
    async fn test_list_sorted_and_filtered() {
        let (connector, sftp) = service().await;
        let tree = connector.sftp();
        tree.add_dir("/srv");
        tree.add_file("/srv/b.log", b"");
        tree.add_dir("/srv/www");
        tree.add_file("/srv/A.txt", b"");
        tree.add_dir("/srv/backups");

        let names: Vec<_> = sftp
            .list("c1", "/srv")
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_directory))
            .collect();
        assert_eq!(
            names,
            vec![
                ("backups".to_string(), true),
                ("www".to_string(), true),
                ("A.txt".to_string(), false),
                ("b.log".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_overwrites_and_reads_back() {
        let (_connector, sftp) = service().await;
        sftp.write("c1", "/notes.txt", b"first version").await.unwrap();
        sftp.write("c1", "/notes.txt", b"second").await.unwrap();

        assert_eq!(sftp.read_text("c1", "/notes.txt").await.unwrap(), "second");
        assert_eq!(
            sftp.read_base64("c1", "/notes.txt").await.unwrap(),
            "c2Vjb25k"
        );
    }

    #[tokio::test]
    async fn test_write_then_list_sees_file() {
        let (connector, sftp) = service().await;
        connector.sftp().add_dir("/a");
        connector
            .sftp()
            .set_write_delay(Some(Duration::from_millis(50)));

        let writer = {
            let sftp = sftp.clone();
            tokio::spawn(async move { sftp.write("c1", "/a/b.txt", b"hello").await })
        };
        connector.sftp().wait_write_started().await;
        let listing = sftp.list("c1", "/a").await.unwrap();

        writer.await.unwrap().unwrap();
        assert!(listing.iter().any(|e| e.name == "b.txt"));
    }

    #[tokio::test]
    async fn test_remote_errors_carry_path() {
        let (connector, sftp) = service().await;
        connector.sftp().add_file("/etc/shadow", b"x");
        connector.sftp().deny("/etc/shadow");

        match sftp.read_text("c1", "/etc/shadow").await {
            Err(CoreError::Channel(msg)) => assert!(msg.contains("/etc/shadow")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            sftp.read_binary("c1", "/missing").await,
            Err(CoreError::Channel(_))
        ));
        // A failed op leaves the channel usable for the next one
        sftp.mkdir("c1", "/tmp").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_returns_remote_path() {
        let (connector, sftp) = service().await;
        connector.sftp().add_dir("/home");
        let temp = tempfile::tempdir().unwrap();
        let local = temp.path().join("deploy.sh");
        std::fs::write(&local, b"#!/bin/sh\n").unwrap();

        let remote = sftp
            .upload("c1", local.to_str().unwrap(), "/home")
            .await
            .unwrap();
        assert_eq!(remote, "/home/deploy.sh");
        assert_eq!(connector.sftp().file("/home/deploy.sh").unwrap(), b"#!/bin/sh\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_longer_than_timeout_keeps_going() {
        let (connector, sftp) = service().await;
        connector.sftp().add_dir("/backups");
        connector.sftp().set_chunk_delay(Some(Duration::from_secs(6)));
        let temp = tempfile::tempdir().unwrap();
        let local = temp.path().join("db.dump");
        let content: Vec<u8> = (0..3 * UPLOAD_CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local, &content).unwrap();

        // Three 6s chunks under a 10s operation timeout
        let remote = sftp
            .upload("c1", local.to_str().unwrap(), "/backups")
            .await
            .unwrap();
        assert_eq!(remote, "/backups/db.dump");
        assert_eq!(connector.sftp().chunk_writes(), 3);
        assert_eq!(connector.sftp().file("/backups/db.dump").unwrap(), content);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_chunk_times_out() {
        let (connector, sftp) = service().await;
        connector.sftp().add_dir("/backups");
        connector.sftp().set_chunk_delay(Some(Duration::from_secs(15)));
        let temp = tempfile::tempdir().unwrap();
        let local = temp.path().join("db.dump");
        std::fs::write(&local, b"payload").unwrap();

        assert!(matches!(
            sftp.upload("c1", local.to_str().unwrap(), "/backups").await,
            Err(CoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let (connector, sftp) = service().await;
        connector.sftp().add_dir("/home");
        assert!(matches!(
            sftp.upload("c1", "/nonexistent/deploy.sh", "/home").await,
            Err(CoreError::Channel(_))
        ));
        assert!(connector.sftp().file("/home/deploy.sh").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_sftp_timeouts_trip_transport() {
        let (connector, transports, mux) = connected_manager("c1").await;
        let sftp = SftpService::new(transports.clone(), mux);
        let transport = transports.acquire("c1").unwrap();
        connector.sftp().set_write_delay(Some(Duration::from_secs(15)));

        for _ in 0..2 {
            assert!(matches!(
                sftp.write("c1", "/slow.bin", b"x").await,
                Err(CoreError::Timeout(_))
            ));
            assert_eq!(transports.status("c1").state, TransportState::Connected);
        }
        assert!(matches!(
            sftp.write("c1", "/slow.bin", b"x").await,
            Err(CoreError::Timeout(_))
        ));

        transport.cancel_token().cancelled().await;
        tokio::task::yield_now().await;
        assert_eq!(transports.status("c1").state, TransportState::Error);
        assert_eq!(connector.links()[0].sftp_opens(), 3);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (_connector, sftp) = service().await;
        assert!(matches!(
            sftp.list("other", "/").await,
            Err(CoreError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_request() {
        let (connector, transports, mux) = connected_manager("c1").await;
        let sftp = Arc::new(SftpService::new(transports.clone(), mux));
        connector.sftp().set_write_delay(Some(Duration::from_secs(60)));

        let writer = {
            let sftp = sftp.clone();
            tokio::spawn(async move { sftp.write("c1", "/big.bin", b"data").await })
        };
        connector.sftp().wait_write_started().await;
        transports.disconnect("c1").await;

        assert!(matches!(writer.await.unwrap(), Err(CoreError::Cancelled(_))));
    }
}

//! SSH Client implementation using russh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::*;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::link::{Connector, Link};
use super::session::{SshLink, SshSession};

/// SSH Client handler for russh
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect to the SSH server and return an authenticated session
    pub async fn connect(self) -> Result<SshSession, SshError> {
        info!(
            "Connecting to SSH server at {}:{}",
            self.config.host, self.config.port
        );

        let ssh_config = client::Config {
            // Liveness is tracked by the owner task and the failure threshold
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
            self.config.known_hosts_path.clone(),
        );

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let addr = (self.config.host.as_str(), self.config.port);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| match e {
            SshError::HostKeyRejected(_) => e,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed");

        let auth = tokio::time::timeout(timeout, self.authenticate(&mut handle))
            .await
            .map_err(|_| SshError::Timeout("Authentication timed out".to_string()))?;
        auth?;

        info!(
            "SSH authentication successful for {}@{}",
            self.config.username, self.config.host
        );

        Ok(SshSession::new(handle))
    }

    async fn authenticate(&self, handle: &mut client::Handle<ClientHandler>) -> Result<(), SshError> {
        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(format!("{}: {}", key_path, e)))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server host key against a known_hosts file:
/// - known and matching: accepted
/// - unknown: learned (TOFU), or rejected when `strict` is set
/// - changed: always rejected
pub struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
    known_hosts_path: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts_path: Option<PathBuf>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts_path,
        }
    }

    fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts_path
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")))
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        let Some(path) = self.known_hosts_path() else {
            warn!(
                "No home directory, accepting host key for {}:{} without verification ({})",
                self.host, self.port, fingerprint
            );
            return Ok(!self.strict);
        };

        match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, &path)
        {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) if self.strict => {
                warn!(
                    "Unknown host key for {}:{} ({}), strict checking enabled",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} (fingerprint {})",
                    self.host, self.port, fingerprint
                )))
            }
            Ok(false) => {
                info!(
                    "New host {}:{}, adding to known_hosts ({})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = russh::keys::known_hosts::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    &path,
                ) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "Host key check failed for {}:{} ({}): {}",
                    self.host, self.port, fingerprint, e
                );
                Err(SshError::HostKeyRejected(format!(
                    "host key for {}:{} does not match known_hosts (fingerprint {}): {}",
                    self.host, self.port, fingerprint, e
                )))
            }
        }
    }
}

/// `Connector` backed by russh: handshake, authenticate, spawn the owner task.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        connection_id: &str,
        config: SshConfig,
    ) -> Result<Arc<dyn Link>, SshError> {
        let session = SshClient::new(config).connect().await?;
        let controller = session.start(connection_id.to_string());
        Ok(Arc::new(SshLink::new(connection_id.to_string(), controller)))
    }
}

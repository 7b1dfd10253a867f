//! SSH Session management

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use russh::ChannelMsg;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::link::{ExecOutput, Link, SessionCommand, ShellIo};
use crate::sftp::{RusshSftpBackend, SftpBackend};

/// An authenticated connection whose Handle has not been handed to its owner task yet.
pub struct SshSession {
    handle: Handle<ClientHandler>,
}

impl SshSession {
    pub fn new(handle: Handle<ClientHandler>) -> Self {
        Self { handle }
    }

    /// Start the Handle Owner Task and return a controller
    ///
    /// This consumes the Handle. All further channel opens go through the
    /// returned `HandleController`.
    pub fn start(self, connection_id: String) -> HandleController {
        spawn_handle_owner_task(self.handle, connection_id)
    }
}

/// `Link` over a russh connection driven by the handle owner task.
pub struct SshLink {
    connection_id: String,
    controller: HandleController,
}

impl SshLink {
    pub fn new(connection_id: String, controller: HandleController) -> Self {
        Self {
            connection_id,
            controller,
        }
    }
}

#[async_trait]
impl Link for SshLink {
    async fn open_shell(
        &self,
        cols: u32,
        rows: u32,
        cancel: CancellationToken,
    ) -> Result<ShellIo, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        debug!("Channel opened, requesting PTY");

        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!(
            "Interactive shell started on connection {}",
            self.connection_id
        );

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(1024);
        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let cid = self.connection_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Shell channel cancelled on connection {}", cid);
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }

                    cmd = cmd_rx.recv() => match cmd {
                        Some(SessionCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to SSH channel: {}", e);
                                break;
                            }
                        }
                        Some(SessionCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                                // A failed resize leaves the shell usable
                                warn!("Failed to resize PTY: {}", e);
                            } else {
                                debug!("PTY resized to {}x{} on connection {}", cols, rows, cid);
                            }
                        }
                        Some(SessionCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },

                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            let _ = output_tx.send(data.to_vec());
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // stderr
                            if ext == 1 {
                                let _ = output_tx.send(data.to_vec());
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            debug!("Shell channel ended by remote on connection {}", cid);
                            break;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("Shell exited with status {} on connection {}", exit_status, cid);
                        }
                        Some(_) => {}
                    },
                }
            }
            // Dropping output_tx ends the reader side
        });

        Ok(ShellIo { cmd_tx, output_rx })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Exec request failed: {}", e)))?;

        let mut output = ExecOutput::default();
        // Exit status may arrive after EOF, so read until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        if !self.controller.is_connected() && output.exit_status.is_none() {
            return Err(SshError::Disconnected);
        }
        Ok(output)
    }

    async fn open_sftp(&self) -> Result<Arc<dyn SftpBackend>, SshError> {
        let channel = self.controller.open_session_channel().await?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP subsystem request failed: {}", e)))?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ProtocolError(format!("SFTP init failed: {}", e)))?;

        info!("SFTP subsystem opened on connection {}", self.connection_id);
        Ok(Arc::new(RusshSftpBackend::new(sftp)))
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn disconnect(&self) {
        self.controller.disconnect().await;
    }
}

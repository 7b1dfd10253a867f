//! Transport seam
//!
//! A `Link` is one authenticated connection to a remote host. The rest of the
//! core only talks to the wire through this trait, which keeps the
//! multiplexer and services independent of russh (and lets tests swap in an
//! in-memory host).
//!
//! ```text
//! Connector::connect ──► Arc<dyn Link> ──┬── open_shell ─► ShellIo (cmd_tx / output_rx)
//!                                        ├── exec       ─► ExecOutput
//!                                        └── open_sftp  ─► Arc<dyn SftpBackend>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::config::SshConfig;
use super::error::SshError;
use crate::sftp::SftpBackend;

/// Commands that can be sent to an interactive shell channel
#[derive(Debug)]
pub enum SessionCommand {
    /// Data to send to the remote stdin
    Data(Vec<u8>),
    /// Resize the PTY (cols, rows)
    Resize(u16, u16),
    /// Send EOF and close the channel
    Close,
}

/// Both ends of an open shell channel.
///
/// Commands are applied in the order they are queued on `cmd_tx`; remote
/// output arrives on `output_rx` in the order the transport delivered it.
/// `output_rx` yielding `None` means the remote side ended the channel.
pub struct ShellIo {
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Collected result of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// A missing exit status counts as success; some servers never send one.
    pub fn success(&self) -> bool {
        self.exit_status.map_or(true, |code| code == 0)
    }
}

/// One live, authenticated transport.
#[async_trait]
pub trait Link: Send + Sync {
    /// Open a session channel with a PTY and start a shell.
    ///
    /// The channel is torn down when `cancel` fires or `SessionCommand::Close`
    /// is received.
    async fn open_shell(
        &self,
        cols: u32,
        rows: u32,
        cancel: CancellationToken,
    ) -> Result<ShellIo, SshError>;

    /// Run a command on a fresh session channel and collect its output.
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Open the SFTP subsystem on a fresh session channel.
    async fn open_sftp(&self) -> Result<Arc<dyn SftpBackend>, SshError>;

    /// Fires once when the underlying connection goes away, for any reason.
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    fn is_connected(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);
}

/// Performs the handshake and authentication for a `Link`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        connection_id: &str,
        config: SshConfig,
    ) -> Result<Arc<dyn Link>, SshError>;
}

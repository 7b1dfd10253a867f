//! Channel Multiplexer
//!
//! Arena of every open channel, keyed by `ChannelId`. Shell and exec channels
//! run independently on their transport. SFTP goes through one lazily opened
//! subsystem per connection, guarded by a FIFO-fair async mutex so only one
//! SFTP request is in flight per transport and a write is always visible to
//! the request queued after it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::{ChannelHandle, ChannelId, ChannelKind, ChannelState};
use crate::error::CoreError;
use crate::sftp::SftpBackend;
use crate::ssh::{ExecOutput, ShellIo, TransportRef};

/// Run `fut` unless `cancel` fires or `timeout` elapses first.
async fn bounded<T, E, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    what: &str,
    fut: F,
) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, E>>,
    CoreError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CoreError::Cancelled(format!("{} cancelled", what))),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(CoreError::Timeout(format!("{} timed out after {:?}", what, timeout))),
        },
    }
}

#[derive(Default)]
struct SftpSlot {
    open: Option<(Arc<dyn SftpBackend>, ChannelHandle)>,
}

pub struct ChannelMultiplexer {
    channels: DashMap<ChannelId, ChannelHandle>,
    sftp: DashMap<String, Arc<Mutex<SftpSlot>>>,
    op_timeout: Duration,
}

impl ChannelMultiplexer {
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            sftp: DashMap::new(),
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Allocate a channel on a connected transport.
    pub fn open_channel(
        &self,
        transport: &TransportRef,
        kind: ChannelKind,
    ) -> Result<ChannelHandle, CoreError> {
        if !transport.is_live() {
            return Err(CoreError::Channel(format!(
                "connection {} is not connected",
                transport.connection_id
            )));
        }

        let handle = ChannelHandle::new(
            kind,
            transport.connection_id.clone(),
            transport.cancel_token().child_token(),
        );
        self.channels.insert(handle.id().clone(), handle.clone());

        // Lost a race with close_connection
        if transport.cancel_token().is_cancelled() {
            self.close_channel(handle.id());
            return Err(CoreError::Cancelled(format!(
                "connection {} closed",
                transport.connection_id
            )));
        }

        debug!(
            "Opened {:?} channel {} on {}",
            kind,
            handle.id(),
            transport.connection_id
        );
        Ok(handle)
    }

    /// open → closing → closed. Closing a closed or unknown channel is a no-op.
    pub fn close_channel(&self, id: &ChannelId) {
        if let Some((_, handle)) = self.channels.remove(id) {
            if handle.close() {
                debug!("Closed {:?} channel {}", handle.kind(), id);
            }
        }
    }

    pub fn channel_state(&self, id: &ChannelId) -> Option<ChannelState> {
        self.channels.get(id).map(|h| h.state())
    }

    pub fn open_channels(&self, connection_id: &str) -> Vec<(ChannelId, ChannelKind)> {
        self.channels
            .iter()
            .filter(|h| h.connection_id() == connection_id)
            .map(|h| (h.id().clone(), h.kind()))
            .collect()
    }

    /// Force-close every channel of a transport that left `connected`.
    pub fn close_connection(&self, connection_id: &str) {
        let ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|h| h.connection_id() == connection_id)
            .map(|h| h.id().clone())
            .collect();

        for id in &ids {
            self.close_channel(id);
        }
        self.sftp.remove(connection_id);

        if !ids.is_empty() {
            info!("Closed {} channels of connection {}", ids.len(), connection_id);
        }
    }

    /// Open a PTY shell channel.
    pub async fn open_shell(
        &self,
        transport: &TransportRef,
        cols: u32,
        rows: u32,
    ) -> Result<(ChannelHandle, ShellIo), CoreError> {
        let handle = self.open_channel(transport, ChannelKind::Shell)?;

        let result = match transport.link() {
            Ok(link) => {
                bounded(
                    handle.token(),
                    self.op_timeout,
                    "shell open",
                    link.open_shell(cols, rows, handle.token().clone()),
                )
                .await
            }
            Err(e) => Err(e),
        };
        transport.health().record(&result);

        match result {
            Ok(io) => Ok((handle, io)),
            Err(e) => {
                self.close_channel(handle.id());
                Err(e)
            }
        }
    }

    /// Run one command on a fresh exec channel.
    pub async fn exec(
        &self,
        transport: &TransportRef,
        command: &str,
    ) -> Result<ExecOutput, CoreError> {
        let handle = self.open_channel(transport, ChannelKind::Exec)?;

        let result = match transport.link() {
            Ok(link) => bounded(handle.token(), self.op_timeout, "exec", link.exec(command)).await,
            Err(e) => Err(e),
        };
        transport.health().record(&result);

        self.close_channel(handle.id());
        result
    }

    /// Wait for exclusive use of the connection's SFTP channel, opening it if needed.
    ///
    /// Waiters are served in submission order.
    pub async fn lock_sftp(&self, transport: &TransportRef) -> Result<SftpLease<'_>, CoreError> {
        if !transport.is_live() {
            return Err(CoreError::Channel(format!(
                "connection {} is not connected",
                transport.connection_id
            )));
        }

        let slot = self
            .sftp
            .entry(transport.connection_id.clone())
            .or_default()
            .clone();
        let cancel = transport.cancel_token();

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CoreError::Cancelled("SFTP request cancelled".to_string()))
            }
            guard = slot.lock_owned() => guard,
        };
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled("SFTP request cancelled".to_string()));
        }

        let backend = match &guard.open {
            Some((backend, handle)) if handle.is_open() => backend.clone(),
            _ => {
                let handle = self.open_channel(transport, ChannelKind::Sftp)?;
                let result = match transport.link() {
                    Ok(link) => {
                        bounded(handle.token(), self.op_timeout, "SFTP open", link.open_sftp())
                            .await
                    }
                    Err(e) => Err(e),
                };
                // A successful reopen must not reset the failure count
                if result.is_err() {
                    transport.health().record(&result);
                }

                match result {
                    Ok(backend) => {
                        guard.open = Some((backend.clone(), handle));
                        backend
                    }
                    Err(e) => {
                        self.close_channel(handle.id());
                        return Err(e);
                    }
                }
            }
        };

        Ok(SftpLease {
            mux: self,
            guard,
            backend,
            transport: transport.clone(),
        })
    }
}

/// Exclusive use of a connection's SFTP channel until dropped.
pub struct SftpLease<'a> {
    mux: &'a ChannelMultiplexer,
    guard: OwnedMutexGuard<SftpSlot>,
    backend: Arc<dyn SftpBackend>,
    transport: TransportRef,
}

impl SftpLease<'_> {
    pub fn backend(&self) -> Arc<dyn SftpBackend> {
        self.backend.clone()
    }

    /// Run one SFTP request under the operation timeout and the transport's
    /// cancellation.
    ///
    /// A timeout or cancellation discards the SFTP channel; the next lease
    /// opens a fresh one.
    pub async fn run<T, F>(&mut self, what: &str, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, crate::sftp::SftpError>>,
    {
        let result = bounded(
            self.transport.cancel_token(),
            self.mux.op_timeout,
            what,
            fut,
        )
        .await;
        self.transport.health().record(&result);

        if matches!(result, Err(CoreError::Timeout(_)) | Err(CoreError::Cancelled(_))) {
            if let Some((_, handle)) = self.guard.open.take() {
                self.mux.close_channel(handle.id());
            }
        }
        result
    }
}

//! Terminal Session Service
//!
//! Each session is one PTY shell channel. Input goes through the channel's
//! command queue, so writes reach the remote shell in call order. A pump task
//! per session forwards remote output to the dispatcher under that session's
//! id only, and ends the stream when the channel or its transport closes.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::events::{EventDispatcher, TerminalStream};
use crate::mux::{ChannelHandle, ChannelMultiplexer};
use crate::ssh::{SessionCommand, TransportManager};

struct TerminalSession {
    session_id: String,
    connection_id: String,
    handle: ChannelHandle,
    cmd_tx: mpsc::Sender<SessionCommand>,
    stream: TerminalStream,
    /// Last size forwarded to the remote PTY
    size: Mutex<(u32, u32)>,
}

pub struct TerminalSessionService {
    transports: Arc<TransportManager>,
    mux: Arc<ChannelMultiplexer>,
    dispatcher: Arc<EventDispatcher>,
    sessions: DashMap<String, Arc<TerminalSession>>,
    default_size: (u32, u32),
}

impl TerminalSessionService {
    pub fn new(
        transports: Arc<TransportManager>,
        mux: Arc<ChannelMultiplexer>,
        dispatcher: Arc<EventDispatcher>,
        default_size: (u32, u32),
    ) -> Self {
        Self {
            transports,
            mux,
            dispatcher,
            sessions: DashMap::new(),
            default_size,
        }
    }

    /// Open a shell on `connection_id` and start streaming its output.
    ///
    /// Uses `session_id` when given, otherwise generates one.
    pub async fn create(
        self: &Arc<Self>,
        connection_id: &str,
        session_id: Option<String>,
    ) -> Result<String, CoreError> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.sessions.contains_key(&session_id) {
            return Err(CoreError::Channel(format!(
                "terminal session {} already exists",
                session_id
            )));
        }

        let transport = self.transports.acquire(connection_id)?;
        let (cols, rows) = self.default_size;
        let (handle, io) = self.mux.open_shell(&transport, cols, rows).await?;

        let session = Arc::new(TerminalSession {
            session_id: session_id.clone(),
            connection_id: connection_id.to_string(),
            handle,
            cmd_tx: io.cmd_tx,
            stream: self.dispatcher.terminal_stream(&session_id),
            size: Mutex::new((cols, rows)),
        });

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                self.mux.close_channel(session.handle.id());
                return Err(CoreError::Channel(format!(
                    "terminal session {} already exists",
                    session_id
                )));
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }

        info!(
            "Terminal session {} opened on {} ({}x{})",
            session_id, connection_id, cols, rows
        );
        let this = self.clone();
        tokio::spawn(async move { this.pump(session, io.output_rx).await });
        Ok(session_id)
    }

    async fn pump(
        self: Arc<Self>,
        session: Arc<TerminalSession>,
        mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let reason = loop {
            tokio::select! {
                biased;
                _ = session.handle.cancelled() => break "connection closed",
                data = output_rx.recv() => match data {
                    Some(data) => {
                        if !session.stream.data(data) {
                            break "stopped";
                        }
                    }
                    None => break "remote shell exited",
                },
            }
        };

        session.stream.close(Some(reason.to_string()));
        self.mux.close_channel(session.handle.id());
        self.sessions
            .remove_if(&session.session_id, |_, s| Arc::ptr_eq(s, &session));
        debug!("Terminal session {} ended: {}", session.session_id, reason);
    }

    fn live(&self, session_id: &str) -> Result<Arc<TerminalSession>, CoreError> {
        let closed = || CoreError::Cancelled(format!("terminal session {} is closed", session_id));
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(closed)?;
        if !session.handle.is_open() {
            return Err(closed());
        }
        Ok(session)
    }

    /// Queue bytes for the remote shell
    pub async fn write(&self, session_id: &str, data: Vec<u8>) -> Result<(), CoreError> {
        let session = self.live(session_id)?;
        session
            .cmd_tx
            .send(SessionCommand::Data(data))
            .await
            .map_err(|_| {
                warn!("Write to closed terminal session {}", session_id);
                CoreError::Cancelled(format!("terminal session {} is closed", session_id))
            })
    }

    /// Forward a new PTY size. Returns false, without forwarding, when
    /// either dimension is zero.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<bool, CoreError> {
        if cols == 0 || rows == 0 {
            debug!(
                "Ignoring {}x{} resize for terminal session {}",
                cols, rows, session_id
            );
            return Ok(false);
        }

        let session = self.live(session_id)?;
        session
            .cmd_tx
            .send(SessionCommand::Resize(cols, rows))
            .await
            .map_err(|_| {
                CoreError::Cancelled(format!("terminal session {} is closed", session_id))
            })?;
        *session.size.lock() = (cols as u32, rows as u32);
        Ok(true)
    }

    /// Close the session. Idempotent; nothing is emitted for it afterwards.
    pub fn stop(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        session.stream.close(Some("stopped".to_string()));
        let _ = session.cmd_tx.try_send(SessionCommand::Close);
        self.mux.close_channel(session.handle.id());
        info!("Terminal session {} stopped", session_id);
    }

    /// Stop every session on `connection_id`
    pub fn stop_connection(&self, connection_id: &str) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.session_id.clone())
            .collect();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Ids of open sessions, optionally limited to one connection
    pub fn sessions(&self, connection_id: Option<&str>) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.handle.is_open())
            .filter(|s| connection_id.map_or(true, |c| s.connection_id == c))
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Last size forwarded to the PTY
    pub fn size(&self, session_id: &str) -> Option<(u32, u32)> {
        self.sessions.get(session_id).map(|s| *s.size.lock())
    }
}

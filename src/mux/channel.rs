//! Channel handles

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Globally unique channel id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Shell,
    Sftp,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// Opaque handle to a channel owned by the multiplexer.
///
/// Holders can observe the state and wait for cancellation; they cannot
/// reach the transport.
#[derive(Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    kind: ChannelKind,
    connection_id: String,
    state: Arc<Mutex<ChannelState>>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub(crate) fn new(
        kind: ChannelKind,
        connection_id: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: ChannelId::generate(),
            kind,
            connection_id,
            state: Arc::new(Mutex::new(ChannelState::Open)),
            cancel,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Fires when the channel is closed or its transport goes away
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// open → closing → closed. Returns false if it was already past `open`.
    pub(crate) fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Open {
                return false;
            }
            *state = ChannelState::Closing;
        }
        self.cancel.cancel();
        *self.state.lock() = ChannelState::Closed;
        true
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_transitions_once() {
        let parent = CancellationToken::new();
        let handle = ChannelHandle::new(ChannelKind::Exec, "c1".into(), parent.child_token());
        assert!(handle.is_open());

        assert!(handle.close());
        assert_eq!(handle.state(), ChannelState::Closed);
        assert!(handle.token().is_cancelled());
        assert!(!parent.is_cancelled());

        assert!(!handle.close());
        assert_eq!(handle.state(), ChannelState::Closed);
    }

    #[test]
    fn test_ids_are_unique() {
        let token = CancellationToken::new();
        let a = ChannelHandle::new(ChannelKind::Shell, "c1".into(), token.clone());
        let b = ChannelHandle::new(ChannelKind::Shell, "c1".into(), token);
        assert_ne!(a.id(), b.id());
    }
}

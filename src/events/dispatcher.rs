//! Event Dispatcher
//!
//! Fans out terminal bytes and metrics snapshots to subscribers. A subscriber
//! registers for one key (a session id or connection id) or for every key,
//! and receives events on an unbounded channel so delivery never blocks the
//! producing channel. Receivers that were dropped are pruned on the next emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::metrics::MetricsSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TerminalEvent {
    #[serde(rename_all = "camelCase")]
    Data { session_id: String, data: Vec<u8> },
    /// The stream for this session has ended
    #[serde(rename_all = "camelCase")]
    Closed {
        session_id: String,
        reason: Option<String>,
    },
}

impl TerminalEvent {
    pub fn session_id(&self) -> &str {
        match self {
            TerminalEvent::Data { session_id, .. } | TerminalEvent::Closed { session_id, .. } => {
                session_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub connection_id: String,
    pub snapshot: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber<E> {
    id: SubscriptionId,
    /// `None` receives every key
    key: Option<String>,
    tx: mpsc::UnboundedSender<E>,
}

struct Topic<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
}

impl<E: Clone> Topic<E> {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn subscribe(&self, id: SubscriptionId, key: Option<String>) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber { id, key, tx });
        rx
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    fn emit(&self, key: &str, event: E) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                if sub.key.as_deref().map_or(true, |k| k == key)
                    && sub.tx.send(event.clone()).is_err()
                {
                    dead.push(sub.id);
                }
            }
        }
        if !dead.is_empty() {
            trace!("Pruning {} dropped subscribers", dead.len());
            self.subscribers.write().retain(|s| !dead.contains(&s.id));
        }
    }

    fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

pub struct EventDispatcher {
    terminal: Topic<TerminalEvent>,
    metrics: Topic<MetricsUpdate>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            terminal: Topic::new(),
            metrics: Topic::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Terminal events for one session, or all sessions with `None`
    pub fn subscribe_terminal(
        &self,
        session_id: Option<&str>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<TerminalEvent>) {
        let id = self.next_id();
        let rx = self.terminal.subscribe(id, session_id.map(str::to_string));
        debug!("Terminal subscriber {:?} registered for {:?}", id, session_id);
        (id, rx)
    }

    /// Metrics updates for one connection, or all connections with `None`
    pub fn subscribe_metrics(
        &self,
        connection_id: Option<&str>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<MetricsUpdate>) {
        let id = self.next_id();
        let rx = self.metrics.subscribe(id, connection_id.map(str::to_string));
        debug!("Metrics subscriber {:?} registered for {:?}", id, connection_id);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if !self.terminal.unsubscribe(id) {
            self.metrics.unsubscribe(id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.terminal.len() + self.metrics.len()
    }

    pub(crate) fn emit_metrics(&self, connection_id: &str, snapshot: MetricsSnapshot) {
        self.metrics.emit(
            connection_id,
            MetricsUpdate {
                connection_id: connection_id.to_string(),
                snapshot,
            },
        );
    }

    fn emit_terminal(&self, event: TerminalEvent) {
        let key = event.session_id().to_string();
        self.terminal.emit(&key, event);
    }

    /// Output stream for one terminal session
    pub(crate) fn terminal_stream(self: &Arc<Self>, session_id: &str) -> TerminalStream {
        TerminalStream {
            session_id: session_id.to_string(),
            dispatcher: self.clone(),
            open: Mutex::new(true),
        }
    }
}

/// Per-session emitter. After `close` nothing more is emitted for the session.
pub struct TerminalStream {
    session_id: String,
    dispatcher: Arc<EventDispatcher>,
    open: Mutex<bool>,
}

impl TerminalStream {
    /// Returns false once the stream is closed
    pub fn data(&self, data: Vec<u8>) -> bool {
        let open = self.open.lock();
        if !*open {
            return false;
        }
        self.dispatcher.emit_terminal(TerminalEvent::Data {
            session_id: self.session_id.clone(),
            data,
        });
        true
    }

    /// Emit the final `Closed` event. Idempotent.
    pub fn close(&self, reason: Option<String>) {
        let mut open = self.open.lock();
        if !*open {
            return;
        }
        *open = false;
        self.dispatcher.emit_terminal(TerminalEvent::Closed {
            session_id: self.session_id.clone(),
            reason,
        });
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

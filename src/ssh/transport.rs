//! Transport Manager
//!
//! Owns at most one live transport per connection id.
//!
//! # State machine
//!
//! ```text
//! disconnected ──connect──► connecting ──ok──► connected
//!                                │                 │
//!                           auth/network      link lost / failure threshold
//!                                ▼                 ▼
//!                              error ◄─────────────┘
//! error | connected ──disconnect──► disconnected
//! ```
//!
//! Concurrent `connect` calls for one id queue on a per-slot lock; a caller
//! that waited behind an attempt gets that attempt's outcome instead of
//! starting another. There is no background reconnect: a dropped transport
//! stays in `error` until someone calls `connect` again.
//!
//! Leaving `connected` cancels the cycle token (every channel token and
//! metrics subscription is a child of it) and force-closes the
//! connection's channels in the multiplexer before the link is shut down.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::link::{Connector, Link};
use crate::config::{AuthKind, ConnectionProfile, CoreSettings, SecretStore};
use crate::error::CoreError;
use crate::mux::ChannelMultiplexer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Externally visible view of one transport
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
    pub connection_id: String,
    pub state: TransportState,
    pub last_error: Option<String>,
}

/// Consecutive transport-level failure counter for one connect cycle.
///
/// Channel-scoped failures and successes reset the count; only timeouts and
/// connectivity failures add to it.
pub struct LinkHealth {
    failures: AtomicU32,
    threshold: u32,
    tripped: AtomicBool,
    notify: Notify,
}

impl LinkHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold: threshold.max(1),
            tripped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn record<T>(&self, result: &Result<T, CoreError>) {
        match result {
            Err(e) if e.is_transport_failure() => self.record_failure(),
            _ => self.failures.store(0, Ordering::SeqCst),
        }
    }

    fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Transport failure {}/{}", failures, self.threshold);
        if failures >= self.threshold && !self.tripped.swap(true, Ordering::SeqCst) {
            // notify_one keeps a permit if the watcher is not waiting yet
            self.notify.notify_one();
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    async fn tripped(&self) {
        self.notify.notified().await;
    }
}

/// Non-owning reference to a connected transport, handed to the multiplexer.
#[derive(Clone)]
pub struct TransportRef {
    pub connection_id: String,
    link: Weak<dyn Link>,
    cancel: CancellationToken,
    health: Arc<LinkHealth>,
}

impl TransportRef {
    pub(crate) fn new(
        connection_id: String,
        link: Weak<dyn Link>,
        cancel: CancellationToken,
        health: Arc<LinkHealth>,
    ) -> Self {
        Self {
            connection_id,
            link,
            cancel,
            health,
        }
    }

    /// The live link, or `Cancelled` once the cycle has ended
    pub fn link(&self) -> Result<Arc<dyn Link>, CoreError> {
        if self.cancel.is_cancelled() {
            return Err(self.closed());
        }
        self.link.upgrade().ok_or_else(|| self.closed())
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.link.strong_count() > 0
    }

    /// Fires when this connect cycle ends
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    fn closed(&self) -> CoreError {
        CoreError::Cancelled(format!("connection {} closed", self.connection_id))
    }
}

/// One connected period of a slot
struct Cycle {
    seq: u64,
    link: Arc<dyn Link>,
    cancel: CancellationToken,
    health: Arc<LinkHealth>,
}

struct SlotInner {
    state: TransportState,
    last_error: Option<CoreError>,
    cycle: Option<Cycle>,
    /// Outcome of the most recent finished attempt, tagged with its sequence
    last_outcome: Option<(u64, Result<(), CoreError>)>,
}

struct TransportSlot {
    inner: Mutex<SlotInner>,
    connect_lock: tokio::sync::Mutex<()>,
    finished_attempts: AtomicU64,
}

impl TransportSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: TransportState::Disconnected,
                last_error: None,
                cycle: None,
                last_outcome: None,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            finished_attempts: AtomicU64::new(0),
        }
    }
}

pub struct TransportManager {
    slots: DashMap<String, Arc<TransportSlot>>,
    connector: Arc<dyn Connector>,
    secrets: Arc<dyn SecretStore>,
    mux: Arc<ChannelMultiplexer>,
    settings: CoreSettings,
}

impl TransportManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        secrets: Arc<dyn SecretStore>,
        mux: Arc<ChannelMultiplexer>,
        settings: CoreSettings,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            connector,
            secrets,
            mux,
            settings,
        }
    }

    fn slot(&self, connection_id: &str) -> Arc<TransportSlot> {
        self.slots
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(TransportSlot::new()))
            .clone()
    }

    /// Connect `profile`, or join the attempt already in flight for its id.
    pub async fn connect(self: &Arc<Self>, profile: &ConnectionProfile) -> Result<(), CoreError> {
        let slot = self.slot(&profile.id);
        if slot.inner.lock().state == TransportState::Connected {
            return Ok(());
        }

        let observed = slot.finished_attempts.load(Ordering::SeqCst);
        let _guard = slot.connect_lock.lock().await;

        {
            let inner = slot.inner.lock();
            if inner.state == TransportState::Connected {
                return Ok(());
            }
            // An attempt finished while we were queued: share its outcome
            if let Some((seq, outcome)) = &inner.last_outcome {
                if *seq > observed {
                    return outcome.clone();
                }
            }
        }

        {
            let mut inner = slot.inner.lock();
            inner.state = TransportState::Connecting;
            inner.last_error = None;
        }
        info!(
            "Connecting transport {} -> {}@{}:{}",
            profile.id, profile.user, profile.host, profile.port
        );

        let result = self.establish(profile, None).await;

        let seq = slot.finished_attempts.load(Ordering::SeqCst) + 1;
        let outcome = match result {
            Ok(link) => {
                let cycle = Cycle {
                    seq,
                    link: link.clone(),
                    cancel: CancellationToken::new(),
                    health: Arc::new(LinkHealth::new(self.settings.failure_threshold)),
                };
                self.spawn_watcher(&profile.id, &cycle);

                let mut inner = slot.inner.lock();
                inner.state = TransportState::Connected;
                inner.cycle = Some(cycle);
                info!("Transport {} connected", profile.id);
                Ok(())
            }
            Err(e) => {
                warn!("Transport {} failed to connect: {}", profile.id, e);
                let mut inner = slot.inner.lock();
                inner.state = TransportState::Error;
                inner.last_error = Some(e.clone());
                Err(e)
            }
        };

        slot.inner.lock().last_outcome = Some((seq, outcome.clone()));
        slot.finished_attempts.store(seq, Ordering::SeqCst);
        outcome
    }

    /// Handshake on a throwaway link that is always closed afterwards.
    ///
    /// Never touches the live transport for `profile.id`.
    pub async fn test(
        &self,
        profile: &ConnectionProfile,
        secret_override: Option<String>,
    ) -> Result<(), CoreError> {
        info!("Testing connection to {}@{}:{}", profile.user, profile.host, profile.port);
        let link = self.establish(profile, secret_override).await?;
        link.disconnect().await;
        debug!("Test link to {} closed", profile.host);
        Ok(())
    }

    async fn establish(
        &self,
        profile: &ConnectionProfile,
        secret_override: Option<String>,
    ) -> Result<Arc<dyn Link>, CoreError> {
        let secret = match secret_override {
            Some(secret) => Some(secret),
            None if profile.id.is_empty() => None,
            None => self.secrets.get(&profile.id)?,
        };
        let config = self.ssh_config(profile, secret)?;
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let link_id = if profile.id.is_empty() {
            format!("test-{}", uuid::Uuid::new_v4())
        } else {
            profile.id.clone()
        };

        // Timing out while connecting is a connectivity failure
        match tokio::time::timeout(timeout, self.connector.connect(&link_id, config)).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(e)) => Err(match CoreError::from(e) {
                CoreError::Timeout(msg) => CoreError::Connectivity(msg),
                other => other,
            }),
            Err(_) => Err(CoreError::Connectivity(format!(
                "connection to {}:{} timed out",
                profile.host, profile.port
            ))),
        }
    }

    fn ssh_config(
        &self,
        profile: &ConnectionProfile,
        secret: Option<String>,
    ) -> Result<SshConfig, CoreError> {
        let auth = match profile.auth_method {
            AuthKind::Password => AuthMethod::password(secret.ok_or_else(|| {
                CoreError::Authentication(format!("no password stored for {}", profile.name))
            })?),
            AuthKind::Key => {
                let key_path = profile.key_path.clone().ok_or_else(|| {
                    CoreError::Authentication(format!("no key path set for {}", profile.name))
                })?;
                AuthMethod::key(key_path, secret)
            }
        };

        Ok(SshConfig {
            host: profile.host.clone(),
            port: profile.port,
            username: profile.user.clone(),
            auth,
            timeout_secs: self.settings.connect_timeout_secs,
            strict_host_key_checking: self.settings.strict_host_key_checking,
            known_hosts_path: self.settings.known_hosts_path.clone(),
        })
    }

    /// Watch the link of one cycle and demote the transport to `error` when it dies.
    fn spawn_watcher(self: &Arc<Self>, connection_id: &str, cycle: &Cycle) {
        let manager = Arc::downgrade(self);
        let connection_id = connection_id.to_string();
        let link = cycle.link.clone();
        let cancel = cycle.cancel.clone();
        let health = cycle.health.clone();
        let seq = cycle.seq;
        // Subscribe before spawning so a disconnect right after connect is not missed
        let mut disconnect_rx = link.subscribe_disconnect();

        tokio::spawn(async move {
            let reason = if !link.is_connected() {
                "connection lost"
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = disconnect_rx.recv() => "connection lost",
                    _ = health.tripped() => "too many consecutive failures",
                }
            };
            drop(link);

            if let Some(manager) = manager.upgrade() {
                error!("Transport {} failed: {}", connection_id, reason);
                manager
                    .teardown(
                        &connection_id,
                        Some(seq),
                        TransportState::Error,
                        Some(CoreError::Connectivity(reason.to_string())),
                    )
                    .await;
            }
        });
    }

    /// Close the transport for `connection_id`. Idempotent.
    ///
    /// Waits behind an in-flight connect for the same id.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(slot) = self.slots.get(connection_id).map(|s| s.clone()) else {
            return;
        };
        let _guard = slot.connect_lock.lock().await;
        self.teardown(connection_id, None, TransportState::Disconnected, None)
            .await;
    }

    /// Leave `connected`: cancel the cycle, close its channels, drop the link.
    ///
    /// With `only_seq` set, only that cycle is torn down (a stale watcher must
    /// not kill a newer connection).
    async fn teardown(
        &self,
        connection_id: &str,
        only_seq: Option<u64>,
        state: TransportState,
        err: Option<CoreError>,
    ) {
        let Some(slot) = self.slots.get(connection_id).map(|s| s.clone()) else {
            return;
        };

        let cycle = {
            let mut inner = slot.inner.lock();
            if let Some(seq) = only_seq {
                if inner.cycle.as_ref().map(|c| c.seq) != Some(seq) {
                    return;
                }
            }
            let cycle = inner.cycle.take();
            if cycle.is_none() && state == TransportState::Disconnected && inner.state == state {
                return;
            }
            inner.state = state;
            inner.last_error = err;
            cycle
        };

        if let Some(cycle) = cycle {
            cycle.cancel.cancel();
            self.mux.close_connection(connection_id);
            cycle.link.disconnect().await;
            info!("Transport {} is now {:?}", connection_id, state);
        }
    }

    /// Non-owning reference to the live transport, for opening channels.
    pub fn acquire(&self, connection_id: &str) -> Result<TransportRef, CoreError> {
        let not_connected =
            || CoreError::Channel(format!("connection {} is not connected", connection_id));

        let slot = self
            .slots
            .get(connection_id)
            .map(|s| s.clone())
            .ok_or_else(not_connected)?;
        let inner = slot.inner.lock();
        match (&inner.state, &inner.cycle) {
            (TransportState::Connected, Some(cycle)) => Ok(TransportRef::new(
                connection_id.to_string(),
                Arc::downgrade(&cycle.link),
                cycle.cancel.clone(),
                cycle.health.clone(),
            )),
            _ => Err(not_connected()),
        }
    }

    pub fn status(&self, connection_id: &str) -> TransportStatus {
        let (state, last_error) = match self.slots.get(connection_id) {
            Some(slot) => {
                let inner = slot.inner.lock();
                (inner.state, inner.last_error.as_ref().map(|e| e.to_string()))
            }
            None => (TransportState::Disconnected, None),
        };
        TransportStatus {
            connection_id: connection_id.to_string(),
            state,
            last_error,
        }
    }

    /// Number of live transports
    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.inner.lock().state == TransportState::Connected)
            .count()
    }

    /// Disconnect and drop all record of `connection_id` (profile removed).
    pub async fn forget(&self, connection_id: &str) {
        self.disconnect(connection_id).await;
        self.slots.remove(connection_id);
    }

    /// Disconnect every transport
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down {} transports", ids.len());
        for id in ids {
            self.disconnect(&id).await;
        }
    }
}

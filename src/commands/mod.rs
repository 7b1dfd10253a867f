//! Command surface
//!
//! `AppState` owns one instance of every service and exposes the commands the
//! UI layer issues. Commands that need a transport connect it first (a no-op
//! when it is already up); background work never does.
//!
//! # Command list
//!
//! - connections: `list_connections`, `add_connection`, `update_connection`,
//!   `remove_connection`, `set_secret`, `test_connection`, `connect`,
//!   `disconnect`, `connection_status`
//! - snippets: `snippets_list`, `snippet_add`, `snippet_update`, `snippet_remove`
//! - terminal: `terminal_create`, `terminal_write`, `terminal_resize`, `terminal_stop`
//! - files: `sftp_list`, `sftp_read_file`, `sftp_read_file_base64`,
//!   `sftp_write_file`, `sftp_create_dir`, `sftp_upload_file`
//! - processes: `process_list`, `process_list_parsed`, `process_kill`
//! - metrics: `start_metrics`, `stop_metrics`, `metrics_subscription`

mod connections;
mod files;
mod metrics;
mod processes;
mod terminal;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::{ConfigStorage, ConnectionRegistry, Keychain, SecretStore};
use crate::error::CoreError;
use crate::events::{EventDispatcher, MetricsUpdate, SubscriptionId, TerminalEvent};
use crate::metrics::MetricsCollector;
use crate::mux::ChannelMultiplexer;
use crate::process::ProcessService;
use crate::sftp::SftpService;
use crate::ssh::{Connector, SshConnector, TransportManager, TransportState};
use crate::terminal::TerminalSessionService;

pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub secrets: Arc<dyn SecretStore>,
    pub transports: Arc<TransportManager>,
    pub mux: Arc<ChannelMultiplexer>,
    pub dispatcher: Arc<EventDispatcher>,
    pub terminals: Arc<TerminalSessionService>,
    pub sftp: SftpService,
    pub processes: ProcessService,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Default config location, OS keychain, russh transport
    pub async fn load() -> Result<Self, CoreError> {
        let registry = ConnectionRegistry::load(ConfigStorage::new()?).await?;
        Ok(Self::new(registry, Arc::new(Keychain::new())).await)
    }

    pub async fn new(registry: ConnectionRegistry, secrets: Arc<dyn SecretStore>) -> Self {
        Self::with_connector(registry, secrets, Arc::new(SshConnector)).await
    }

    pub async fn with_connector(
        registry: ConnectionRegistry,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let settings = registry.settings().await;
        let mux = Arc::new(ChannelMultiplexer::new(Duration::from_secs(
            settings.operation_timeout_secs,
        )));
        let dispatcher = Arc::new(EventDispatcher::new());
        let transports = Arc::new(TransportManager::new(
            connector,
            secrets.clone(),
            mux.clone(),
            settings.clone(),
        ));

        let terminals = Arc::new(TerminalSessionService::new(
            transports.clone(),
            mux.clone(),
            dispatcher.clone(),
            (settings.default_cols, settings.default_rows),
        ));
        let sftp = SftpService::new(transports.clone(), mux.clone());
        let processes = ProcessService::new(transports.clone(), mux.clone());
        let metrics = Arc::new(MetricsCollector::new(
            transports.clone(),
            mux.clone(),
            dispatcher.clone(),
            Duration::from_secs(settings.metrics_interval_secs),
        ));

        Self {
            registry: Arc::new(registry),
            secrets,
            transports,
            mux,
            dispatcher,
            terminals,
            sftp,
            processes,
            metrics,
        }
    }

    /// Connect `connection_id` unless its transport is already up
    async fn ensure_connected(&self, connection_id: &str) -> Result<(), CoreError> {
        if self.transports.status(connection_id).state == TransportState::Connected {
            return Ok(());
        }
        let profile = self.registry.get_connection(connection_id).await?;
        self.transports.connect(&profile).await
    }

    /// `onTerminalData` stream for one session, or every session with `None`
    pub fn subscribe_terminal(
        &self,
        session_id: Option<&str>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<TerminalEvent>) {
        self.dispatcher.subscribe_terminal(session_id)
    }

    /// `onMetricsUpdate` stream for one connection, or every connection with `None`
    pub fn subscribe_metrics(
        &self,
        connection_id: Option<&str>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<MetricsUpdate>) {
        self.dispatcher.subscribe_metrics(connection_id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.dispatcher.unsubscribe(id);
    }

    /// Stop all polling and close every transport
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.metrics.stop_all();
        self.transports.shutdown().await;
    }
}

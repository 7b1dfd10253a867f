//! Connection profile, lifecycle and snippet commands

use tracing::info;

use super::AppState;
use crate::config::{ConnectionProfile, Snippet};
use crate::error::CoreError;
use crate::ssh::TransportStatus;

impl AppState {
    pub async fn list_connections(&self) -> Vec<ConnectionProfile> {
        self.registry.list_connections().await
    }

    /// Returns the stored profile with its generated id
    pub async fn add_connection(
        &self,
        profile: ConnectionProfile,
    ) -> Result<ConnectionProfile, CoreError> {
        self.registry.add_connection(profile).await
    }

    /// Edits apply on the next connect; a live transport keeps its settings.
    pub async fn update_connection(
        &self,
        id: &str,
        profile: ConnectionProfile,
    ) -> Result<ConnectionProfile, CoreError> {
        self.registry.update_connection(id, profile).await
    }

    /// Remove the profile, close everything running on it and delete its secret.
    pub async fn remove_connection(&self, id: &str) -> Result<(), CoreError> {
        self.registry.remove_connection(id).await?;

        self.metrics.stop(id);
        self.terminals.stop_connection(id);
        self.transports.forget(id).await;
        self.secrets.delete(id)?;
        info!("Connection {} removed with its secret", id);
        Ok(())
    }

    /// Store the password (or key passphrase) for a saved profile
    pub async fn set_secret(&self, id: &str, secret: &str) -> Result<(), CoreError> {
        self.registry.get_connection(id).await?;
        self.secrets.set(id, secret)?;
        Ok(())
    }

    /// Handshake and authenticate on a throwaway transport.
    ///
    /// `secret` overrides the stored one, so an unsaved form can be tested.
    pub async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        secret: Option<String>,
    ) -> Result<(), CoreError> {
        self.transports.test(profile, secret).await
    }

    pub async fn connect(&self, id: &str) -> Result<(), CoreError> {
        let profile = self.registry.get_connection(id).await?;
        self.transports.connect(&profile).await
    }

    /// Close the transport. Sessions and the metrics subscription on it end with it.
    pub async fn disconnect(&self, id: &str) {
        self.metrics.stop(id);
        self.transports.disconnect(id).await;
    }

    pub fn connection_status(&self, id: &str) -> TransportStatus {
        self.transports.status(id)
    }

    pub async fn snippets_list(&self) -> Vec<Snippet> {
        self.registry.list_snippets().await
    }

    pub async fn snippet_add(&self, snippet: Snippet) -> Result<Snippet, CoreError> {
        self.registry.add_snippet(snippet).await
    }

    pub async fn snippet_update(&self, id: &str, snippet: Snippet) -> Result<Snippet, CoreError> {
        self.registry.update_snippet(id, snippet).await
    }

    pub async fn snippet_remove(&self, id: &str) -> Result<(), CoreError> {
        self.registry.remove_snippet(id).await
    }
}

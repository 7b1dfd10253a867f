//! Connection Registry
//!
//! Durable CRUD over connection profiles and snippets. Every mutation is
//! written through to `ConfigStorage` before it returns. No network state
//! lives here.

use tokio::sync::Mutex;
use uuid::Uuid;

use super::storage::ConfigStorage;
use super::types::{ConfigFile, ConnectionProfile, CoreSettings, Snippet};
use crate::error::CoreError;

pub struct ConnectionRegistry {
    storage: ConfigStorage,
    config: Mutex<ConfigFile>,
}

impl ConnectionRegistry {
    /// Load the registry from `storage`
    pub async fn load(storage: ConfigStorage) -> Result<Self, CoreError> {
        let config = storage.load().await?;
        tracing::info!(
            "Loaded {} connections and {} snippets from {:?}",
            config.connections.len(),
            config.snippets.len(),
            storage.path()
        );
        Ok(Self {
            storage,
            config: Mutex::new(config),
        })
    }

    pub async fn settings(&self) -> CoreSettings {
        self.config.lock().await.settings.clone()
    }

    pub async fn list_connections(&self) -> Vec<ConnectionProfile> {
        self.config.lock().await.connections.clone()
    }

    pub async fn get_connection(&self, id: &str) -> Result<ConnectionProfile, CoreError> {
        self.config
            .lock()
            .await
            .connections
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", id)))
    }

    /// Store a new profile under a freshly generated id
    pub async fn add_connection(
        &self,
        mut profile: ConnectionProfile,
    ) -> Result<ConnectionProfile, CoreError> {
        profile.id = Uuid::new_v4().to_string();

        let mut config = self.config.lock().await;
        config.connections.push(profile.clone());
        self.persist(&config).await?;

        tracing::info!("Added connection {} ({})", profile.id, profile.name);
        Ok(profile)
    }

    /// Replace a profile; the id is kept. Live transports pick it up on next connect.
    pub async fn update_connection(
        &self,
        id: &str,
        mut profile: ConnectionProfile,
    ) -> Result<ConnectionProfile, CoreError> {
        profile.id = id.to_string();

        let mut config = self.config.lock().await;
        let slot = config
            .connections
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("connection {}", id)))?;
        *slot = profile.clone();
        self.persist(&config).await?;

        tracing::info!("Updated connection {}", id);
        Ok(profile)
    }

    pub async fn remove_connection(&self, id: &str) -> Result<(), CoreError> {
        let mut config = self.config.lock().await;
        let before = config.connections.len();
        config.connections.retain(|p| p.id != id);
        if config.connections.len() == before {
            return Err(CoreError::NotFound(format!("connection {}", id)));
        }
        self.persist(&config).await?;

        tracing::info!("Removed connection {}", id);
        Ok(())
    }

    pub async fn list_snippets(&self) -> Vec<Snippet> {
        self.config.lock().await.snippets.clone()
    }

    pub async fn add_snippet(&self, mut snippet: Snippet) -> Result<Snippet, CoreError> {
        snippet.id = Uuid::new_v4().to_string();

        let mut config = self.config.lock().await;
        config.snippets.push(snippet.clone());
        self.persist(&config).await?;
        Ok(snippet)
    }

    pub async fn update_snippet(&self, id: &str, mut snippet: Snippet) -> Result<Snippet, CoreError> {
        snippet.id = id.to_string();

        let mut config = self.config.lock().await;
        let slot = config
            .snippets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("snippet {}", id)))?;
        *slot = snippet.clone();
        self.persist(&config).await?;
        Ok(snippet)
    }

    pub async fn remove_snippet(&self, id: &str) -> Result<(), CoreError> {
        let mut config = self.config.lock().await;
        let before = config.snippets.len();
        config.snippets.retain(|s| s.id != id);
        if config.snippets.len() == before {
            return Err(CoreError::NotFound(format!("snippet {}", id)));
        }
        self.persist(&config).await?;
        Ok(())
    }

    async fn persist(&self, config: &ConfigFile) -> Result<(), CoreError> {
        self.storage.save(config).await.map_err(|e| {
            tracing::error!("Failed to save config: {}", e);
            CoreError::from(e)
        })
    }
}

//! Secret Store
//!
//! Passwords and key passphrases are kept outside the config file, behind a
//! get/set/delete-by-id capability. `Keychain` backs it with the OS keychain
//! through the `keyring` crate; `MemorySecretStore` keeps secrets in process.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::RwLock;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.hostdeck.ssh";

#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Injected secret storage, keyed by connection id
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for `id`
    fn get(&self, id: &str) -> Result<Option<String>, KeychainError>;
    fn set(&self, id: &str, secret: &str) -> Result<(), KeychainError>;
    /// Deleting a missing entry succeeds
    fn delete(&self, id: &str) -> Result<(), KeychainError>;
}

/// OS keychain adapter
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // Explicit username keeps the keychain identity stable on macOS
    fn entry(&self, id: &str) -> Result<Entry, KeychainError> {
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, id))?)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for Keychain {
    fn get(&self, id: &str) -> Result<Option<String>, KeychainError> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("Keychain get: no entry for id={}", id);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Keychain get failed: id={}, error={:?}", id, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn set(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        tracing::info!("Keychain store: service={}, id={}", self.service, id);
        self.entry(id)?.set_password(secret).map_err(|e| {
            tracing::error!("Keychain store failed: id={}, error={:?}", id, e);
            KeychainError::Keyring(e)
        })
    }

    fn delete(&self, id: &str) -> Result<(), KeychainError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

/// Process-local secret store
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, id: &str) -> Result<Option<String>, KeychainError> {
        Ok(self.secrets.read().get(id).cloned())
    }

    fn set(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        self.secrets.write().insert(id.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), KeychainError> {
        self.secrets.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Needs a real keychain: cargo test keychain -- --ignored
    fn test_keychain_operations() {
        let keychain = Keychain::with_service("com.hostdeck.test");
        let id = format!("test-{}", uuid::Uuid::new_v4());

        keychain.set(&id, "test-secret").unwrap();
        assert_eq!(keychain.get(&id).unwrap().as_deref(), Some("test-secret"));

        keychain.set(&id, "new-secret").unwrap();
        assert_eq!(keychain.get(&id).unwrap().as_deref(), Some("new-secret"));

        keychain.delete(&id).unwrap();
        assert_eq!(keychain.get(&id).unwrap(), None);
        keychain.delete(&id).unwrap();
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("a", "pw").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("pw"));

        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }
}

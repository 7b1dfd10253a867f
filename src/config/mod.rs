//! Configuration Management Module
//!
//! Persistent storage of connection profiles, snippets and settings, plus the
//! secret store capability for credentials.

pub mod keychain;
pub mod registry;
pub mod storage;
pub mod types;

pub use keychain::{Keychain, KeychainError, MemorySecretStore, SecretStore};
pub use registry::ConnectionRegistry;
pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{AuthKind, ConfigFile, ConnectionProfile, CoreSettings, Snippet, CONFIG_VERSION};

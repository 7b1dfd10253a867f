//! Configuration Types
//!
//! Persisted shapes: connection profiles, command snippets and core settings.
//! Secrets never appear here; they live in the `SecretStore` keyed by profile id.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// How a profile authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Password,
    Key,
}

/// A saved remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Stable id, generated once by the registry
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub auth_method: AuthKind,
    /// Private key path, required when `auth_method` is `key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Unit names polled by the metrics collector
    #[serde(default)]
    pub monitored_services: BTreeSet<String>,
}

fn default_port() -> u16 {
    22
}

impl ConnectionProfile {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        auth_method: AuthKind,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: user.into(),
            auth_method,
            key_path: None,
            monitored_services: BTreeSet::new(),
        }
    }
}

/// A named command the UI can paste into a terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub command: String,
}

/// Tunables for the transport, channel and metrics layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Deadline for handshake + authentication
    pub connect_timeout_secs: u64,
    /// Deadline for one SFTP op, exec or metrics tick
    pub operation_timeout_secs: u64,
    /// Consecutive transport-level failures before a transport goes to `error`
    pub failure_threshold: u32,
    pub metrics_interval_secs: u64,
    pub default_cols: u32,
    pub default_rows: u32,
    pub strict_host_key_checking: bool,
    /// Defaults to `~/.ssh/known_hosts`
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            operation_timeout_secs: 10,
            failure_threshold: 3,
            metrics_interval_secs: 3,
            default_cols: 80,
            default_rows: 24,
            strict_host_key_checking: false,
            known_hosts_path: None,
        }
    }
}

/// Root of the persisted config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub connections: Vec<ConnectionProfile>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
    #[serde(default)]
    pub settings: CoreSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connections: Vec::new(),
            snippets: Vec::new(),
            settings: CoreSettings::default(),
        }
    }
}

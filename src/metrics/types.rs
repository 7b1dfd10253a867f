//! Metrics snapshot types

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Ok,
    Error,
}

/// One metrics poll result. Errors are reported inline, never by ending the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub status: SnapshotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MetricsData>,
}

impl MetricsSnapshot {
    pub fn ok(data: MetricsData) -> Self {
        Self {
            status: SnapshotStatus::Ok,
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SnapshotStatus::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SnapshotStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsData {
    /// `uptime -p` text, e.g. "up 3 days, 4 hours"
    pub uptime: String,
    /// Percent, one decimal
    pub cpu: f64,
    pub memory: MemoryUsage,
    pub disk: DiskUsage,
    pub system: SystemInfo,
    pub network: NetworkRate,
    pub services: Vec<ServiceStatus>,
}

/// Megabytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

/// Human-readable `df -h` figures for `/`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub used: String,
    pub total: String,
    /// e.g. "24%"
    pub percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub kernel: String,
    pub arch: String,
    pub cpu: String,
}

/// KB/s across all interfaces except loopback
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetworkRate {
    #[serde(rename = "in")]
    pub rx: f64,
    #[serde(rename = "out")]
    pub tx: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    /// `systemctl is-active` output: active, inactive, failed, ...
    pub status: String,
}

//! Remote host metrics
//!
//! Periodic resource sampling over exec channels, published through the
//! event dispatcher.

mod collector;
pub mod sampler;
pub mod types;

pub use collector::{MetricsCollector, SubscriptionInfo};
pub use types::{
    DiskUsage, MemoryUsage, MetricsData, MetricsSnapshot, NetworkRate, ServiceStatus,
    SnapshotStatus, SystemInfo,
};

//! Metrics commands

use std::time::Duration;

use super::AppState;
use crate::error::CoreError;
use crate::metrics::SubscriptionInfo;

impl AppState {
    /// Start polling with the profile's monitored services.
    ///
    /// Returns false when a subscription is already running.
    pub async fn start_metrics(
        &self,
        connection_id: &str,
        interval: Option<Duration>,
    ) -> Result<bool, CoreError> {
        let profile = self.registry.get_connection(connection_id).await?;
        self.ensure_connected(connection_id).await?;
        self.metrics
            .start(connection_id, interval, profile.monitored_services)
    }

    pub fn stop_metrics(&self, connection_id: &str) -> bool {
        self.metrics.stop(connection_id)
    }

    pub fn metrics_subscription(&self, connection_id: &str) -> Option<SubscriptionInfo> {
        self.metrics.subscription(connection_id)
    }
}

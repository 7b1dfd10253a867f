//! Metrics Collector
//!
//! At most one polling loop per connection. Each tick runs the sampling
//! command on its own exec channel; a tick that comes due while the previous
//! one is still running is skipped, not queued. A subscription lives under a
//! child of the transport's cycle token, so it ends with the transport and
//! is never restarted by a reconnect.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::sampler::{build_command, parse_sample, Counters};
use super::types::MetricsSnapshot;
use crate::error::CoreError;
use crate::events::EventDispatcher;
use crate::mux::ChannelMultiplexer;
use crate::ssh::{ExecOutput, TransportManager, TransportRef};

const MIN_INTERVAL: Duration = Duration::from_millis(500);

struct Subscription {
    interval: Duration,
    services: BTreeSet<String>,
    cancel: CancellationToken,
    in_flight: AtomicBool,
    ticks_completed: AtomicU64,
    ticks_skipped: AtomicU64,
    last_snapshot: Mutex<Option<MetricsSnapshot>>,
    counters: Mutex<Option<(Counters, Instant)>>,
}

/// Point-in-time view of a running subscription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub interval_ms: u64,
    pub services: Vec<String>,
    pub in_flight: bool,
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub last_snapshot: Option<MetricsSnapshot>,
}

pub struct MetricsCollector {
    transports: Arc<TransportManager>,
    mux: Arc<ChannelMultiplexer>,
    dispatcher: Arc<EventDispatcher>,
    subscriptions: DashMap<String, Arc<Subscription>>,
    default_interval: Duration,
}

impl MetricsCollector {
    pub fn new(
        transports: Arc<TransportManager>,
        mux: Arc<ChannelMultiplexer>,
        dispatcher: Arc<EventDispatcher>,
        default_interval: Duration,
    ) -> Self {
        Self {
            transports,
            mux,
            dispatcher,
            subscriptions: DashMap::new(),
            default_interval,
        }
    }

    /// Start polling `connection_id`.
    ///
    /// Returns `Ok(false)` without touching the running loop when one is
    /// already active for this connection.
    pub fn start(
        self: &Arc<Self>,
        connection_id: &str,
        interval: Option<Duration>,
        services: BTreeSet<String>,
    ) -> Result<bool, CoreError> {
        let transport = self.transports.acquire(connection_id)?;
        let interval = interval.unwrap_or(self.default_interval).max(MIN_INTERVAL);

        let subscription = Arc::new(Subscription {
            interval,
            services,
            cancel: transport.cancel_token().child_token(),
            in_flight: AtomicBool::new(false),
            ticks_completed: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            last_snapshot: Mutex::new(None),
            counters: Mutex::new(None),
        });

        match self.subscriptions.entry(connection_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().cancel.is_cancelled() => {
                debug!("Metrics already running for {}", connection_id);
                return Ok(false);
            }
            Entry::Occupied(mut entry) => {
                entry.insert(subscription.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(subscription.clone());
            }
        }

        info!(
            "Starting metrics for {} every {:?} ({} services)",
            connection_id,
            interval,
            subscription.services.len()
        );
        let this = self.clone();
        let id = connection_id.to_string();
        tokio::spawn(async move { this.run(id, subscription, transport).await });
        Ok(true)
    }

    /// Stop polling. Idempotent; returns whether a loop was running.
    ///
    /// A tick in flight is abandoned and emits nothing.
    pub fn stop(&self, connection_id: &str) -> bool {
        match self.subscriptions.remove(connection_id) {
            Some((_, subscription)) => {
                let was_running = !subscription.cancel.is_cancelled();
                subscription.cancel.cancel();
                if was_running {
                    info!("Stopped metrics for {}", connection_id);
                }
                was_running
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn subscription(&self, connection_id: &str) -> Option<SubscriptionInfo> {
        let subscription = self.subscriptions.get(connection_id)?;
        if subscription.cancel.is_cancelled() {
            return None;
        }
        let info = SubscriptionInfo {
            interval_ms: subscription.interval.as_millis() as u64,
            services: subscription.services.iter().cloned().collect(),
            in_flight: subscription.in_flight.load(Ordering::SeqCst),
            ticks_completed: subscription.ticks_completed.load(Ordering::SeqCst),
            ticks_skipped: subscription.ticks_skipped.load(Ordering::SeqCst),
            last_snapshot: subscription.last_snapshot.lock().clone(),
        };
        Some(info)
    }

    async fn run(
        self: Arc<Self>,
        connection_id: String,
        subscription: Arc<Subscription>,
        transport: TransportRef,
    ) {
        let mut ticker = tokio::time::interval(subscription.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = subscription.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if subscription.in_flight.swap(true, Ordering::SeqCst) {
                subscription.ticks_skipped.fetch_add(1, Ordering::SeqCst);
                trace!("Metrics tick for {} skipped, previous still running", connection_id);
                continue;
            }

            let this = self.clone();
            let id = connection_id.clone();
            let sub = subscription.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                this.tick(&id, &sub, &transport).await;
                sub.in_flight.store(false, Ordering::SeqCst);
            });
        }

        self.subscriptions
            .remove_if(&connection_id, |_, s| Arc::ptr_eq(s, &subscription));
        debug!("Metrics loop for {} ended", connection_id);
    }

    async fn tick(&self, connection_id: &str, subscription: &Subscription, transport: &TransportRef) {
        let command = build_command(&subscription.services);
        let result = tokio::select! {
            biased;
            _ = subscription.cancel.cancelled() => return,
            result = self.mux.exec(transport, &command) => result,
        };
        if subscription.cancel.is_cancelled() {
            return;
        }

        let snapshot = match result.and_then(|output| self.sample(subscription, output)) {
            Ok(snapshot) => snapshot,
            Err(CoreError::Cancelled(_)) => return,
            Err(e) => {
                warn!("Metrics sample for {} failed: {}", connection_id, e);
                MetricsSnapshot::error(e.to_string())
            }
        };

        *subscription.last_snapshot.lock() = Some(snapshot.clone());
        subscription.ticks_completed.fetch_add(1, Ordering::SeqCst);
        self.dispatcher.emit_metrics(connection_id, snapshot);
    }

    fn sample(
        &self,
        subscription: &Subscription,
        output: ExecOutput,
    ) -> Result<MetricsSnapshot, CoreError> {
        if !output.success() {
            return Err(CoreError::Protocol(format!(
                "sampling command exited with {:?}: {}",
                output.exit_status,
                output.stderr_text().trim()
            )));
        }

        let now = Instant::now();
        let mut counters = subscription.counters.lock();
        let (prev, elapsed) = match counters.as_ref() {
            Some((prev, at)) => (Some(prev), now.duration_since(*at).as_secs_f64()),
            None => (None, 0.0),
        };
        let (data, next) = parse_sample(
            &output.stdout_text(),
            &subscription.services,
            prev,
            elapsed,
        )?;
        *counters = Some((next, now));
        Ok(MetricsSnapshot::ok(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MetricsUpdate;
    use crate::testing::{connected_manager, FakeConnector};

    const SAMPLE: &str = "===UPTIME===
up 1 hour
===STAT===
cpu  100 0 100 700 100 0 0 0
===MEMINFO===
MemTotal:        2048000 kB
MemAvailable:    1024000 kB
===DISK===
Filesystem      Size  Used Avail Capacity Mounted on
/dev/vda1        20G    5G   15G      25% /
===SERVICES===
nginx=active
===END===";

    async fn collector() -> (
        Arc<FakeConnector>,
        Arc<TransportManager>,
        Arc<EventDispatcher>,
        Arc<MetricsCollector>,
    ) {
        let (connector, transports, mux) = connected_manager("c1").await;
        connector.scripts().set("===STAT===", SAMPLE, 0);
        let dispatcher = Arc::new(EventDispatcher::new());
        let collector = Arc::new(MetricsCollector::new(
            transports.clone(),
            mux,
            dispatcher.clone(),
            Duration::from_secs(3),
        ));
        (connector, transports, dispatcher, collector)
    }

    fn nginx() -> BTreeSet<String> {
        ["nginx".to_string()].into_iter().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_are_skipped_not_queued() {
        let (connector, _transports, _dispatcher, collector) = collector().await;
        connector
            .last_link()
            .set_exec_delay(Some(Duration::from_millis(2500)));

        assert!(collector
            .start("c1", Some(Duration::from_secs(1)), BTreeSet::new())
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5900)).await;

        // Ticks at 0 and 3 run; 1, 2, 4 and 5 find the previous one in flight
        let info = collector.subscription("c1").unwrap();
        assert_eq!(info.ticks_completed, 2);
        assert_eq!(info.ticks_skipped, 4);
        assert_eq!(connector.last_link().exec_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_runs_one_loop() {
        let (connector, _transports, dispatcher, collector) = collector().await;
        let (_, mut rx) = dispatcher.subscribe_metrics(Some("c1"));

        assert!(collector
            .start("c1", Some(Duration::from_secs(1)), nginx())
            .unwrap());
        assert!(!collector
            .start("c1", Some(Duration::from_secs(1)), nginx())
            .unwrap());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(connector.last_link().exec_calls().len(), 3);
        let MetricsUpdate { snapshot, .. } = rx.try_recv().unwrap();
        assert!(snapshot.is_ok());
        let data = snapshot.data.unwrap();
        assert_eq!(data.memory.total, 2000);
        assert_eq!(data.services[0].status, "active");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_in_flight_tick() {
        let (connector, _transports, dispatcher, collector) = collector().await;
        connector
            .last_link()
            .set_exec_delay(Some(Duration::from_secs(2)));
        let (_, mut rx) = dispatcher.subscribe_metrics(None);

        collector
            .start("c1", Some(Duration::from_secs(5)), BTreeSet::new())
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(collector.stop("c1"));
        assert!(!collector.stop("c1"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(rx.try_recv().is_err());
        assert!(collector.subscription("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_reports_error_and_keeps_polling() {
        let (connector, _transports, dispatcher, collector) = collector().await;
        connector.scripts().set("===STAT===", "", 1);
        let (_, mut rx) = dispatcher.subscribe_metrics(Some("c1"));

        collector
            .start("c1", Some(Duration::from_secs(1)), BTreeSet::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let first = rx.try_recv().unwrap().snapshot;
        assert!(!first.is_ok());
        assert!(first.message.is_some());
        assert!(rx.try_recv().is_ok());
        assert!(collector.subscription("c1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_subscription() {
        let (connector, transports, _dispatcher, collector) = collector().await;
        collector
            .start("c1", Some(Duration::from_secs(1)), BTreeSet::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        transports.disconnect("c1").await;
        assert!(collector.subscription("c1").is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.last_link().exec_calls().len(), 1);
        // A cancelled entry does not block a fresh start after reconnect
        transports
            .connect(&crate::testing::password_profile("c1"))
            .await
            .unwrap();
        assert!(collector.start("c1", None, BTreeSet::new()).unwrap());
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let (_connector, _transports, _dispatcher, collector) = collector().await;
        assert!(matches!(
            collector.start("nope", None, BTreeSet::new()),
            Err(CoreError::Channel(_))
        ));
    }
}

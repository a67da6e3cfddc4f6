//! Cluster-manager snapshot collector.
//!
//! Only the elected leader reports cluster-wide metrics: every collection
//! compares the local IP against the cached leader and skips otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::http::{FETCH_TIMEOUT, fetch_body, http_client};
use super::leader::{
    DEFAULT_LEADER_TTL, LeaderCache, LeaderDiscovery, MESOS_PORT, MesosLeaderDiscovery,
};
use super::{Collector, CollectorBase};
use crate::config::{Options, get_as_list};
use crate::metric::{Metric, MetricType};
use crate::util::external_ip;

/// Snapshot keys reported as cumulative counters. Everything else is a gauge.
const CUMULATIVE_COUNTERS: &[&str] = &[
    "master.slave_registrations",
    "master.slave_removals",
    "master.slave_reregistrations",
    "master.slave_shutdowns_scheduled",
    "master.slave_shutdowns_cancelled",
    "master.slave_shutdowns_completed",
    "master.tasks_error",
    "master.tasks_failed",
    "master.tasks_finished",
    "master.tasks_killed",
    "master.tasks_lost",
    "master.invalid_framework_to_executor_messages",
    "master.invalid_status_update_acknowledgements",
    "master.invalid_status_updates",
    "master.dropped_messages",
    "master.messages_authenticate",
    "master.messages_deactivate_framework",
    "master.messages_exited_executor",
    "master.messages_framework_to_executor",
    "master.messages_kill_task",
    "master.messages_launch_tasks",
    "master.messages_reconcile_tasks",
    "master.messages_register_framework",
    "master.messages_register_slave",
    "master.messages_reregister_framework",
    "master.messages_reregister_slave",
    "master.messages_resource_request",
    "master.messages_revive_offers",
    "master.messages_status_udpate",
    "master.messages_status_update_acknowledgement",
    "master.messages_unregister_framework",
    "master.messages_unregister_slave",
    "master.valid_framework_to_executor_messages",
    "master.valid_status_update_acknowledgements",
    "master.valid_status_updates",
];

/// Timeout of leader discovery queries.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MesosStatsCollector {
    base: CollectorBase,
    /// Local IP; `None` leaves the collector inert.
    ip: Option<String>,
    client: reqwest::Client,
    discovery: Arc<dyn LeaderDiscovery>,
    cache: Option<Arc<LeaderCache>>,
    snapshot_port: u16,
}

impl MesosStatsCollector {
    pub fn new(
        base: CollectorBase,
        ip: Option<String>,
        discovery: Arc<dyn LeaderDiscovery>,
    ) -> Self {
        Self {
            base,
            ip,
            client: http_client(FETCH_TIMEOUT),
            discovery,
            cache: None,
            snapshot_port: MESOS_PORT,
        }
    }

    /// Resolves the local IP once; failure is logged here and never again.
    pub(crate) fn boxed(base: CollectorBase) -> Box<dyn Collector> {
        let ip = match external_ip() {
            Ok(ip) => Some(ip.to_string()),
            Err(e) => {
                error!(
                    collector = %base.name(),
                    error = %e,
                    "cannot determine local IP, collector disabled"
                );
                None
            }
        };
        let discovery = Arc::new(MesosLeaderDiscovery::new(DISCOVERY_TIMEOUT));
        Box::new(Self::new(base, ip, discovery))
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.cache.is_some()
    }

    #[cfg(test)]
    fn with_snapshot_port(mut self, port: u16) -> Self {
        self.snapshot_port = port;
        self
    }

    fn snapshot_url(&self, ip: &str) -> String {
        format!("http://{ip}:{}/metrics/snapshot", self.snapshot_port)
    }
}

#[async_trait]
impl Collector for MesosStatsCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        self.base.configure_common(options);

        let nodes = options
            .get("mesosNodes")
            .or_else(|| options.get("candidateNodes"))
            .map(get_as_list)
            .unwrap_or_default();
        if nodes.is_empty() {
            error!(collector = %self.base.name(), "required configuration not found: mesosNodes");
            self.cache = None;
            return;
        }

        let mut cache = LeaderCache::new(self.discovery.clone());
        cache.configure(nodes, DEFAULT_LEADER_TTL);
        self.cache = Some(Arc::new(cache));
    }

    async fn collect(&mut self) {
        let Some(ip) = self.ip.clone() else {
            return;
        };
        let Some(cache) = self.cache.clone() else {
            debug!(collector = %self.base.name(), "no leader cache, configure() probably failed");
            return;
        };

        let leader = cache.get().await;
        if leader != ip {
            debug!(
                collector = %self.base.name(),
                leader = %leader,
                ip = %ip,
                "not the leader; skipping"
            );
            return;
        }

        let client = self.client.clone();
        let url = self.snapshot_url(&ip);
        let channel = self.base.channel().clone();
        let name = self.base.name().to_string();
        tokio::spawn(async move {
            send_snapshot(&name, &client, &url, &channel).await;
        });
    }
}

async fn send_snapshot(
    collector: &str,
    client: &reqwest::Client,
    url: &str,
    channel: &mpsc::Sender<Metric>,
) {
    let raw = match fetch_body(client, url).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(
                collector = %collector,
                error = %e,
                "could not load metrics from cluster manager"
            );
            return;
        }
    };

    let snapshot = match decode_snapshot(&raw) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(
                collector = %collector,
                error = %e,
                payload = %raw,
                "unable to decode snapshot JSON"
            );
            return;
        }
    };

    for (key, value) in snapshot {
        if channel.send(build_metric(&key, value)).await.is_err() {
            warn!(collector = %collector, "metric channel closed during snapshot send");
            return;
        }
    }
}

/// Decodes a flat `name → value` snapshot, turning escaped `\/` separators
/// into dots.
pub(crate) fn decode_snapshot(raw: &str) -> Result<BTreeMap<String, f64>, serde_json::Error> {
    serde_json::from_str(&raw.replace("\\/", "."))
}

pub(crate) fn build_metric(key: &str, value: f64) -> Metric {
    let metric_type = if CUMULATIVE_COUNTERS.contains(&key) {
        MetricType::CumulativeCounter
    } else {
        MetricType::Gauge
    };
    Metric::new(format!("mesos.{key}"))
        .with_value(value)
        .with_type(metric_type)
}

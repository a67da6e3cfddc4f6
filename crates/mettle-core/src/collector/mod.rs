//! Collectors: units of metric ingestion.
//!
//! Every collector owns the sending side of a metric channel and is driven by
//! [`run`]: poll-type collectors are collected once per interval, listener-type
//! collectors are started once and produce metrics as events arrive.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        new_collector(name)                   │
//! │                               │                              │
//! │        ┌──────────────┬───────┴───────┬──────────────┐       │
//! │  ┌─────▼─────┐ ┌──────▼──────┐ ┌──────▼──────┐ ┌─────▼─────┐ │
//! │  │MesosStats │ │ Dropwizard  │ │ DockerStats │ │ Listener  │ │
//! │  │LeaderCache│ │ tree parser │ │  Container  │ │ TCP lines │ │
//! │  └─────┬─────┘ └──────┬──────┘ │  Runtime    │ └─────┬─────┘ │
//! │        │              │        └──────┬──────┘       │       │
//! │        └──────────────┴──────┬────────┴──────────────┘       │
//! │                       CollectorBase::send                    │
//! └──────────────────────────────┼───────────────────────────────┘
//!                                ▼
//!                     mpsc::Receiver<Metric>  →  Dispatcher
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mettle_core::collector;
//!
//! let (mut c, rx) = collector::new_collector("Test").unwrap();
//! c.configure(&options);
//! tokio::spawn(collector::run(c));
//! ```

mod agent_status;
#[cfg(feature = "docker")]
mod bollard_runtime;
pub mod docker;
mod dropwizard;
pub mod http;
pub mod leader;
mod listener;
mod mesos;
mod test_collector;
pub mod tree;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{Options, get_as_int};
use crate::metric::Metric;

pub use agent_status::AgentStatusCollector;
pub use docker::{ContainerRuntime, DockerStatsCollector};
pub use dropwizard::DropwizardCollector;
pub use http::FetchError;
pub use leader::{LeaderCache, LeaderDiscovery, LeaderError, MesosLeaderDiscovery};
pub use listener::JsonListenerCollector;
pub use mesos::MesosStatsCollector;
pub use test_collector::TestCollector;
pub use tree::{TreeParseError, parse_metric_tree};

/// Interval used unless a collector's options override it.
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of every collector's output channel.
pub const CHANNEL_CAPACITY: usize = 1024;

/// How a collector is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorKind {
    /// Polled once per interval.
    Collector,
    /// Started once; produces metrics when events arrive.
    Listener,
}

impl CollectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::Collector => "collector",
            CollectorKind::Listener => "listener",
        }
    }
}

/// State shared by every collector: name, schedule and output channel.
#[derive(Debug)]
pub struct CollectorBase {
    name: String,
    channel: mpsc::Sender<Metric>,
    interval: Duration,
    kind: CollectorKind,
}

impl CollectorBase {
    pub fn new(name: impl Into<String>, channel: mpsc::Sender<Metric>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            channel,
            interval,
            kind: CollectorKind::Collector,
        }
    }

    /// Applies options every collector understands (`interval`, in seconds).
    pub fn configure_common(&mut self, options: &Options) {
        if let Some(interval) = options.get("interval") {
            let secs = get_as_int(interval, 0);
            if secs > 0 {
                self.interval = Duration::from_secs(secs as u64);
            } else {
                warn!(collector = %self.name, "ignoring invalid interval {}", interval);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &mpsc::Sender<Metric> {
        &self.channel
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn kind(&self) -> CollectorKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: CollectorKind) {
        self.kind = kind;
    }

    /// Sends one metric downstream. Returns `false` if the pipeline is gone.
    pub async fn send(&self, metric: Metric) -> bool {
        if self.channel.send(metric).await.is_err() {
            debug!(collector = %self.name, "metric channel closed");
            return false;
        }
        true
    }

    /// Sends a batch in order, stopping early if the pipeline is gone.
    pub async fn send_all(&self, metrics: impl IntoIterator<Item = Metric>) -> usize {
        let mut sent = 0;
        for metric in metrics {
            if !self.send(metric).await {
                break;
            }
            sent += 1;
        }
        sent
    }
}

/// A unit of metric ingestion.
#[async_trait]
pub trait Collector: Send {
    fn base(&self) -> &CollectorBase;

    fn base_mut(&mut self) -> &mut CollectorBase;

    /// Applies collector options. Missing required options are logged and
    /// leave the collector inert.
    fn configure(&mut self, options: &Options);

    /// Performs one collection (poll type) or runs the listener (listener type).
    async fn collect(&mut self);

    fn name(&self) -> &str {
        self.base().name()
    }

    fn interval(&self) -> Duration {
        self.base().interval()
    }

    fn kind(&self) -> CollectorKind {
        self.base().kind()
    }

    fn channel(&self) -> mpsc::Sender<Metric> {
        self.base().channel().clone()
    }
}

type Constructor = fn(CollectorBase) -> Box<dyn Collector>;

/// Collector name → constructor. Adding a collector means adding a line here.
const REGISTRY: &[(&str, Constructor)] = &[
    ("Test", TestCollector::boxed),
    ("MesosStats", MesosStatsCollector::boxed),
    ("AgentStatus", AgentStatusCollector::boxed),
    ("Dropwizard", DropwizardCollector::boxed),
    #[cfg(feature = "docker")]
    ("DockerStats", DockerStatsCollector::boxed_with_docker),
    ("JsonListener", JsonListenerCollector::boxed),
];

/// Names accepted by [`new_collector`].
pub fn registered_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

/// Creates a collector by name, together with the receiving side of its
/// output channel. Returns `None` for unknown names.
pub fn new_collector(name: &str) -> Option<(Box<dyn Collector>, mpsc::Receiver<Metric>)> {
    let Some((_, constructor)) = REGISTRY.iter().find(|(n, _)| *n == name) else {
        error!(collector = %name, "cannot create collector: unknown name");
        return None;
    };
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let base = CollectorBase::new(name, tx, DEFAULT_COLLECTION_INTERVAL);
    Some((constructor(base), rx))
}

/// Drives a collector until the process exits.
pub async fn run(mut collector: Box<dyn Collector>) {
    if collector.kind() == CollectorKind::Listener {
        info!(collector = %collector.name(), "starting listener");
        collector.collect().await;
        warn!(collector = %collector.name(), "listener stopped");
        return;
    }

    let interval = collector.interval().max(Duration::from_secs(1));
    info!(
        collector = %collector.name(),
        interval_secs = interval.as_secs(),
        "starting collector"
    );

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if collector.base().channel().is_closed() {
            debug!(collector = %collector.name(), "channel closed, stopping");
            return;
        }

        let t0 = Instant::now();
        collector.collect().await;
        let elapsed = t0.elapsed();

        debug!(
            collector = %collector.name(),
            duration_ms = elapsed.as_millis() as u64,
            "collection completed"
        );
        if elapsed > interval / 2 {
            warn!(
                collector = %collector.name(),
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "collection exceeded 50% of interval"
            );
        }
    }
}

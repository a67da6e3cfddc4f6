//! Agent self-statistics and the status document built from them.
//!
//! Handlers and collectors update lock-free counters on their hot paths; the
//! status server snapshots them into a [`StatusReport`] on request. The same
//! document is what the `AgentStatus` collector reads back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A named set of counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    #[serde(default)]
    pub counters: BTreeMap<String, f64>,
    #[serde(default)]
    pub gauges: BTreeMap<String, f64>,
}

impl MetricGroup {
    pub fn counter(mut self, name: &str, value: f64) -> Self {
        self.counters.insert(name.to_string(), value);
        self
    }

    pub fn gauge(mut self, name: &str, value: f64) -> Self {
        self.gauges.insert(name.to_string(), value);
        self
    }
}

/// The status document served by the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub memory: MetricGroup,
    #[serde(default)]
    pub handlers: BTreeMap<String, MetricGroup>,
    #[serde(default)]
    pub collectors: BTreeMap<String, MetricGroup>,
}

/// Emission statistics of one handler.
#[derive(Debug, Default)]
pub struct HandlerStats {
    emissions: AtomicU64,
    metrics: AtomicU64,
    failures: AtomicU64,
    last_batch: AtomicU64,
    last_duration_ms: AtomicU64,
    interval_secs: AtomicU64,
}

impl HandlerStats {
    /// Records one finished emit step.
    pub fn record_emission(&self, batch: usize, elapsed: Duration, ok: bool) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
        self.metrics.fetch_add(batch as u64, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.last_batch.store(batch as u64, Ordering::Relaxed);
        self.last_duration_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_secs
            .store(interval.as_secs(), Ordering::Relaxed);
    }

    pub fn emissions(&self) -> u64 {
        self.emissions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricGroup {
        MetricGroup::default()
            .counter("totalEmissions", self.emissions() as f64)
            .counter("totalMetrics", self.metrics.load(Ordering::Relaxed) as f64)
            .counter("failedEmissions", self.failures() as f64)
            .gauge("lastBatchSize", self.last_batch.load(Ordering::Relaxed) as f64)
            .gauge(
                "emissionTimeMs",
                self.last_duration_ms.load(Ordering::Relaxed) as f64,
            )
            .gauge("intervalLength", self.interval_secs.load(Ordering::Relaxed) as f64)
    }
}

/// Collection statistics of one collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    metrics: AtomicU64,
}

impl CollectorStats {
    pub fn record(&self) {
        self.metrics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> u64 {
        self.metrics.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricGroup {
        MetricGroup::default().counter("metricsCollected", self.metrics() as f64)
    }
}

/// Registry of every running component's statistics.
#[derive(Debug, Default)]
pub struct AgentStats {
    handlers: RwLock<BTreeMap<String, Arc<HandlerStats>>>,
    collectors: RwLock<BTreeMap<String, Arc<CollectorStats>>>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, name: &str, stats: Arc<HandlerStats>) {
        self.handlers.write().insert(name.to_string(), stats);
    }

    /// Registers a collector and returns its (possibly shared) counters.
    pub fn add_collector(&self, name: &str) -> Arc<CollectorStats> {
        self.collectors
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Snapshots every registered component. `memory` is supplied by the
    /// caller, which knows the allocator in use.
    pub fn report(&self, memory: MetricGroup) -> StatusReport {
        let handlers = self
            .handlers
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let collectors = self
            .collectors
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        StatusReport {
            memory,
            handlers,
            collectors,
        }
    }
}

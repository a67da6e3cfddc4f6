//! Per-container resource statistics.
//!
//! The container runtime is reached through the [`ContainerRuntime`] trait;
//! the production implementation talks to the Docker API, tests use an
//! in-memory runtime.
//!
//! Emitted per container:
//! - `DockerRxBytes` / `DockerTxBytes`: cumulative counters per interface (`iface`)
//! - `DockerMemoryUsed` / `DockerMemoryLimit`: gauges
//! - `DockerCpuPercentage`: gauge, derived from the previous CPU sample
//! - `DockerContainerCount`: counter of 1, carrying only generated dimensions

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{Collector, CollectorBase};
use crate::config::Options;
use crate::metric::{Dimensions, Metric, MetricType};

/// Upper bound on one container's inspect + stats round trip.
const STATS_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for container runtime access.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container {id}: {message}")]
    Container { id: String, message: String },
    #[error("container {0}: stats request timed out")]
    Timeout(String),
}

/// Identity and environment of a running container.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// `KEY=value` entries.
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One stats snapshot of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    /// Cumulative CPU time consumed by the container.
    pub total_usage: u64,
    /// Cumulative CPU time of the host.
    pub system_usage: u64,
    pub num_cpus: u64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub networks: BTreeMap<String, InterfaceStats>,
}

/// CPU counters remembered between collections.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuSample {
    pub total_usage: u64,
    pub system_usage: u64,
}

impl From<&ContainerStats> for CpuSample {
    fn from(stats: &ContainerStats) -> Self {
        Self {
            total_usage: stats.total_usage,
            system_usage: stats.system_usage,
        }
    }
}

/// Access to the running containers of the local host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// IDs of the running containers.
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;
}

/// CPU usage in percent of one CPU between two samples.
///
/// Returns 0 unless both the container and the system counters advanced.
pub fn calculate_cpu_percent(previous: CpuSample, stats: &ContainerStats) -> f64 {
    let cpu_delta = stats.total_usage as f64 - previous.total_usage as f64;
    let system_delta = stats.system_usage as f64 - previous.system_usage as f64;
    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * stats.num_cpus as f64 * 100.0
    } else {
        0.0
    }
}

/// Dimension derived from a container environment variable.
#[derive(Debug, Clone)]
struct GeneratedDimension {
    dimension: String,
    env_var: String,
    pattern: Regex,
}

impl GeneratedDimension {
    /// First capture group if the pattern has one, the whole match otherwise.
    fn extract(&self, value: &str) -> Option<String> {
        let caps = self.pattern.captures(value)?;
        let m = caps.get(1).or_else(|| caps.get(0))?;
        Some(m.as_str().replace("--", "_"))
    }
}

fn parse_generated_dimensions(collector: &str, value: &Value) -> Vec<GeneratedDimension> {
    let Some(dims) = value.as_object() else {
        warn!(collector = %collector, "generatedDimensions must be an object");
        return Vec::new();
    };

    let mut generated = Vec::new();
    for (dimension, rules) in dims {
        let Some(rules) = rules.as_object() else {
            warn!(
                collector = %collector,
                dimension = %dimension,
                "ignoring malformed generated dimension"
            );
            continue;
        };
        for (env_var, pattern) in rules {
            let Some(pattern) = pattern.as_str() else {
                continue;
            };
            match Regex::new(pattern) {
                Ok(pattern) => generated.push(GeneratedDimension {
                    dimension: dimension.clone(),
                    env_var: env_var.clone(),
                    pattern,
                }),
                Err(e) => {
                    warn!(
                        collector = %collector,
                        dimension = %dimension,
                        error = %e,
                        "invalid pattern"
                    );
                }
            }
        }
    }
    generated
}

pub struct DockerStatsCollector {
    base: CollectorBase,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    generated: Vec<GeneratedDimension>,
    previous: HashMap<String, CpuSample>,
}

impl DockerStatsCollector {
    pub fn new(base: CollectorBase, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            base,
            runtime,
            generated: Vec::new(),
            previous: HashMap::new(),
        }
    }

    /// Connects to the local Docker daemon. A failed connection is logged
    /// once and leaves the collector inert.
    #[cfg(feature = "docker")]
    pub(crate) fn boxed_with_docker(base: CollectorBase) -> Box<dyn Collector> {
        let runtime: Option<Arc<dyn ContainerRuntime>> =
            match super::bollard_runtime::BollardRuntime::connect() {
                Ok(runtime) => Some(Arc::new(runtime)),
                Err(e) => {
                    error!(
                        collector = %base.name(),
                        error = %e,
                        "cannot connect to container runtime"
                    );
                    None
                }
            };
        Box::new(Self::new(base, runtime))
    }

    /// Number of containers with a remembered CPU sample.
    pub fn tracked_containers(&self) -> usize {
        self.previous.len()
    }

    fn generated_dimensions(&self, env: &[String]) -> Dimensions {
        let mut dims = Dimensions::new();
        for var in env {
            let Some((key, value)) = var.split_once('=') else {
                continue;
            };
            for generated in self.generated.iter().filter(|g| g.env_var == key) {
                if let Some(v) = generated.extract(value) {
                    dims.insert(generated.dimension.clone(), v);
                }
            }
        }
        dims
    }

    fn build_metrics(
        &self,
        info: &ContainerInfo,
        stats: &ContainerStats,
        cpu_percent: f64,
    ) -> Vec<Metric> {
        let generated = self.generated_dimensions(&info.env);
        let mut dims = generated.clone();
        dims.insert("container_id".to_string(), info.id.clone());
        dims.insert("container_name".to_string(), info.name.clone());

        let metric = |name: &str, metric_type: MetricType, value: f64, dims: &Dimensions| {
            let mut m = Metric::new(name).with_type(metric_type).with_value(value);
            m.add_dimensions(dims);
            m
        };

        let mut results = Vec::with_capacity(4 + 2 * stats.networks.len());
        for (iface, net) in &stats.networks {
            let mut net_dims = dims.clone();
            net_dims.insert("iface".to_string(), iface.clone());
            results.push(metric(
                "DockerRxBytes",
                MetricType::CumulativeCounter,
                net.rx_bytes as f64,
                &net_dims,
            ));
            results.push(metric(
                "DockerTxBytes",
                MetricType::CumulativeCounter,
                net.tx_bytes as f64,
                &net_dims,
            ));
        }
        let memory_used = stats.memory_usage as f64;
        let memory_limit = stats.memory_limit as f64;
        results.push(metric("DockerMemoryUsed", MetricType::Gauge, memory_used, &dims));
        results.push(metric("DockerMemoryLimit", MetricType::Gauge, memory_limit, &dims));
        results.push(metric("DockerCpuPercentage", MetricType::Gauge, cpu_percent, &dims));
        results.push(metric("DockerContainerCount", MetricType::Counter, 1.0, &generated));
        results
    }
}

async fn fetch_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
) -> Result<(ContainerInfo, ContainerStats), RuntimeError> {
    let fetch = async {
        let info = runtime.inspect(id).await?;
        let stats = runtime.stats(id).await?;
        Ok((info, stats))
    };
    tokio::time::timeout(STATS_TIMEOUT, fetch)
        .await
        .map_err(|_| RuntimeError::Timeout(id.to_string()))?
}

#[async_trait]
impl Collector for DockerStatsCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        if let Some(value) = options.get("generatedDimensions") {
            self.generated = parse_generated_dimensions(self.base.name(), value);
        }
        self.base.configure_common(options);
    }

    async fn collect(&mut self) {
        let Some(runtime) = self.runtime.clone() else {
            return;
        };

        let ids = match runtime.list_containers().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(collector = %self.base.name(), error = %e, "cannot list containers");
                return;
            }
        };

        let results = join_all(ids.iter().map(|id| fetch_container(runtime.as_ref(), id))).await;

        let mut metrics = Vec::new();
        for result in results {
            let (info, stats) = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(collector = %self.base.name(), error = %e, "skipping container");
                    continue;
                }
            };
            let previous = self.previous.get(&info.id).copied().unwrap_or_default();
            let cpu_percent = calculate_cpu_percent(previous, &stats);
            self.previous.insert(info.id.clone(), CpuSample::from(&stats));
            metrics.extend(self.build_metrics(&info, &stats, cpu_percent));
        }

        let before = self.previous.len();
        self.previous.retain(|id, _| ids.contains(id));
        if self.previous.len() != before {
            debug!(
                collector = %self.base.name(),
                pruned = before - self.previous.len(),
                "forgot CPU samples of stopped containers"
            );
        }

        self.base.send_all(metrics).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DEFAULT_COLLECTION_INTERVAL;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-memory runtime: containers can be added and removed between collections.
    #[derive(Default)]
    struct MockRuntime {
        containers: Mutex<BTreeMap<String, (ContainerInfo, ContainerStats)>>,
    }

    impl MockRuntime {
        fn put(&self, info: ContainerInfo, stats: ContainerStats) {
            self.containers.lock().insert(info.id.clone(), (info, stats));
        }

        fn remove(&self, id: &str) {
            self.containers.lock().remove(id);
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
            Ok(self.containers.lock().keys().cloned().collect())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
            self.containers
                .lock()
                .get(id)
                .map(|(info, _)| info.clone())
                .ok_or_else(|| RuntimeError::Container {
                    id: id.to_string(),
                    message: "no such container".into(),
                })
        }

        async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
            self.containers
                .lock()
                .get(id)
                .map(|(_, stats)| stats.clone())
                .ok_or_else(|| RuntimeError::Container {
                    id: id.to_string(),
                    message: "no such container".into(),
                })
        }
    }

    fn collector(
        runtime: Option<Arc<dyn ContainerRuntime>>,
    ) -> (DockerStatsCollector, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(64);
        let base = CollectorBase::new("DockerStats", tx, DEFAULT_COLLECTION_INTERVAL);
        (DockerStatsCollector::new(base, runtime), rx)
    }

    fn container(id: &str, env: &[&str]) -> ContainerInfo {
        ContainerInfo {
            id: id.to_string(),
            name: format!("{id}-name"),
            env: env.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn dims(pairs: &[(&str, &str)]) -> Dimensions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn find<'a>(metrics: &'a [Metric], name: &str) -> &'a Metric {
        metrics
            .iter()
            .find(|m| m.name == name)
            .unwrap_or_else(|| panic!("{name} not found"))
    }

    #[test]
    fn test_calculate_cpu_percent() {
        let mut stats = ContainerStats {
            total_usage: 1_261_158_030_354,
            system_usage: 108_086_414_700_000_000,
            num_cpus: 24,
            ..Default::default()
        };
        let pct = calculate_cpu_percent(CpuSample::default(), &stats);
        assert!((pct - 0.02800332753427522).abs() < 1e-12, "got {pct}");

        let previous = CpuSample::from(&stats);
        stats.total_usage = 1_261_164_064_229;
        stats.system_usage = 108_086_652_820_000_000;
        let pct = calculate_cpu_percent(previous, &stats);
        assert!((pct - 0.060815135225936505).abs() < 1e-12, "got {pct}");
    }

    #[test]
    fn test_calculate_cpu_percent_zero_delta() {
        let stats = ContainerStats {
            total_usage: 10,
            system_usage: 100,
            num_cpus: 4,
            ..Default::default()
        };
        let same = CpuSample::from(&stats);
        assert_eq!(calculate_cpu_percent(same, &stats), 0.0);
    }

    #[test]
    fn test_build_metrics_with_generated_dimensions() {
        let (mut c, _rx) = collector(None);
        c.configure(
            json!({"generatedDimensions": {
                "service_name": {"MESOS_TASK_ID": "[^\\.]*"},
                "instance_name": {"MESOS_TASK_ID": "\\.([^\\.]*)\\."}
            }})
            .as_object()
            .unwrap(),
        );

        let info = ContainerInfo {
            id: "test-id".into(),
            name: "test-container".into(),
            env: vec!["MESOS_TASK_ID=my--service.main.blablagit6bdsadnoise".into()],
        };
        let mut stats = ContainerStats {
            memory_usage: 50,
            memory_limit: 70,
            ..Default::default()
        };
        stats.networks.insert(
            "eth0".into(),
            InterfaceStats {
                rx_bytes: 10,
                tx_bytes: 20,
            },
        );

        let metrics = c.build_metrics(&info, &stats, 0.5);
        assert_eq!(metrics.len(), 6);

        let base = dims(&[
            ("container_id", "test-id"),
            ("container_name", "test-container"),
            ("service_name", "my_service"),
            ("instance_name", "main"),
        ]);
        let mut net = base.clone();
        net.insert("iface".into(), "eth0".into());

        let rx = find(&metrics, "DockerRxBytes");
        assert_eq!(rx.metric_type, MetricType::CumulativeCounter);
        assert_eq!(rx.value, 10.0);
        assert_eq!(rx.dimensions, net);
        assert_eq!(find(&metrics, "DockerTxBytes").value, 20.0);

        let used = find(&metrics, "DockerMemoryUsed");
        assert_eq!(used.value, 50.0);
        assert_eq!(used.dimensions, base);
        assert_eq!(find(&metrics, "DockerMemoryLimit").value, 70.0);
        assert_eq!(find(&metrics, "DockerCpuPercentage").value, 0.5);

        let count = find(&metrics, "DockerContainerCount");
        assert_eq!(count.metric_type, MetricType::Counter);
        assert_eq!(count.value, 1.0);
        assert_eq!(
            count.dimensions,
            dims(&[("service_name", "my_service"), ("instance_name", "main")])
        );
    }

    #[test]
    fn test_generated_dimension_whole_match() {
        let (mut c, _rx) = collector(None);
        c.configure(
            json!({"generatedDimensions": {"service_name": {"SERVICE_NAME": ".*"}}})
                .as_object()
                .unwrap(),
        );
        let got = c.generated_dimensions(&["SERVICE_NAME=my_service".into(), "OTHER=x".into()]);
        assert_eq!(got, dims(&[("service_name", "my_service")]));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let (mut c, _rx) = collector(None);
        c.configure(
            json!({"generatedDimensions": {"a": {"X": "("}, "b": {"Y": ".+"}}})
                .as_object()
                .unwrap(),
        );
        assert_eq!(c.generated.len(), 1);
        assert_eq!(c.generated[0].dimension, "b");
    }

    #[tokio::test]
    async fn test_collect_tracks_and_prunes_cpu_samples() {
        let runtime = Arc::new(MockRuntime::default());
        let stats = ContainerStats {
            total_usage: 100,
            system_usage: 1000,
            num_cpus: 2,
            ..Default::default()
        };
        runtime.put(container("a", &[]), stats.clone());
        runtime.put(container("b", &[]), stats);

        let (mut c, mut rx) = collector(Some(runtime.clone()));
        c.configure(&Options::new());

        c.collect().await;
        assert_eq!(c.tracked_containers(), 2);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2 * 4);

        runtime.remove("b");
        c.collect().await;
        assert_eq!(c.tracked_containers(), 1);
    }

    #[tokio::test]
    async fn test_collect_uses_previous_sample() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.put(
            container("a", &[]),
            ContainerStats {
                total_usage: 100,
                system_usage: 1000,
                num_cpus: 1,
                ..Default::default()
            },
        );
        let (mut c, mut rx) = collector(Some(runtime.clone()));
        c.collect().await;
        while rx.try_recv().is_ok() {}

        runtime.put(
            container("a", &[]),
            ContainerStats {
                total_usage: 150,
                system_usage: 1100,
                num_cpus: 1,
                ..Default::default()
            },
        );
        c.collect().await;

        let mut cpu = None;
        while let Ok(m) = rx.try_recv() {
            if m.name == "DockerCpuPercentage" {
                cpu = Some(m.value);
            }
        }
        assert_eq!(cpu, Some(50.0));
    }

    #[tokio::test]
    async fn test_collect_without_runtime_is_inert() {
        let (mut c, mut rx) = collector(None);
        c.collect().await;
        assert!(rx.try_recv().is_err());
    }
}

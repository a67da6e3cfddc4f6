//! Collector reading the agent's own status document back as metrics.

use async_trait::async_trait;
use tracing::error;

use super::http::{FETCH_TIMEOUT, fetch_body, http_client};
use super::{Collector, CollectorBase};
use crate::config::{DEFAULT_STATUS_PATH, DEFAULT_STATUS_PORT, Options, get_as_string};
use crate::metric::{Metric, MetricType};
use crate::status::{MetricGroup, StatusReport};

pub struct AgentStatusCollector {
    base: CollectorBase,
    endpoint: String,
    client: reqwest::Client,
}

impl AgentStatusCollector {
    pub fn new(base: CollectorBase) -> Self {
        Self {
            base,
            endpoint: format!("http://localhost:{DEFAULT_STATUS_PORT}{DEFAULT_STATUS_PATH}"),
            client: http_client(FETCH_TIMEOUT),
        }
    }

    pub(crate) fn boxed(base: CollectorBase) -> Box<dyn Collector> {
        Box::new(Self::new(base))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Collector for AgentStatusCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        if let Some(endpoint) = options.get("endpoint").and_then(get_as_string) {
            self.endpoint = endpoint;
        }
        self.base.configure_common(options);
    }

    async fn collect(&mut self) {
        let raw = match fetch_body(&self.client, &self.endpoint).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(collector = %self.base.name(), error = %e, "status fetch failed");
                return;
            }
        };
        match parse_status(&raw) {
            Ok(metrics) => {
                self.base.send_all(metrics).await;
            }
            Err(e) => {
                error!(
                    collector = %self.base.name(),
                    error = %e,
                    payload = %raw,
                    "failed to parse status document"
                );
            }
        }
    }
}

/// Converts a status document into metrics. Counters become cumulative
/// counters; handler and collector entries are tagged with their name.
pub(crate) fn parse_status(raw: &str) -> Result<Vec<Metric>, serde_json::Error> {
    let report: StatusReport = serde_json::from_str(raw)?;

    let mut results = group_metrics(&report.memory, None);
    for (name, group) in &report.handlers {
        results.extend(group_metrics(group, Some(("handler", name))));
    }
    for (name, group) in &report.collectors {
        results.extend(group_metrics(group, Some(("collector", name))));
    }
    Ok(results)
}

fn group_metrics(group: &MetricGroup, tag: Option<(&str, &str)>) -> Vec<Metric> {
    let counters = group
        .counters
        .iter()
        .map(|(k, v)| (k, *v, MetricType::CumulativeCounter));
    let gauges = group.gauges.iter().map(|(k, v)| (k, *v, MetricType::Gauge));

    counters
        .chain(gauges)
        .map(|(name, value, metric_type)| {
            let mut m = Metric::new(name.as_str())
                .with_value(value)
                .with_type(metric_type);
            if let Some((key, owner)) = tag {
                m.add_dimension(key, owner);
            }
            m
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DEFAULT_COLLECTION_INTERVAL;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const STATUS: &str = r#"{
        "memory": {"counters": {"NumGC": 3}, "gauges": {"allocated": 2048}},
        "handlers": {"Buffered": {"counters": {"totalEmissions": 7}, "gauges": {}}},
        "collectors": {"Test": {"counters": {}, "gauges": {"queued": 1.5}}}
    }"#;

    #[test]
    fn test_parse_status_types_and_dimensions() {
        let metrics = parse_status(STATUS).unwrap();
        assert_eq!(metrics.len(), 4);

        let find = |name: &str| metrics.iter().find(|m| m.name == name).unwrap();

        let gc = find("NumGC");
        assert_eq!(gc.metric_type, MetricType::CumulativeCounter);
        assert!(gc.dimensions.is_empty());

        assert_eq!(find("allocated").metric_type, MetricType::Gauge);

        let emissions = find("totalEmissions");
        assert_eq!(emissions.dimension("handler"), Some("Buffered"));
        assert_eq!(emissions.value, 7.0);

        let queued = find("queued");
        assert_eq!(queued.dimension("collector"), Some("Test"));
        assert_eq!(queued.metric_type, MetricType::Gauge);
    }

    #[test]
    fn test_parse_status_rejects_garbage() {
        assert!(parse_status("<html>").is_err());
    }

    #[tokio::test]
    async fn test_collect_from_endpoint() {
        let app = Router::new().route("/metrics", get(|| async { STATUS }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (tx, mut rx) = mpsc::channel(16);
        let mut c = AgentStatusCollector::new(CollectorBase::new(
            "AgentStatus",
            tx,
            DEFAULT_COLLECTION_INTERVAL,
        ));
        assert_eq!(c.endpoint(), "http://localhost:9090/metrics");
        c.configure(
            json!({"endpoint": format!("http://{addr}/metrics")})
                .as_object()
                .unwrap(),
        );

        c.collect().await;

        let mut names = Vec::new();
        for _ in 0..4 {
            let m = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            names.push(m.name);
        }
        names.sort();
        assert_eq!(names, vec!["NumGC", "allocated", "queued", "totalEmissions"]);
    }
}

//! Collector flattening a dropwizard-style metric tree fetched over HTTP.

use async_trait::async_trait;
use tracing::error;

use super::http::{FETCH_TIMEOUT, fetch_body, http_client};
use super::tree::parse_metric_tree;
use super::{Collector, CollectorBase};
use crate::config::{Options, get_as_map, get_as_string};
use crate::metric::Dimensions;

pub struct DropwizardCollector {
    base: CollectorBase,
    endpoint: Option<String>,
    dimensions: Dimensions,
    client: reqwest::Client,
}

impl DropwizardCollector {
    pub fn new(base: CollectorBase) -> Self {
        Self {
            base,
            endpoint: None,
            dimensions: Dimensions::new(),
            client: http_client(FETCH_TIMEOUT),
        }
    }

    pub(crate) fn boxed(base: CollectorBase) -> Box<dyn Collector> {
        Box::new(Self::new(base))
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

#[async_trait]
impl Collector for DropwizardCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        self.endpoint = options.get("endpoint").and_then(get_as_string);
        if self.endpoint.is_none() {
            error!(collector = %self.base.name(), "required configuration not found: endpoint");
        }
        if let Some(dims) = options.get("dimensions") {
            self.dimensions = get_as_map(dims);
        }
        self.base.configure_common(options);
    }

    async fn collect(&mut self) {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return;
        };

        let raw = match fetch_body(&self.client, endpoint).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(collector = %self.base.name(), error = %e, "metric tree fetch failed");
                return;
            }
        };

        let mut metrics = match parse_metric_tree(raw.as_bytes()) {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(
                    collector = %self.base.name(),
                    error = %e,
                    payload = %raw,
                    "failed to parse metric tree"
                );
                return;
            }
        };

        for m in &mut metrics {
            m.add_dimensions(&self.dimensions);
        }
        self.base.send_all(metrics).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::DEFAULT_COLLECTION_INTERVAL;
    use crate::collector::tree::ROLLUP_DIMENSION;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn serve(body: &'static str) -> String {
        let app = Router::new().route("/metrics", get(move || async move { body }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/metrics")
    }

    fn collector() -> (DropwizardCollector, mpsc::Receiver<crate::Metric>) {
        let (tx, rx) = mpsc::channel(16);
        let base = CollectorBase::new("Dropwizard", tx, DEFAULT_COLLECTION_INTERVAL);
        (DropwizardCollector::new(base), rx)
    }

    #[tokio::test]
    async fn test_collect_flattens_and_tags() {
        let url = serve(r#"{"jvm": {"heap": {"type": "gauge", "value": 12}}}"#).await;
        let (mut c, mut rx) = collector();
        c.configure(
            json!({"endpoint": url, "dimensions": {"service": "api"}})
                .as_object()
                .unwrap(),
        );

        c.collect().await;

        let m = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.name, "jvm.heap");
        assert_eq!(m.value, 12.0);
        assert_eq!(m.dimension("service"), Some("api"));
        assert_eq!(m.dimension(ROLLUP_DIMENSION), Some("value"));
    }

    #[tokio::test]
    async fn test_malformed_payload_emits_nothing() {
        let url = serve("{broken").await;
        let (mut c, mut rx) = collector();
        c.configure(json!({"endpoint": url}).as_object().unwrap());

        c.collect().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_inert() {
        let (mut c, mut rx) = collector();
        c.configure(json!({"interval": 30}).as_object().unwrap());
        assert!(c.endpoint().is_none());
        assert_eq!(c.base().interval(), Duration::from_secs(30));

        c.collect().await;
        assert!(rx.try_recv().is_err());
    }
}

//! Wiring of the whole pipeline from an [`AgentConfig`].
//!
//! ```text
//! collector ─▶ forward (stamp `collector`, count) ─┐
//! collector ─▶ forward ────────────────────────────┼─▶ Dispatcher ─▶ handler channels
//! listener  ─▶ forward ────────────────────────────┘
//! ```
//!
//! Every component runs as its own tokio task. Unknown component names are
//! logged and skipped; the pipeline starts as long as something is left to run.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collector::{self, CHANNEL_CAPACITY};
use crate::config::{AgentConfig, ConfigError};
use crate::dispatch::{COLLECTOR_DIMENSION, Dispatcher, HandlerLink};
use crate::handler;
use crate::metric::Metric;
use crate::status::{AgentStats, CollectorStats};

/// Error type for agent startup.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("configuration names no known collector or handler")]
    NothingToRun,
}

/// A running pipeline.
pub struct Agent {
    stats: Arc<AgentStats>,
    handlers: Vec<String>,
    collectors: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Builds and spawns handlers, the dispatcher and collectors.
    pub async fn start(config: &AgentConfig) -> Result<Self, AgentError> {
        let stats = Arc::new(AgentStats::new());
        let mut tasks = Vec::new();

        info!("starting handlers");
        let mut links = Vec::new();
        let mut handlers = Vec::new();
        for (name, options) in &config.handlers {
            let Some(mut h) = handler::new_handler(name) else {
                continue;
            };
            // Global settings first, handler options win.
            if let Some(secs) = config.interval_secs().filter(|s| *s > 0) {
                h.base_mut().set_interval(Duration::from_secs(secs));
            }
            h.base_mut().set_prefix(config.prefix.as_str());
            h.base_mut()
                .set_default_dimensions(config.default_dimensions.clone());
            h.configure(options);

            links.push(HandlerLink::from_handler(h.as_ref()));
            stats.add_handler(name, h.base().stats());
            handlers.push(name.clone());
            tasks.push(tokio::spawn(handler::run(h)));
        }
        if handlers.is_empty() {
            warn!("no handlers running, collected metrics will be discarded");
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel(CHANNEL_CAPACITY);

        info!("starting collectors");
        let mut collectors = Vec::new();
        for (name, options) in &config.collectors {
            let Some((mut c, rx)) = collector::new_collector(name) else {
                continue;
            };
            c.configure(options);

            let counters = stats.add_collector(name);
            tasks.push(tokio::spawn(forward(
                name.clone(),
                rx,
                dispatch_tx.clone(),
                counters,
            )));
            tasks.push(tokio::spawn(collector::run(c)));
            collectors.push(name.clone());
        }
        drop(dispatch_tx);

        if handlers.is_empty() && collectors.is_empty() {
            for task in &tasks {
                task.abort();
            }
            return Err(AgentError::NothingToRun);
        }

        tasks.push(tokio::spawn(Dispatcher::new(links).run(dispatch_rx)));
        info!(
            handlers = handlers.len(),
            collectors = collectors.len(),
            "pipeline started"
        );

        Ok(Self {
            stats,
            handlers,
            collectors,
            tasks,
        })
    }

    /// Loads `path` and starts the pipeline it describes.
    pub async fn start_from_file(path: &str) -> Result<Self, AgentError> {
        let config = AgentConfig::load(path)?;
        Self::start(&config).await
    }

    pub fn stats(&self) -> Arc<AgentStats> {
        self.stats.clone()
    }

    pub fn handler_names(&self) -> &[String] {
        &self.handlers
    }

    pub fn collector_names(&self) -> &[String] {
        &self.collectors
    }

    /// Stops every task. In-flight batches are not flushed.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Moves one collector's metrics to the dispatcher, in order, stamping the
/// collector name and counting them.
async fn forward(
    collector: String,
    mut input: mpsc::Receiver<Metric>,
    output: mpsc::Sender<Metric>,
    counters: Arc<CollectorStats>,
) {
    while let Some(mut metric) = input.recv().await {
        if metric.dimension(COLLECTOR_DIMENSION).is_none() {
            metric.add_dimension(COLLECTOR_DIMENSION, collector.as_str());
        }
        counters.record();
        if output.send(metric).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::{Framed, LinesCodec};

    #[tokio::test]
    async fn test_forward_stamps_and_counts() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let counters = Arc::new(CollectorStats::default());
        let task = tokio::spawn(forward("Test".into(), in_rx, out_tx, counters.clone()));

        in_tx.send(Metric::new("a")).await.unwrap();
        let mut tagged = Metric::new("b");
        tagged.add_dimension(COLLECTOR_DIMENSION, "Other");
        in_tx.send(tagged).await.unwrap();
        drop(in_tx);
        task.await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap().dimension(COLLECTOR_DIMENSION), Some("Test"));
        assert_eq!(out_rx.recv().await.unwrap().dimension(COLLECTOR_DIMENSION), Some("Other"));
        assert_eq!(counters.metrics(), 2);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_pipeline() {
        let config = AgentConfig::from_json(r#"{"collectors": {"Bogus": {}}}"#).unwrap();
        assert!(matches!(
            Agent::start(&config).await,
            Err(AgentError::NothingToRun)
        ));
    }

    #[tokio::test]
    async fn test_start_from_missing_file() {
        assert!(matches!(
            Agent::start_from_file("/nonexistent/mettle.json").await,
            Err(AgentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_test_collector_to_buffered_handler() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let config = AgentConfig::from_json(&format!(
            r#"{{
                "prefix": "e2e.",
                "interval": 1,
                "defaultDimensions": {{"region": "test"}},
                "collectors": {{"Test": {{"interval": 1, "metricName": "probe"}}, "Unknown": {{}}}},
                "handlers": {{"Buffered": {{"port": {port}, "max_buffer_size": 1}}}}
            }}"#
        ))
        .unwrap();

        let agent = Agent::start(&config).await.unwrap();
        assert_eq!(agent.handler_names(), ["Buffered"]);
        assert_eq!(agent.collector_names(), ["Test"]);

        let metric = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await else {
                    continue;
                };
                let mut client = Framed::new(stream, LinesCodec::new());
                client.send("q".to_string()).await.unwrap();
                let first = client.next().await.unwrap().unwrap();
                if first != "EOM" {
                    return Metric::from_json(&first).unwrap();
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(metric.name, "e2e.probe");
        assert_eq!(metric.dimension("collector"), Some("Test"));
        assert_eq!(metric.dimension("region"), Some("test"));

        let report = agent.stats().report(Default::default());
        assert!(report.collectors["Test"].counters["metricsCollected"] >= 1.0);
        assert!(report.handlers.contains_key("Buffered"));
        agent.shutdown();
    }
}

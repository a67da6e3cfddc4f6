//! Fan-out of collected metrics to every eligible handler.
//!
//! For each metric and each handler: a metric whose `collector` dimension
//! names a collector the handler blacklisted is dropped for that handler
//! only. Every other handler gets its own copy. Deliveries for one metric
//! run concurrently, so a full handler channel delays only itself until it
//! drains.

use std::collections::BTreeSet;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::handler::Handler;
use crate::metric::Metric;

/// Dimension naming the collector a metric came from.
pub const COLLECTOR_DIMENSION: &str = "collector";

/// What the dispatcher needs to know about one handler.
#[derive(Debug, Clone)]
pub struct HandlerLink {
    name: String,
    channel: mpsc::Sender<Metric>,
    blacklist: BTreeSet<String>,
}

impl HandlerLink {
    pub fn new(
        name: impl Into<String>,
        channel: mpsc::Sender<Metric>,
        blacklist: BTreeSet<String>,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            blacklist,
        }
    }

    pub fn from_handler(handler: &dyn Handler) -> Self {
        let base = handler.base();
        Self::new(base.name(), base.channel(), base.blacklist().clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_collector_blacklisted(&self, collector: &str) -> bool {
        self.blacklist.contains(collector)
    }
}

pub struct Dispatcher {
    handlers: Vec<HandlerLink>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<HandlerLink>) -> Self {
        Self { handlers }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Delivers `metric` to every handler that did not blacklist its
    /// collector. Returns the number of handlers that accepted it.
    pub async fn dispatch(&self, metric: Metric) -> usize {
        let collector = metric.dimension(COLLECTOR_DIMENSION);
        let deliveries = self
            .handlers
            .iter()
            .filter(|h| match collector {
                Some(c) if h.is_collector_blacklisted(c) => {
                    debug!(
                        collector = %c,
                        handler = %h.name,
                        "not forwarding, handler blacklisted this collector"
                    );
                    false
                }
                _ => true,
            })
            .map(|h| {
                let copy = metric.clone();
                async move {
                    let ok = h.channel.send(copy).await.is_ok();
                    if !ok {
                        debug!(handler = %h.name, "handler channel closed");
                    }
                    ok
                }
            });
        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }

    /// Forwards everything from `input` until every collector is gone.
    pub async fn run(self, mut input: mpsc::Receiver<Metric>) {
        info!(handlers = self.handlers.len(), "dispatcher started");
        while let Some(metric) = input.recv().await {
            self.dispatch(metric).await;
        }
        info!("dispatcher input closed, stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn link(name: &str, blacklist: &[&str]) -> (HandlerLink, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(64);
        let blacklist = blacklist.iter().map(|s| s.to_string()).collect();
        (HandlerLink::new(name, tx, blacklist), rx)
    }

    fn metric_from(collector: Option<&str>, name: &str) -> Metric {
        let mut m = Metric::new(name);
        if let Some(c) = collector {
            m.add_dimension(COLLECTOR_DIMENSION, c);
        }
        m
    }

    fn drain(rx: &mut mpsc::Receiver<Metric>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(m) = rx.try_recv() {
            names.push(m.name);
        }
        names
    }

    #[tokio::test]
    async fn test_blacklist_applies_per_handler() {
        let (a, mut rx_a) = link("A", &["X"]);
        let (b, mut rx_b) = link("B", &[]);
        let d = Dispatcher::new(vec![a, b]);

        assert_eq!(d.dispatch(metric_from(Some("X"), "x1")).await, 1);
        assert_eq!(d.dispatch(metric_from(Some("Y"), "y1")).await, 2);
        assert_eq!(d.dispatch(metric_from(None, "plain")).await, 2);

        assert_eq!(drain(&mut rx_a), vec!["y1", "plain"]);
        assert_eq!(drain(&mut rx_b), vec!["x1", "y1", "plain"]);
    }

    #[tokio::test]
    async fn test_each_handler_gets_independent_copy() {
        let (a, mut rx_a) = link("A", &[]);
        let (b, mut rx_b) = link("B", &[]);
        let d = Dispatcher::new(vec![a, b]);
        d.dispatch(metric_from(None, "m")).await;

        let mut first = rx_a.try_recv().unwrap();
        first.add_dimension("mutated", "yes");
        let second = rx_b.try_recv().unwrap();
        assert_eq!(second.dimension("mutated"), None);
    }

    #[tokio::test]
    async fn test_closed_handler_does_not_stop_others() {
        let (a, rx_a) = link("A", &[]);
        let (b, mut rx_b) = link("B", &[]);
        drop(rx_a);
        let d = Dispatcher::new(vec![a, b]);

        assert_eq!(d.dispatch(metric_from(None, "m")).await, 1);
        assert_eq!(drain(&mut rx_b), vec!["m"]);
    }

    #[tokio::test]
    async fn test_full_handler_does_not_block_delivery_to_others() {
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let slow = HandlerLink::new("slow", slow_tx, BTreeSet::new());
        let (fast, mut fast_rx) = link("fast", &[]);
        let d = std::sync::Arc::new(Dispatcher::new(vec![slow, fast]));

        d.dispatch(metric_from(None, "first")).await;
        let pending = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(metric_from(None, "second")).await })
        };

        let got = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let names = drain(&mut fast_rx);
                if names.contains(&"second".to_string()) {
                    return names;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(got.contains(&"second".to_string()));

        slow_rx.recv().await.unwrap();
        assert_eq!(pending.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_preserves_order() {
        let (a, mut rx_a) = link("A", &[]);
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(Dispatcher::new(vec![a]).run(rx));

        for i in 0..5 {
            tx.send(metric_from(Some("C"), &format!("m{i}"))).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(drain(&mut rx_a), vec!["m0", "m1", "m2", "m3", "m4"]);
    }
}

//! Publish-style handler: every metric is broadcast as a JSON line to all
//! connected TCP subscribers.
//!
//! Publishing never blocks the emit loop. A subscriber that cannot keep up
//! loses the oldest messages; with no subscriber connected metrics are
//! simply dropped.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use super::{Handler, HandlerBase, HandlerError};
use crate::config::{Options, get_as_int};
use crate::metric::Metric;

/// Messages a subscriber may fall behind before it starts losing them.
const SUBSCRIBER_BACKLOG: usize = 4096;

pub struct PublishHandler {
    base: HandlerBase,
    port: Option<u16>,
    publisher: broadcast::Sender<String>,
    local_addr: Option<SocketAddr>,
}

impl PublishHandler {
    pub fn new(base: HandlerBase) -> Self {
        let (publisher, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            base,
            port: None,
            publisher,
            local_addr: None,
        }
    }

    pub(crate) fn boxed(base: HandlerBase) -> Box<dyn Handler> {
        Box::new(Self::new(base))
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.receiver_count()
    }
}

#[async_trait]
impl Handler for PublishHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        self.port = options
            .get("port")
            .and_then(|v| u16::try_from(get_as_int(v, -1)).ok());
        if self.port.is_none() {
            error!(handler = %self.base.name(), "no port specified, there won't be any emissions");
        }
        self.base.configure_common(options);
    }

    async fn start(&mut self) -> Result<(), HandlerError> {
        let Some(port) = self.port else {
            return Err(HandlerError::NotConfigured("port"));
        };
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HandlerError::Bind { addr, source })?;
        self.local_addr = listener.local_addr().ok();
        info!(handler = %self.base.name(), addr = ?self.local_addr, "publishing metrics");

        tokio::spawn(accept_subscribers(
            listener,
            self.base.name().to_string(),
            self.publisher.clone(),
        ));
        Ok(())
    }

    async fn emit(&mut self, batch: Vec<Metric>) -> Result<(), HandlerError> {
        if self.port.is_none() {
            return Err(HandlerError::NotConfigured("port"));
        }
        let mut published = 0;
        for metric in &batch {
            let line = metric.to_json()?;
            // Err means nobody is subscribed right now.
            if self.publisher.send(line).is_ok() {
                published += 1;
            }
        }
        debug!(handler = %self.base.name(), total = batch.len(), published, "batch published");
        Ok(())
    }
}

async fn accept_subscribers(
    listener: TcpListener,
    handler: String,
    publisher: broadcast::Sender<String>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(handler = %handler, peer = %peer, "subscriber connected");
                tokio::spawn(feed_subscriber(stream, peer, handler.clone(), publisher.subscribe()));
            }
            Err(e) => warn!(handler = %handler, error = %e, "accept failed"),
        }
    }
}

async fn feed_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    handler: String,
    mut messages: broadcast::Receiver<String>,
) {
    let mut sink = FramedWrite::new(stream, LinesCodec::new());
    loop {
        match messages.recv().await {
            Ok(line) => {
                if let Err(e) = sink.send(line).await {
                    debug!(handler = %handler, peer = %peer, error = %e, "subscriber gone");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(handler = %handler, peer = %peer, missed, "slow subscriber lost messages");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DEFAULT_INTERVAL, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_TIMEOUT};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::codec::FramedRead;

    fn handler(options: serde_json::Value) -> PublishHandler {
        let mut h = PublishHandler::new(HandlerBase::new(
            "Publish",
            DEFAULT_INTERVAL,
            DEFAULT_MAX_BUFFER_SIZE,
            DEFAULT_TIMEOUT,
        ));
        h.configure(options.as_object().unwrap());
        h
    }

    #[tokio::test]
    async fn test_emit_without_port_fails() {
        let mut h = handler(json!({}));
        assert!(matches!(
            h.emit(vec![Metric::new("x")]).await,
            Err(HandlerError::NotConfigured("port"))
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_block() {
        let mut h = handler(json!({"port": 0}));
        h.start().await.unwrap();
        let batch = (0..10_000).map(|i| Metric::new(format!("m{i}"))).collect();
        tokio::time::timeout(Duration::from_secs(5), h.emit(batch))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_receives_json_lines() {
        let mut h = handler(json!({"port": 0}));
        h.start().await.unwrap();
        let port = h.local_addr().unwrap().port();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut lines = FramedRead::new(stream, LinesCodec::new());
        while h.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.emit(vec![Metric::new("a").with_value(1.0), Metric::new("b")])
            .await
            .unwrap();

        for expected in ["a", "b"] {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(Metric::from_json(&line).unwrap().name, expected);
        }
    }
}

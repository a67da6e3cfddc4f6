//! Query-style handler: batches land in a [`RingBuffer`] and flow out only
//! when a client asks.
//!
//! Protocol (newline-delimited over TCP): every request line, whatever its
//! content, is answered with one JSON line per buffered metric followed by a
//! line containing `EOM`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use super::ring_buffer::RingBuffer;
use super::{Handler, HandlerBase, HandlerError};
use crate::config::{Options, get_as_int};
use crate::metric::{Filter, Metric};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Terminal frame of every reply.
pub const END_OF_MESSAGE: &str = "EOM";

const MAX_REQUEST_LENGTH: usize = 4096;

pub struct BufferedHandler {
    base: HandlerBase,
    port: Option<u16>,
    retention: Duration,
    sweep_interval: Duration,
    buffer: Arc<RingBuffer>,
    local_addr: Option<SocketAddr>,
}

impl BufferedHandler {
    pub fn new(base: HandlerBase) -> Self {
        Self {
            base,
            port: None,
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            buffer: Arc::new(RingBuffer::new(DEFAULT_RETENTION)),
            local_addr: None,
        }
    }

    pub(crate) fn boxed(base: HandlerBase) -> Box<dyn Handler> {
        Box::new(Self::new(base))
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Address the request server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn values(&self) -> Vec<Metric> {
        self.buffer.values()
    }

    pub fn filter(&self, filter: &Filter) -> Vec<Metric> {
        self.buffer.filter(filter)
    }

    pub fn matching(&self, filter: &Filter) -> Vec<Metric> {
        self.buffer.matching(filter)
    }
}

fn seconds(base: &HandlerBase, options: &Options, key: &str, default: Duration) -> Duration {
    let Some(value) = options.get(key) else {
        warn!(handler = %base.name(), "no {key} specified, using {}s", default.as_secs());
        return default;
    };
    match u64::try_from(get_as_int(value, 0)) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => {
            warn!(handler = %base.name(), "invalid {key} {}, using {}s", value, default.as_secs());
            default
        }
    }
}

#[async_trait]
impl Handler for BufferedHandler {
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
            error!(
                handler = %self.base.name(),
                "no port specified, buffered metrics cannot be queried"
            );
        }
        self.retention = seconds(&self.base, options, "retention", DEFAULT_RETENTION);
        self.sweep_interval = seconds(&self.base, options, "sweepinterval", DEFAULT_SWEEP_INTERVAL);
        self.buffer = Arc::new(RingBuffer::new(self.retention));
        self.base.configure_common(options);
    }

    async fn start(&mut self) -> Result<(), HandlerError> {
        tokio::spawn(sweep(
            self.base.name().to_string(),
            self.buffer.clone(),
            self.sweep_interval,
        ));

        let Some(port) = self.port else {
            return Err(HandlerError::NotConfigured("port"));
        };
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HandlerError::Bind { addr, source })?;
        self.local_addr = listener.local_addr().ok();
        info!(handler = %self.base.name(), addr = ?self.local_addr, "serving buffered metrics");

        tokio::spawn(serve_requests(
            listener,
            self.base.name().to_string(),
            self.buffer.clone(),
        ));
        Ok(())
    }

    async fn emit(&mut self, batch: Vec<Metric>) -> Result<(), HandlerError> {
        let total = batch.len();
        let stored = batch
            .into_iter()
            .filter_map(|m| self.buffer.enqueue(m).then_some(()))
            .count();
        debug!(handler = %self.base.name(), total, stored, "metrics buffered");
        Ok(())
    }
}

async fn sweep(handler: String, buffer: Arc<RingBuffer>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;
    loop {
        tick.tick().await;
        let evicted = buffer.tidy_up();
        if evicted > 0 {
            debug!(handler = %handler, evicted, retained = buffer.len(), "sweep completed");
        }
    }
}

async fn serve_requests(listener: TcpListener, handler: String, buffer: Arc<RingBuffer>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(handler = %handler, peer = %peer, "query connection accepted");
                tokio::spawn(answer(stream, handler.clone(), buffer.clone()));
            }
            Err(e) => warn!(handler = %handler, error = %e, "accept failed"),
        }
    }
}

async fn answer(stream: TcpStream, handler: String, buffer: Arc<RingBuffer>) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LENGTH));
    while let Some(request) = framed.next().await {
        if let Err(e) = request {
            warn!(handler = %handler, error = %e, "dropping query connection");
            return;
        }
        let values = buffer.values();
        debug!(handler = %handler, count = values.len(), "answering query");
        if let Err(e) = reply(&mut framed, &values).await {
            warn!(handler = %handler, error = %e, "reply failed");
            return;
        }
    }
}

async fn reply(
    framed: &mut Framed<TcpStream, LinesCodec>,
    values: &[Metric],
) -> Result<(), tokio_util::codec::LinesCodecError> {
    for metric in values {
        match metric.to_json() {
            Ok(json) => framed.feed(json).await?,
            Err(e) => warn!(metric = %metric.name, error = %e, "cannot encode metric"),
        }
    }
    framed.send(END_OF_MESSAGE.to_string()).await
}

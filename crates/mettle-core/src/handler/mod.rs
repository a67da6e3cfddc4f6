//! Handlers: units of metric egress.
//!
//! A handler owns a bounded input channel fed by the dispatcher. [`run`]
//! drains it into a batch and hands the batch to [`Handler::emit`] whenever
//! the interval elapses or the batch reaches `max_buffer_size`, whichever
//! comes first. Emission is best-effort: a failed or timed out batch is
//! logged and dropped.
//!
//! ```text
//! Dispatcher ──▶ mpsc ──▶ run() ──batch──▶ emit()
//!                           │                ├─ InfluxDB: HTTP line protocol
//!                           │                ├─ Publish:  TCP broadcast
//!                           │                └─ Buffered: RingBuffer ◀── TCP queries
//!                           └─ prefix + default dimensions applied on receipt
//! ```

mod buffered;
mod influxdb;
mod publish;
pub mod ring_buffer;

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{Options, get_as_int, get_as_list};
use crate::metric::{Dimensions, Metric, MetricError};
use crate::status::HandlerStats;

pub use buffered::BufferedHandler;
pub use influxdb::InfluxDbHandler;
pub use publish::PublishHandler;
pub use ring_buffer::RingBuffer;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 300;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of every handler's input channel.
pub const CHANNEL_CAPACITY: usize = 4096;

/// Error type for handler emission and startup.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler is not configured: missing {0}")]
    NotConfigured(&'static str),
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("emit timed out after {0:?}")]
    Timeout(Duration),
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// State shared by every handler: schedule, batching limits, naming rules,
/// blacklist, statistics and the input channel.
#[derive(Debug)]
pub struct HandlerBase {
    name: String,
    sender: mpsc::Sender<Metric>,
    receiver: Option<mpsc::Receiver<Metric>>,
    interval: Duration,
    max_buffer_size: usize,
    timeout: Duration,
    prefix: String,
    default_dimensions: Dimensions,
    blacklist: BTreeSet<String>,
    stats: Arc<HandlerStats>,
}

impl HandlerBase {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        max_buffer_size: usize,
        timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            sender,
            receiver: Some(receiver),
            interval,
            max_buffer_size,
            timeout,
            prefix: String::new(),
            default_dimensions: Dimensions::new(),
            blacklist: BTreeSet::new(),
            stats: Arc::new(HandlerStats::default()),
        }
    }

    /// Applies `interval`, `max_buffer_size`, `timeout` (seconds) and
    /// `collectorBlackList`.
    pub fn configure_common(&mut self, options: &Options) {
        if let Some(v) = options.get("interval") {
            match positive(v) {
                Some(secs) => self.interval = Duration::from_secs(secs),
                None => warn!(handler = %self.name, "ignoring invalid interval {}", v),
            }
        }
        if let Some(v) = options.get("max_buffer_size") {
            match positive(v) {
                Some(size) => self.max_buffer_size = size as usize,
                None => warn!(handler = %self.name, "ignoring invalid max_buffer_size {}", v),
            }
        }
        if let Some(v) = options.get("timeout") {
            match positive(v) {
                Some(secs) => self.timeout = Duration::from_secs(secs),
                None => warn!(handler = %self.name, "ignoring invalid timeout {}", v),
            }
        }
        if let Some(v) = options.get("collectorBlackList") {
            self.blacklist = get_as_list(v).into_iter().collect();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sending side of the input channel, for the dispatcher.
    pub fn channel(&self) -> mpsc::Sender<Metric> {
        self.sender.clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    pub fn default_dimensions(&self) -> &Dimensions {
        &self.default_dimensions
    }

    pub fn set_default_dimensions(&mut self, dims: Dimensions) {
        self.default_dimensions = dims;
    }

    pub fn blacklist(&self) -> &BTreeSet<String> {
        &self.blacklist
    }

    pub fn is_collector_blacklisted(&self, collector: &str) -> bool {
        self.blacklist.contains(collector)
    }

    pub fn stats(&self) -> Arc<HandlerStats> {
        self.stats.clone()
    }

    /// Applies the prefix and default dimensions. The metric's own
    /// dimensions win.
    pub fn prepare(&self, metric: Metric) -> Metric {
        let mut metric = metric.with_prefix(&self.prefix);
        if !self.default_dimensions.is_empty() {
            metric.dimensions = metric.dimensions_with(&self.default_dimensions);
        }
        metric
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<Metric>> {
        self.receiver.take()
    }
}

fn positive(value: &serde_json::Value) -> Option<u64> {
    u64::try_from(get_as_int(value, 0)).ok().filter(|v| *v > 0)
}

/// A unit of metric egress.
#[async_trait]
pub trait Handler: Send {
    fn base(&self) -> &HandlerBase;

    fn base_mut(&mut self) -> &mut HandlerBase;

    /// Applies handler options on top of the globally applied settings.
    fn configure(&mut self, options: &Options);

    /// Starts auxiliary tasks (servers, sweepers) before the emit loop.
    async fn start(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Delivers one batch.
    async fn emit(&mut self, batch: Vec<Metric>) -> Result<(), HandlerError>;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn interval(&self) -> Duration {
        self.base().interval()
    }

    fn channel(&self) -> mpsc::Sender<Metric> {
        self.base().channel()
    }

    fn is_collector_blacklisted(&self, collector: &str) -> bool {
        self.base().is_collector_blacklisted(collector)
    }
}

type Constructor = fn(HandlerBase) -> Box<dyn Handler>;

/// Handler name → constructor.
const REGISTRY: &[(&str, Constructor)] = &[
    ("InfluxDB", InfluxDbHandler::boxed),
    ("Publish", PublishHandler::boxed),
    ("Buffered", BufferedHandler::boxed),
];

/// Names accepted by [`new_handler`].
pub fn registered_names() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

/// Creates a handler by name with default interval, buffer size and timeout.
/// Returns `None` for unknown names.
pub fn new_handler(name: &str) -> Option<Box<dyn Handler>> {
    let Some((_, constructor)) = REGISTRY.iter().find(|(n, _)| *n == name) else {
        error!(handler = %name, "cannot create handler: unknown name");
        return None;
    };
    let base = HandlerBase::new(name, DEFAULT_INTERVAL, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_TIMEOUT);
    Some(constructor(base))
}

/// Runs a handler's emit loop for the life of the process.
pub async fn run(mut handler: Box<dyn Handler>) {
    let Some(mut rx) = handler.base_mut().take_receiver() else {
        error!(handler = %handler.name(), "handler is already running");
        return;
    };

    if let Err(e) = handler.start().await {
        error!(handler = %handler.name(), error = %e, "auxiliary services failed to start");
    }

    let interval = handler.interval().max(Duration::from_secs(1));
    let max_buffer_size = handler.base().max_buffer_size().max(1);
    handler.base().stats().set_interval(interval);
    info!(
        handler = %handler.name(),
        interval_secs = interval.as_secs(),
        max_buffer_size,
        "starting handler"
    );

    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut batch = Vec::with_capacity(max_buffer_size);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(metric) => {
                    batch.push(handler.base().prepare(metric));
                    if batch.len() >= max_buffer_size {
                        flush(handler.as_mut(), &mut batch).await;
                    }
                }
                None => {
                    flush(handler.as_mut(), &mut batch).await;
                    info!(handler = %handler.name(), "input closed, stopping");
                    return;
                }
            },
            _ = tick.tick() => flush(handler.as_mut(), &mut batch).await,
        }
    }
}

async fn flush(handler: &mut dyn Handler, batch: &mut Vec<Metric>) {
    if batch.is_empty() {
        return;
    }
    let metrics = std::mem::take(batch);
    let count = metrics.len();
    let timeout = handler.base().timeout();

    let t0 = Instant::now();
    let result = match tokio::time::timeout(timeout, handler.emit(metrics)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Timeout(timeout)),
    };
    let elapsed = t0.elapsed();
    handler
        .base()
        .stats()
        .record_emission(count, elapsed, result.is_ok());

    match result {
        Ok(()) => debug!(
            handler = %handler.name(),
            count,
            duration_ms = elapsed.as_millis() as u64,
            "batch emitted"
        ),
        Err(e) => error!(
            handler = %handler.name(),
            count,
            error = %e,
            "emit failed, batch dropped"
        ),
    }
}

//! Listener-type collector accepting newline-delimited metric JSON over TCP.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use super::{Collector, CollectorBase, CollectorKind};
use crate::config::{Options, get_as_int};
use crate::metric::Metric;

pub const DEFAULT_LISTENER_PORT: u16 = 19191;

/// Longest accepted line.
const MAX_LINE_LENGTH: usize = 64 * 1024;

pub struct JsonListenerCollector {
    base: CollectorBase,
    port: u16,
}

impl JsonListenerCollector {
    pub fn new(mut base: CollectorBase) -> Self {
        base.set_kind(CollectorKind::Listener);
        Self {
            base,
            port: DEFAULT_LISTENER_PORT,
        }
    }

    pub(crate) fn boxed(base: CollectorBase) -> Box<dyn Collector> {
        Box::new(Self::new(base))
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl Collector for JsonListenerCollector {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        if let Some(port) = options.get("port") {
            match u16::try_from(get_as_int(port, -1)) {
                Ok(port) => self.port = port,
                Err(_) => warn!(collector = %self.base.name(), "ignoring invalid port {}", port),
            }
        }
        self.base.configure_common(options);
    }

    async fn collect(&mut self) {
        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    collector = %self.base.name(),
                    port = self.port,
                    error = %e,
                    "cannot bind listener"
                );
                return;
            }
        };
        info!(collector = %self.base.name(), port = self.port, "accepting metrics");
        serve(listener, self.base.name(), self.base.channel().clone()).await;
    }
}

/// Accepts connections until the metric channel closes.
pub(crate) async fn serve(listener: TcpListener, collector: &str, channel: mpsc::Sender<Metric>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(collector = %collector, error = %e, "accept failed");
                continue;
            }
        };
        if channel.is_closed() {
            return;
        }
        debug!(collector = %collector, peer = %peer, "connection accepted");
        tokio::spawn(read_metrics(stream, collector.to_string(), channel.clone()));
    }
}

async fn read_metrics(stream: TcpStream, collector: String, channel: mpsc::Sender<Metric>) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(collector = %collector, error = %e, "dropping connection");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match Metric::from_json(&line) {
            Ok(metric) => {
                if channel.send(metric).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(
                    collector = %collector,
                    error = %e,
                    payload = %line,
                    "skipping malformed metric"
                );
            }
        }
    }
}

//! Time-series sink speaking the InfluxDB line protocol over HTTP.
//!
//! One batch becomes one `POST /write?db=<database>&precision=s` whose body
//! holds one point per metric: `name,tag=value,... value=<f64> <unix secs>`.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{Handler, HandlerBase, HandlerError};
use crate::config::{Options, get_as_string};
use crate::metric::Metric;

pub struct InfluxDbHandler {
    base: HandlerBase,
    server: Option<String>,
    port: Option<String>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl InfluxDbHandler {
    pub fn new(base: HandlerBase) -> Self {
        let client = build_client(base.timeout());
        Self {
            base,
            server: None,
            port: None,
            database: None,
            username: None,
            password: None,
            client,
        }
    }

    pub(crate) fn boxed(base: HandlerBase) -> Box<dyn Handler> {
        Box::new(Self::new(base))
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn write_url(&self) -> Result<String, HandlerError> {
        let server = self.server.as_deref().ok_or(HandlerError::NotConfigured("server"))?;
        let port = self.port.as_deref().ok_or(HandlerError::NotConfigured("port"))?;
        let database = self
            .database
            .as_deref()
            .ok_or(HandlerError::NotConfigured("database"))?;
        Ok(format!("http://{server}:{port}/write?db={database}&precision=s"))
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Renders one metric as a line protocol point with second precision.
/// Dimensions become tags; empty tag values are left out.
pub(crate) fn to_line(metric: &Metric) -> String {
    let mut line = escape_measurement(&metric.name);
    for (k, v) in metric.dimensions.iter().filter(|(_, v)| !v.is_empty()) {
        let _ = write!(line, ",{}={}", escape_tag(k), escape_tag(v));
    }
    let _ = write!(line, " value={} {}", metric.value, metric.timestamp.timestamp());
    line
}

#[async_trait]
impl Handler for InfluxDbHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandlerBase {
        &mut self.base
    }

    fn configure(&mut self, options: &Options) {
        let read = |key: &'static str| {
            let value = options.get(key).and_then(get_as_string);
            if value.is_none() {
                error!(handler = %self.base.name(), "no {key} specified");
            }
            value
        };
        let server = read("server");
        let port = read("port");
        let database = read("database");
        let username = read("username");
        let password = read("password");

        self.server = server;
        self.port = port;
        self.database = database;
        self.username = username;
        self.password = password;

        self.base.configure_common(options);
        self.client = build_client(self.base.timeout());
    }

    async fn emit(&mut self, batch: Vec<Metric>) -> Result<(), HandlerError> {
        if batch.is_empty() {
            warn!(handler = %self.base.name(), "skipping send because of an empty payload");
            return Ok(());
        }
        let url = self.write_url()?;
        let body = batch.iter().map(to_line).collect::<Vec<_>>().join("\n");

        let mut request = self.client.post(&url).body(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }
        let rsp = request.send().await.map_err(|source| HandlerError::Request {
            url: url.clone(),
            source,
        })?;
        if !rsp.status().is_success() {
            return Err(HandlerError::Status {
                url,
                status: rsp.status(),
            });
        }
        debug!(handler = %self.base.name(), count = batch.len(), "points written");
        Ok(())
    }
}

//! TTL cache of the elected cluster leader.
//!
//! Leader-only collectors consult the cache on every collection. A refresh
//! happens under the cache lock, so concurrent callers queue behind the
//! in-flight query instead of issuing their own. On query failure the last
//! known leader is returned.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default lifetime of a cached leader.
pub const DEFAULT_LEADER_TTL: Duration = Duration::from_secs(5 * 60);

/// Port of the cluster manager's HTTP API.
pub const MESOS_PORT: u16 = 5050;

/// Error type for leader discovery.
#[derive(Debug, Clone, Error)]
pub enum LeaderError {
    #[error("no candidate nodes configured")]
    NoCandidates,
    #[error("no candidate node reported a leader: {0}")]
    Unresolved(String),
}

/// Source of truth for the current leader.
#[async_trait]
pub trait LeaderDiscovery: Send + Sync {
    /// Asks the candidate nodes who the leader is and returns its IP.
    async fn discover(&self, nodes: &[String]) -> Result<String, LeaderError>;
}

/// Discovers the leading master through the `/master/redirect` endpoint.
///
/// Any master answers with a redirect whose `Location` header points at the
/// leader (`//host:5050/...`).
pub struct MesosLeaderDiscovery {
    client: reqwest::Client,
}

impl MesosLeaderDiscovery {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    async fn ask(&self, node: &str) -> Result<String, String> {
        let url = format!("http://{node}:{MESOS_PORT}/master/redirect");
        let rsp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("{url}: {e}"))?;
        let location = rsp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| format!("{url}: no Location header ({})", rsp.status()))?;
        let host = host_from_location(location)
            .ok_or_else(|| format!("{url}: unparsable Location '{location}'"))?;
        resolve_ip(host).await.map_err(|e| format!("{url}: {e}"))
    }
}

#[async_trait]
impl LeaderDiscovery for MesosLeaderDiscovery {
    async fn discover(&self, nodes: &[String]) -> Result<String, LeaderError> {
        if nodes.is_empty() {
            return Err(LeaderError::NoCandidates);
        }
        let mut failures = Vec::new();
        for node in nodes {
            match self.ask(node).await {
                Ok(ip) => return Ok(ip),
                Err(e) => failures.push(e),
            }
        }
        Err(LeaderError::Unresolved(failures.join("; ")))
    }
}

/// Extracts the host from a `Location` value such as `//10.0.0.1:5050/master`
/// or `http://master-2:5050`.
pub(crate) fn host_from_location(location: &str) -> Option<&str> {
    let rest = location
        .split_once("://")
        .map(|(_, rest)| rest)
        .or_else(|| location.strip_prefix("//"))
        .unwrap_or(location);
    let authority = rest.split('/').next()?;
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then_some(host)
}

async fn resolve_ip(host: &str) -> std::io::Result<String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    let mut addrs = tokio::net::lookup_host((host, MESOS_PORT)).await?;
    addrs
        .next()
        .map(|a| a.ip().to_string())
        .ok_or_else(|| std::io::Error::other(format!("{host} did not resolve")))
}

#[derive(Debug, Default)]
struct CachedLeader {
    leader: String,
    fetched_at: Option<Instant>,
}

impl CachedLeader {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.is_some_and(|at| at.elapsed() < ttl)
    }
}

/// TTL-cached pointer to the current leader.
pub struct LeaderCache {
    nodes: Vec<String>,
    ttl: Duration,
    discovery: Arc<dyn LeaderDiscovery>,
    state: Mutex<CachedLeader>,
}

impl LeaderCache {
    pub fn new(discovery: Arc<dyn LeaderDiscovery>) -> Self {
        Self {
            nodes: Vec::new(),
            ttl: DEFAULT_LEADER_TTL,
            discovery,
            state: Mutex::new(CachedLeader::default()),
        }
    }

    /// Sets the candidate nodes and TTL. The cached value is invalidated.
    pub fn configure(&mut self, nodes: Vec<String>, ttl: Duration) {
        self.nodes = nodes;
        self.ttl = ttl;
        *self.state.get_mut() = CachedLeader::default();
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Returns the believed leader IP, refreshing it when the entry expired.
    ///
    /// Returns an empty string if no leader was ever discovered.
    pub async fn get(&self) -> String {
        let mut state = self.state.lock().await;
        if state.is_fresh(self.ttl) {
            return state.leader.clone();
        }

        match self.discovery.discover(&self.nodes).await {
            Ok(leader) => {
                if leader != state.leader {
                    debug!(leader = %leader, previous = %state.leader, "leader changed");
                }
                state.leader = leader;
                state.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                warn!(
                    error = %e,
                    stale = %state.leader,
                    "leader refresh failed, keeping last known leader"
                );
            }
        }
        state.leader.clone()
    }
}

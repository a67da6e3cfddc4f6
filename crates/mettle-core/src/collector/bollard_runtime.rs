//! [`ContainerRuntime`] over the Docker Engine API.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions, Stats, StatsOptions};
use futures::StreamExt;

use super::docker::{ContainerInfo, ContainerRuntime, ContainerStats, InterfaceStats, RuntimeError};

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    /// Connects using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn container_err(id: &str, e: impl ToString) -> RuntimeError {
    RuntimeError::Container {
        id: id.to_string(),
        message: e.to_string(),
    }
}

fn convert_stats(stats: Stats) -> ContainerStats {
    let cpu = &stats.cpu_stats;
    let num_cpus = match &cpu.cpu_usage.percpu_usage {
        Some(per_cpu) if !per_cpu.is_empty() => per_cpu.len() as u64,
        _ => cpu.online_cpus.unwrap_or(0),
    };

    let networks = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.iter()
                .map(|(iface, net)| {
                    (
                        iface.clone(),
                        InterfaceStats {
                            rx_bytes: net.rx_bytes,
                            tx_bytes: net.tx_bytes,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerStats {
        total_usage: cpu.cpu_usage.total_usage,
        system_usage: cpu.system_cpu_usage.unwrap_or(0),
        num_cpus,
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
        networks,
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let rsp = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| container_err(id, e))?;

        let name = rsp
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let env = rsp.config.and_then(|c| c.env).unwrap_or_default();
        Ok(ContainerInfo {
            id: rsp.id.unwrap_or_else(|| id.to_string()),
            name,
            env,
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        let mut stream = Box::pin(self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        ));
        match stream.next().await {
            Some(Ok(stats)) => Ok(convert_stats(stats)),
            Some(Err(e)) => Err(container_err(id, e)),
            None => Err(container_err(id, "empty stats stream")),
        }
    }
}

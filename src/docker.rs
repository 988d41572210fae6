//! Container runtime queries
//!
//! A narrow view over Docker: find a running container by name and read
//! its creation time and per-network IP. Nothing is cached here.

use crate::process::{self, ProcessError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum InspectError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("could not parse container inspection output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Snapshot of a container as reported by `docker inspect`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub created: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

impl ContainerInfo {
    /// Creation timestamp, as the runtime reports it
    pub fn created_at(&self) -> &str {
        &self.created
    }

    /// IP address in `network`, if attached and assigned
    pub fn ip_address(&self, network: &str) -> Option<&str> {
        self.network_settings
            .networks
            .get(network)
            .map(|endpoint| endpoint.ip_address.as_str())
            .filter(|ip| !ip.is_empty())
    }
}

#[async_trait]
pub trait ContainerInspector: Send + Sync {
    /// Whether the runtime answers at all
    async fn is_reachable(&self) -> bool;

    /// Running container with exactly `name`; `None` when there is none
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, InspectError>;
}

/// Docker CLI backed inspector
pub struct DockerCli {
    docker: PathBuf,
    env: Vec<(String, String)>,
}

impl DockerCli {
    /// `env` is passed to every invocation (e.g. a `DOCKER_HOST` override)
    pub fn new(docker: impl Into<PathBuf>, env: Vec<(String, String)>) -> Self {
        Self {
            docker: docker.into(),
            env,
        }
    }
}

#[async_trait]
impl ContainerInspector for DockerCli {
    async fn is_reachable(&self) -> bool {
        match process::run_collect(&self.docker, ["info", "--format", "{{.ServerVersion}}"], &self.env).await {
            Ok(lines) => {
                debug!(version = ?lines.first(), "Docker daemon is reachable");
                true
            }
            Err(e) => {
                debug!(error = %e, "Docker daemon is not reachable");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, InspectError> {
        let filter = format!("name=^/{name}$");
        let ids = process::run_collect(
            &self.docker,
            ["ps", "--filter", filter.as_str(), "--format", "{{.ID}}"],
            &self.env,
        )
        .await?;

        let Some(id) = ids.into_iter().find(|id| !id.is_empty()) else {
            debug!("No running container found");
            return Ok(None);
        };

        let raw = process::run_output(&self.docker, ["inspect", id.as_str()], &self.env).await?;
        Ok(parse_inspect(&raw)?.into_iter().next())
    }
}

/// Parse the JSON array printed by `docker inspect`
pub fn parse_inspect(raw: &str) -> Result<Vec<ContainerInfo>, serde_json::Error> {
    serde_json::from_str(raw)
}

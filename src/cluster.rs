//! A single k3d cluster and its lifecycle
//!
//! A `Cluster` is either built from a user request (full [`ClusterSpec`]) or
//! from one row of `k3d list` (name, image and status only). Derived data
//! (kubeconfig path, server IP, creation time) is fetched lazily and cached.
//! Once destroyed, a cluster is terminal and every derived accessor returns
//! `None`.

use crate::chart::{Chart, ChartError};
use crate::config::ENV_PREFIX;
use crate::context::Context;
use crate::docker::InspectError;
use crate::events::ClusterEvent;
use crate::k3d::ListedCluster;
use crate::process::ProcessError;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::TcpListener;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Characters the container runtime does not accept in names
const FORBIDDEN_NAME_CHARS: &[char] = &[',', ' ', '/', '[', ']'];

/// Marker k3d prints on unrecoverable errors
const FATAL_MARKER: &str = "level=fatal";

/// Prefix k3d gives to every container and network it creates
const DOCKER_PREFIX: &str = "k3d";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster name is empty")]
    EmptyClusterName,

    #[error("invalid cluster name {0:?}: names cannot contain commas, spaces, slashes or brackets")]
    InvalidClusterName(String),

    #[error("invalid number of workers: {0}")]
    InvalidNumWorkers(i32),

    #[error("invalid registry: {0}")]
    RegistryInvalid(String),

    #[error("invalid API address {0:?}")]
    InvalidApiAddress(String),

    #[error("no unused port found in {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("cluster creation failed: {0}")]
    ClusterCreation(String),

    #[error("cluster {0} has already been destroyed")]
    ClusterDestruction(String),

    #[error("cluster {0} has been destroyed")]
    Destroyed(String),

    #[error("could not get a kubeconfig for {0}")]
    NoKubeconfigObtained(String),

    #[error("could not obtain server IP for {container} in network {network}")]
    NoServer { container: String, network: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Inspect(#[from] InspectError),

    #[error(transparent)]
    Chart(#[from] ChartError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Provisioning,
    Running,
    Stopped,
    Destroyed,
}

impl ClusterStatus {
    /// Status as printed in `k3d list`; anything not running counts as stopped
    pub fn from_listed(status: &str) -> Self {
        if status.eq_ignore_ascii_case("running") {
            ClusterStatus::Running
        } else {
            ClusterStatus::Stopped
        }
    }
}

/// Host and port the API server is published on; port `0` means "pick one"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiAddress {
    pub host: Option<String>,
    pub port: u16,
}

impl ApiAddress {
    pub fn is_auto(&self) -> bool {
        self.port == 0
    }
}

impl FromStr for ApiAddress {
    type Err = ClusterError;

    /// Accepts `port`, `host:port` or an empty string (auto)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(ApiAddress::default());
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => (Some(host.to_string()), port),
            Some(_) => return Err(ClusterError::InvalidApiAddress(s.to_string())),
            None => (None, s),
        };
        let port = port
            .parse()
            .map_err(|_| ClusterError::InvalidApiAddress(s.to_string()))?;

        Ok(ApiAddress { host, port })
    }
}

impl fmt::Display for ApiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{host}:{}", self.port),
            None => write!(f, "{}", self.port),
        }
    }
}

/// Everything needed to create a cluster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    pub num_workers: i32,
    pub use_registry: bool,
    pub registry_name: Option<String>,
    pub registry_port: Option<String>,
    pub registry_volume: Option<String>,
    /// Use the registry as a Docker Hub pull-through cache
    pub cache_hub: bool,
    pub api_address: ApiAddress,
    pub image: Option<String>,
    /// Extra k3s server flags
    pub server_args: Vec<String>,
    /// Host path → container path
    pub volumes: BTreeMap<String, String>,
    pub charts: Vec<Chart>,
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Enable the local registry at a `name:port` address (empty: defaults)
    pub fn with_registry(mut self, address: &str) -> Result<Self, ClusterError> {
        self.use_registry = true;
        if let Some((name, port)) = parse_registry(address)? {
            self.registry_name = Some(name);
            self.registry_port = Some(port);
        }
        Ok(self)
    }
}

pub fn validate_name(name: &str) -> Result<(), ClusterError> {
    if name.is_empty() {
        return Err(ClusterError::EmptyClusterName);
    }
    if name.contains(FORBIDDEN_NAME_CHARS) || name.chars().any(char::is_whitespace) {
        return Err(ClusterError::InvalidClusterName(name.to_string()));
    }
    Ok(())
}

/// Split a `registry:5000` address; an empty string means no registry
pub fn parse_registry(address: &str) -> Result<Option<(String, String)>, ClusterError> {
    if address.is_empty() {
        return Ok(None);
    }

    let mut parts = address.split(':');
    let (Some(name), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ClusterError::RegistryInvalid("invalid format for registry".into()));
    };
    if name.is_empty() {
        return Err(ClusterError::RegistryInvalid("no registry name specified".into()));
    }
    if port.is_empty() {
        return Err(ClusterError::RegistryInvalid("no registry port specified".into()));
    }

    Ok(Some((name.to_string(), port.to_string())))
}

/// Random default name like `k3s-cluster-209`
pub fn generate_cluster_name() -> String {
    format!("k3s-cluster-{}", rand::rng().random_range(0..1000))
}

/// Server arguments given as a single whitespace-separated string
pub fn split_server_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// A port in `[start, end)` that nothing is bound to right now
///
/// Check-then-bind: another process may take the port before k3d binds it.
pub fn find_unused_port_in_range(start: u16, end: u16) -> Option<u16> {
    if end <= start {
        return None;
    }

    let mut rng = rand::rng();
    (start..end)
        .map(|_| rng.random_range(start..end))
        .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
}

/// What the status endpoint reports for a cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub name: String,
    pub image: Option<String>,
    pub status: ClusterStatus,
}

pub struct Cluster {
    spec: ClusterSpec,
    ctx: Arc<Context>,
    status: Mutex<ClusterStatus>,
    api_address: Mutex<ApiAddress>,
    kubeconfig: OnceCell<String>,
    docker_created_at: OnceCell<String>,
    server_ip: OnceCell<String>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.spec.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Cluster {
    /// Validate `spec` for a cluster that does not exist yet
    pub fn new(spec: ClusterSpec, ctx: Arc<Context>) -> Result<Self, ClusterError> {
        validate_name(&spec.name)?;
        if spec.num_workers < 0 {
            return Err(ClusterError::InvalidNumWorkers(spec.num_workers));
        }

        let api_address = spec.api_address.clone();
        Ok(Self {
            spec,
            ctx,
            status: Mutex::new(ClusterStatus::Provisioning),
            api_address: Mutex::new(api_address),
            kubeconfig: OnceCell::new(),
            docker_created_at: OnceCell::new(),
            server_ip: OnceCell::new(),
        })
    }

    /// An existing cluster, as seen in `k3d list`
    pub fn from_listed(listed: ListedCluster, ctx: Arc<Context>) -> Result<Self, ClusterError> {
        let mut spec = ClusterSpec::new(listed.name);
        spec.image = Some(listed.image).filter(|i| !i.is_empty());

        let cluster = Self::new(spec, ctx)?;
        cluster.set_status(ClusterStatus::from_listed(&listed.status));
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn image(&self) -> Option<&str> {
        self.spec.image.as_deref()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ClusterStatus::Destroyed)
    }

    fn set_status(&self, status: ClusterStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == ClusterStatus::Running
    }

    pub fn is_destroyed(&self) -> bool {
        self.status() == ClusterStatus::Destroyed
    }

    /// The API address, with the port filled in once creation picked one
    pub fn api_address(&self) -> ApiAddress {
        self.api_address
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            status: self.status(),
        }
    }

    /// `k3d create` arguments; writes chart manifests and claims a port
    fn build_args(&self, wait: bool) -> Result<Vec<String>, ClusterError> {
        let spec = &self.spec;
        let settings = &self.ctx.settings;
        let mut args = vec![format!("--name={}", spec.name)];

        if spec.use_registry {
            args.push("--enable-registry".to_string());
            if spec.cache_hub {
                args.push("--enable-registry-cache".to_string());
            }
            if let Some(volume) = &spec.registry_volume {
                args.push(format!("--registry-volume={volume}"));
            }
            if let Some(name) = &spec.registry_name {
                args.push(format!("--registry-name={name}"));
            }
            if let Some(port) = &spec.registry_port {
                args.push(format!("--registry-port={port}"));
            }
        }

        if wait {
            args.push(format!("--wait={}", settings.wait_secs));
        }

        if spec.num_workers > 0 {
            args.push(format!("--workers={}", spec.num_workers));
        }

        if let Some(image) = &spec.image {
            args.push(format!("--image={image}"));
        }

        // every cluster gets its own DNS domain
        args.push(format!("--server-arg=--cluster-domain={}.local", spec.name));
        args.extend(spec.server_args.iter().map(|a| format!("--server-arg={a}")));

        for (src, dst) in &spec.volumes {
            args.push(format!("--volume={src}:{dst}"));
        }

        for chart in &spec.charts {
            let src = self.ctx.charts.materialize(&spec.name, chart)?;
            args.push(format!("--volume={}:{}", src.display(), chart.mount_path()));
        }

        let mut address = self.api_address();
        if address.is_auto() {
            let (start, end) = settings.api_port_range;
            address.port = find_unused_port_in_range(start, end)
                .ok_or(ClusterError::NoFreePort { start, end })?;
            debug!(port = address.port, "Picked API port");
            if let Ok(mut current) = self.api_address.lock() {
                *current = address.clone();
            }
        }
        args.push(format!("--api-port={address}"));

        Ok(args)
    }

    async fn provision(&self, wait: bool) -> Result<(), ClusterError> {
        let args = self.build_args(wait)?;
        info!(args = ?args, "Creating cluster");

        let mut lines = self.ctx.provisioner.create(args)?;
        while let Some(line) = lines.next().await {
            let line = line?;
            debug!("[k3d] {}", line);
            if line.contains(FATAL_MARKER) {
                // dropping `lines` kills k3d
                return Err(ClusterError::ClusterCreation(line.trim().to_string()));
            }
        }
        Ok(())
    }

    /// Create the cluster with `k3d create`
    ///
    /// On any failure the scratch directory is removed and the cluster is
    /// marked destroyed, so the object cannot be reused.
    #[instrument(skip(self), fields(cluster = %self.spec.name))]
    pub async fn create(&self, wait: bool) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed(self.spec.name.clone()));
        }

        if let Err(e) = self.provision(wait).await {
            warn!(error = %e, "Cluster creation failed, cleaning up");
            self.cleanup();
            self.set_status(ClusterStatus::Destroyed);
            return Err(e);
        }

        info!("The cluster has been created");
        self.set_status(ClusterStatus::Running);
        self.ctx
            .events
            .publish(ClusterEvent::Created(self.spec.name.clone()));
        Ok(())
    }

    /// Destroy the cluster with `k3d delete`, keeping the registry volume
    ///
    /// Cleanup and the destroyed flag happen whether or not `k3d delete`
    /// succeeds; its error is still returned.
    #[instrument(skip(self), fields(cluster = %self.spec.name))]
    pub async fn destroy(&self) -> Result<(), ClusterError> {
        if self.spec.name.is_empty() {
            return Err(ClusterError::EmptyClusterName);
        }
        if self.is_destroyed() {
            return Err(ClusterError::ClusterDestruction(self.spec.name.clone()));
        }

        info!("Destroying cluster");
        let result = self.ctx.provisioner.delete(&self.spec.name).await;

        self.cleanup();
        self.set_status(ClusterStatus::Destroyed);

        result?;
        self.ctx
            .events
            .publish(ClusterEvent::Destroyed(self.spec.name.clone()));
        Ok(())
    }

    pub async fn start(&self) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed(self.spec.name.clone()));
        }
        self.ctx.provisioner.start(&self.spec.name).await?;
        self.set_status(ClusterStatus::Running);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed(self.spec.name.clone()));
        }
        self.ctx.provisioner.stop(&self.spec.name).await?;
        self.set_status(ClusterStatus::Stopped);
        Ok(())
    }

    fn cleanup(&self) {
        debug!(cluster = %self.spec.name, "Cleaning up");
        if let Err(e) = self.ctx.charts.cleanup(&self.spec.name) {
            warn!(cluster = %self.spec.name, error = %e, "Could not remove scratch directory");
        }
    }

    /// Path to this cluster's kubeconfig
    ///
    /// k3d reports "not ready" until the control plane is up, so this polls
    /// with the configured attempt budget. The first path obtained is kept
    /// for the life of the cluster.
    pub async fn kubeconfig(&self) -> Option<String> {
        if self.is_destroyed() {
            return None;
        }

        let name = &self.spec.name;
        let attempts = self.ctx.settings.kubeconfig_attempts;
        let delay = self.ctx.settings.kubeconfig_retry_delay;

        let fetched = self
            .kubeconfig
            .get_or_try_init(|| async {
                for attempt in 1..=attempts {
                    match self.ctx.provisioner.get_kubeconfig(name).await {
                        Ok(Some(path)) => {
                            debug!(cluster = %name, path = %path, "Obtained kubeconfig");
                            return Ok(path);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(cluster = %name, attempt, error = %e, "Kubeconfig not ready yet");
                            if attempt < attempts {
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                }
                Err(ClusterError::NoKubeconfigObtained(name.clone()))
            })
            .await;

        match fetched {
            Ok(path) => Some(path.clone()),
            Err(e) => {
                warn!(error = %e, "Giving up on kubeconfig");
                None
            }
        }
    }

    /// `k3d-<name>-server`; `None` once destroyed
    pub fn docker_server_name(&self) -> Option<String> {
        (!self.is_destroyed()).then(|| format!("{DOCKER_PREFIX}-{}-server", self.spec.name))
    }

    /// `k3d-<name>`; `None` once destroyed
    pub fn docker_network_name(&self) -> Option<String> {
        (!self.is_destroyed()).then(|| format!("{DOCKER_PREFIX}-{}", self.spec.name))
    }

    /// IP of the server container in the cluster network
    ///
    /// `Ok(None)` when there is no server container. A container without an
    /// IP in the expected network is an inconsistency, reported as
    /// [`ClusterError::NoServer`].
    pub async fn server_ip(&self) -> Result<Option<String>, ClusterError> {
        let (Some(container), Some(network)) = (self.docker_server_name(), self.docker_network_name())
        else {
            return Ok(None);
        };
        if let Some(ip) = self.server_ip.get() {
            return Ok(Some(ip.clone()));
        }

        let Some(info) = self.ctx.inspector.find_by_name(&container).await? else {
            debug!(container = %container, "No server container");
            return Ok(None);
        };

        let ip = info
            .ip_address(&network)
            .ok_or(ClusterError::NoServer { container, network })?
            .to_string();
        let _ = self.server_ip.set(ip.clone());
        Ok(Some(ip))
    }

    /// Creation time of the server container
    pub async fn docker_created_at(&self) -> Option<String> {
        let container = self.docker_server_name()?;
        let fetched = self
            .docker_created_at
            .get_or_try_init(|| async {
                match self.ctx.inspector.find_by_name(&container).await {
                    Ok(Some(info)) => Ok(info.created_at().to_string()),
                    Ok(None) => Err(None),
                    Err(e) => Err(Some(e)),
                }
            })
            .await;

        match fetched {
            Ok(created) => Some(created.clone()),
            Err(Some(e)) => {
                debug!(container = %container, error = %e, "Could not inspect server container");
                None
            }
            Err(None) => None,
        }
    }

    pub async fn dashboard_url(&self) -> Option<String> {
        match self.server_ip().await {
            Ok(ip) => ip.map(|ip| format!("https://{ip}/")),
            Err(e) => {
                debug!(cluster = %self.spec.name, error = %e, "No dashboard URL");
                None
            }
        }
    }

    /// Whether the dashboard answers; certificates are not verified
    pub async fn check_dashboard(&self) -> bool {
        let Some(url) = self.dashboard_url().await else {
            return false;
        };

        match self.ctx.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Dashboard not ready");
                false
            }
        }
    }

    /// Environment for hook scripts, all values as strings
    ///
    /// `KEHTO_REGISTRY_ENABLED` is `True` or `False`, capitalised, so
    /// existing hook scripts comparing against those words keep working.
    pub async fn script_environment(&self) -> BTreeMap<String, String> {
        let key = |suffix: &str| format!("{ENV_PREFIX}_{suffix}");

        let mut env = BTreeMap::from([
            (key("CLUSTER_NAME"), self.spec.name.clone()),
            (key("REGISTRY_ENABLED"), String::new()),
            (key("REGISTRY_NAME"), String::new()),
            (key("REGISTRY_PORT"), String::new()),
            (key("MASTER_IP"), String::new()),
            (key("KUBECONFIG"), String::new()),
        ]);
        if self.is_destroyed() {
            return env;
        }

        let registry_enabled = if self.spec.use_registry { "True" } else { "False" };
        env.insert(key("REGISTRY_ENABLED"), registry_enabled.to_string());
        if self.spec.use_registry {
            env.insert(key("REGISTRY_NAME"), self.spec.registry_name.clone().unwrap_or_default());
            env.insert(key("REGISTRY_PORT"), self.spec.registry_port.clone().unwrap_or_default());
        }
        if let Ok(Some(ip)) = self.server_ip().await {
            env.insert(key("MASTER_IP"), ip);
        }
        if let Some(path) = self.kubeconfig().await {
            env.insert(key("KUBECONFIG"), path);
        }
        env
    }
}

#[cfg(test)]
#[path = "cluster_test.rs"]
mod tests;

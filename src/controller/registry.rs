use crate::cluster::{Cluster, ClusterError, ClusterSpec, ClusterSummary};
use crate::config::ENV_PREFIX;
use crate::context::Context;
use crate::events::ClusterEvent;
use crate::hook::run_hook;
use crate::k3d::parse_list;
use crate::kubeconfig::{CredentialsError, MergeOutcome};
use crate::notify::Notification;
use crate::server::{SharedMetrics, ShutdownSignal};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

type ClusterMap = BTreeMap<String, Arc<Cluster>>;

/// Shortest period accepted by `spawn_periodic`
const MIN_REFRESH_PERIOD: Duration = Duration::from_millis(1);

/// What readers see: the result of the last completed pass
#[derive(Default)]
struct Snapshot {
    clusters: ClusterMap,
    active: Option<Arc<Cluster>>,
}

pub struct ClusterRegistry {
    ctx: Arc<Context>,
    metrics: Option<SharedMetrics>,
    /// Held for a whole reconciliation pass or active switch
    pass: tokio::sync::Mutex<()>,
    /// Only written while `pass` is held
    snapshot: RwLock<Snapshot>,
}

impl ClusterRegistry {
    pub fn new(ctx: Arc<Context>, metrics: Option<SharedMetrics>) -> Self {
        Self {
            ctx,
            metrics,
            pass: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// The unified kubeconfig every cluster is merged into
    pub fn kubeconfig(&self) -> &Path {
        &self.ctx.settings.kubeconfig
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn active(&self) -> Option<Arc<Cluster>> {
        self.read().active.clone()
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.read().clusters.values().cloned().collect()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.read().clusters.keys().cloned().collect()
    }

    pub fn get_cluster_by_name(&self, name: &str) -> Option<Arc<Cluster>> {
        self.read().clusters.get(name).cloned()
    }

    pub fn summaries(&self) -> Vec<ClusterSummary> {
        self.read().clusters.values().map(|c| c.summary()).collect()
    }

    /// Switch the active cluster
    ///
    /// `None` clears it. A name we do not manage (e.g. a context switched
    /// externally to some other cluster) also clears it. A failed switch
    /// leaves the active cluster as it was.
    pub async fn set_active(&self, name: Option<&str>) {
        let _pass = self.pass.lock().await;

        let (clusters, current) = {
            let snapshot = self.read();
            (snapshot.clusters.clone(), snapshot.active.clone())
        };

        let (active, event) = self.resolve_active(&clusters, current, name).await;
        self.write().active = active;
        if let Some(event) = event {
            self.ctx.events.publish(event);
        }
    }

    /// Decide the active cluster for `clusters`, switching the current
    /// context when it changes. Returns the change event to publish, if any.
    async fn resolve_active(
        &self,
        clusters: &ClusterMap,
        current: Option<Arc<Cluster>>,
        wanted: Option<&str>,
    ) -> (Option<Arc<Cluster>>, Option<ClusterEvent>) {
        let cleared = |current: &Option<Arc<Cluster>>| {
            current
                .is_some()
                .then_some(ClusterEvent::ActiveChanged(None))
        };

        let Some(name) = wanted else {
            if !clusters.is_empty() {
                debug!("No active cluster");
            }
            return (None, cleared(&current));
        };

        let Some(cluster) = clusters.get(name) else {
            info!(cluster = %name, "Active cluster is not known: probably not a k3d cluster");
            return (None, cleared(&current));
        };

        if current.as_ref().is_some_and(|c| c.name() == name) {
            debug!(cluster = %name, "No need to switch cluster: it is the same");
            return (Some(cluster.clone()), None);
        }

        info!(cluster = %name, "Switching to cluster");
        match self
            .ctx
            .credentials
            .set_current_context(name, self.kubeconfig())
            .await
        {
            Ok(()) => (
                Some(cluster.clone()),
                Some(ClusterEvent::ActiveChanged(Some(name.to_string()))),
            ),
            Err(e) => {
                error!(cluster = %name, error = %e, "Could not switch cluster");
                // keep the old one, as long as it still exists
                match current.and_then(|c| clusters.get(c.name()).cloned()) {
                    Some(kept) => (Some(kept), None),
                    None => (None, None),
                }
            }
        }
    }

    /// Parse `k3d list` into fresh cluster objects
    async fn list_clusters(&self) -> ClusterMap {
        let lines = match self.ctx.provisioner.list().await {
            Ok(lines) => lines,
            Err(e) => {
                // k3d fails when there are no clusters
                debug!(error = %e, "Listing clusters failed, assuming there are none");
                return ClusterMap::new();
            }
        };

        let mut clusters = ClusterMap::new();
        for listed in parse_list(&lines) {
            let name = listed.name.clone();
            match Cluster::from_listed(listed, self.ctx.clone()) {
                Ok(cluster) => {
                    clusters.insert(name, Arc::new(cluster));
                }
                Err(e) => {
                    warn!(cluster = %name, error = %e, "Ignoring listed cluster");
                    self.ctx.notifier.notify(Notification::error(
                        format!("{name} INTERNAL ERROR"),
                        format!("Could not parse cluster {name}: {e}"),
                    ));
                }
            }
        }
        clusters
    }

    /// Merge the kubeconfig of every cluster in `clusters` into the unified file
    async fn regenerate_kubeconfig(&self, clusters: &ClusterMap) -> Result<MergeOutcome, RegistryError> {
        info!(
            kubeconfig = %self.kubeconfig().display(),
            clusters = clusters.len(),
            "Regenerating kubeconfig"
        );

        let mut paths = Vec::with_capacity(clusters.len());
        for cluster in clusters.values() {
            let path = cluster
                .kubeconfig()
                .await
                .ok_or_else(|| ClusterError::NoKubeconfigObtained(cluster.name().to_string()))?;
            paths.push(PathBuf::from(path));
        }

        Ok(self
            .ctx
            .credentials
            .merge_into(&paths, self.kubeconfig())
            .await?)
    }

    /// One reconciliation pass against `k3d list`
    ///
    /// `is_initial` marks the first pass since startup: the current context
    /// found in the kubeconfig is respected and the file is always rebuilt.
    /// `force_activate` makes that cluster active if it exists afterwards.
    ///
    /// Always returns `true` (keep refreshing).
    #[instrument(skip(self))]
    pub async fn refresh(&self, is_initial: bool, force_activate: Option<&str>) -> bool {
        let _pass = self.pass.lock().await;
        let started = Instant::now();

        info!("Updating list of clusters");
        let latest = self.list_clusters().await;
        debug!(count = latest.len(), "Clusters obtained");

        let (previous_names, current) = {
            let snapshot = self.read();
            let names: Vec<String> = snapshot.clusters.keys().cloned().collect();
            (names, snapshot.active.clone())
        };

        let candidate = if let Some(forced) = force_activate {
            debug!(cluster = %forced, "Will activate forced cluster");
            Some(forced.to_string())
        } else if is_initial {
            let current_context = self.ctx.credentials.current_context(self.kubeconfig()).await;
            debug!(context = ?current_context, "First refresh: keeping the current context");
            current_context
        } else {
            current.as_ref().map(|c| c.name().to_string())
        };

        let names_changed = !latest.keys().eq(previous_names.iter());
        let regenerate = names_changed || is_initial || !self.kubeconfig().exists();
        let merged = if regenerate {
            self.regenerate_kubeconfig(&latest).await.map(Some)
        } else {
            Ok(None)
        };
        match &merged {
            Ok(Some(outcome)) => debug!(outcome = ?outcome, "Kubeconfig regenerated"),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Could not update kubeconfig"),
        }

        let wanted = match candidate.filter(|name| latest.contains_key(name)) {
            Some(name) => Some(name),
            None => self.ctx.credentials.current_context(self.kubeconfig()).await,
        };
        let (active, active_event) = self.resolve_active(&latest, current, wanted.as_deref()).await;

        let count = latest.len();
        {
            let mut snapshot = self.write();
            snapshot.clusters = latest;
            snapshot.active = active;
        }

        if let Some(event) = active_event {
            self.ctx.events.publish(event);
        }
        if names_changed || is_initial {
            self.ctx.events.publish(ClusterEvent::ClustersChanged(count));
        }

        if let Some(metrics) = &self.metrics {
            let elapsed = started.elapsed().as_secs_f64();
            match merged {
                Ok(_) => metrics.record_reconciliation_success(elapsed, count),
                Err(_) => metrics.record_reconciliation_error(elapsed, count),
            }
        }

        true
    }

    fn record_operation(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation, success);
        }
    }

    async fn run_post_hook(&self, cluster: &Cluster, action: &str, hook: &Path) {
        let name = cluster.name();
        self.ctx.notifier.notify(Notification::info(
            format!("Running post-{action} script"),
            format!("Running post-{action} script '{}' in the background.", hook.display()),
        ));

        let mut env = cluster.script_environment().await;
        env.insert(format!("{ENV_PREFIX}_ACTION"), action.to_string());

        if let Err(e) = run_hook(hook, &env, self.ctx.settings.scripts_timeout).await {
            warn!(cluster = %name, error = %e, "Post-{} script failed", action);
            self.ctx.notifier.notify(Notification::error(
                "Script error",
                format!("Cluster {name} post-{action} script failed: {e}."),
            ));
        }
    }

    /// Create a cluster and reconcile
    ///
    /// Failures are reported through the notifier, never returned. The
    /// cluster object is returned unless nothing could be attempted (Docker
    /// unreachable, invalid spec).
    pub async fn create(
        &self,
        spec: ClusterSpec,
        activate: bool,
        post_create_hook: Option<PathBuf>,
    ) -> Option<Arc<Cluster>> {
        let name = spec.name.clone();

        if !self.ctx.inspector.is_reachable().await {
            error!(cluster = %name, "Could not connect to Docker");
            self.ctx.notifier.notify(Notification::error(
                format!("{name} ERROR"),
                "Could not connect to Docker: check that it is installed, running and reachable.",
            ));
            self.record_operation("create", false);
            return None;
        }

        let cluster = match Cluster::new(spec, self.ctx.clone()) {
            Ok(cluster) => Arc::new(cluster),
            Err(e) => {
                self.ctx.notifier.notify(Notification::error(
                    format!("{name} ERROR"),
                    format!("Cluster {name} creation failed: {e}."),
                ));
                self.record_operation("create", false);
                return None;
            }
        };

        Some(self.create_cluster(cluster, activate, post_create_hook).await)
    }

    async fn create_cluster(
        &self,
        cluster: Arc<Cluster>,
        activate: bool,
        post_create_hook: Option<PathBuf>,
    ) -> Arc<Cluster> {
        let name = cluster.name().to_string();
        self.ctx.notifier.notify(Notification::info(
            format!("{name} CREATING..."),
            format!("{name} is being created in the background"),
        ));

        let created = cluster.create(true).await;
        match &created {
            Ok(()) => {
                let server = cluster
                    .dashboard_url()
                    .await
                    .unwrap_or_else(|| "(unknown)".to_string());
                self.ctx.notifier.notify(Notification::info(
                    format!("{name} CREATED"),
                    format!("{name} has been successfully created. Server is available at {server}"),
                ));
            }
            Err(e) => {
                self.ctx.notifier.notify(Notification::error(
                    format!("{name} ERROR"),
                    format!("Cluster {name} creation failed: {e}."),
                ));
            }
        }
        self.record_operation("create", created.is_ok());

        // a failed cluster will not be listed, so activation is skipped then
        self.refresh(false, activate.then_some(name.as_str())).await;

        // the post-create hook only runs after a successful creation
        if let (Ok(()), Some(hook)) = (&created, post_create_hook) {
            self.run_post_hook(&cluster, "create", &hook).await;
        }

        cluster
    }

    /// Destroy the cluster called `name` and reconcile; unknown names are ignored
    pub async fn destroy(&self, name: &str, post_destroy_hook: Option<PathBuf>) {
        let Some(cluster) = self.get_cluster_by_name(name) else {
            debug!(cluster = %name, "Not destroying unknown cluster");
            return;
        };

        self.ctx.notifier.notify(Notification::info(
            format!("{name} DESTROYING..."),
            format!("{name} is being destroyed in the background"),
        ));

        let destroyed = cluster.destroy().await;
        match &destroyed {
            Ok(()) => self.ctx.notifier.notify(Notification::info(
                format!("{name} DESTROYED"),
                format!("{name} has been destroyed."),
            )),
            Err(e) => self.ctx.notifier.notify(Notification::error(
                format!("{name} ERROR"),
                format!("Cluster {name} destruction failed: {e}."),
            )),
        }
        self.record_operation("destroy", destroyed.is_ok());

        self.refresh(false, None).await;

        if let Some(hook) = post_destroy_hook {
            self.run_post_hook(&cluster, "destroy", &hook).await;
        }
    }

    /// Validate `spec` now, then create in the background
    pub fn spawn_create(
        self: &Arc<Self>,
        spec: ClusterSpec,
        activate: bool,
        post_create_hook: Option<PathBuf>,
    ) -> Result<JoinHandle<Option<Arc<Cluster>>>, ClusterError> {
        let cluster = Arc::new(Cluster::new(spec, self.ctx.clone())?);
        let registry = Arc::clone(self);

        Ok(tokio::spawn(async move {
            if !registry.ctx.inspector.is_reachable().await {
                let name = cluster.name();
                error!(cluster = %name, "Could not connect to Docker");
                registry.ctx.notifier.notify(Notification::error(
                    format!("{name} ERROR"),
                    "Could not connect to Docker: check that it is installed, running and reachable.",
                ));
                registry.record_operation("create", false);
                return None;
            }
            Some(registry.create_cluster(cluster, activate, post_create_hook).await)
        }))
    }

    pub fn spawn_destroy(
        self: &Arc<Self>,
        name: impl Into<String>,
        post_destroy_hook: Option<PathBuf>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let name = name.into();
        tokio::spawn(async move { registry.destroy(&name, post_destroy_hook).await })
    }

    /// Reconcile every `period` until `shutdown` fires
    ///
    /// The first pass happens one period from now; run the initial pass
    /// explicitly before starting this.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        // interval_at panics on a zero period
        let period = period.max(MIN_REFRESH_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(period_secs = period.as_secs_f64(), "Starting periodic reconciliation");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.refresh(false, None).await;
                    }
                    _ = shutdown.wait() => {
                        info!("Periodic reconciliation shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;

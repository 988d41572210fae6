use crate::chart::{ChartMaterializer, HelmChartWriter};
use crate::config::Settings;
use crate::docker::{ContainerInspector, DockerCli};
use crate::events::EventBus;
use crate::k3d::{K3dCli, Provisioner};
use crate::kubeconfig::{CredentialsStore, KubectlCli};
use crate::notify::{self, SharedNotifier};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for dashboard reachability checks
const DASHBOARD_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a cluster and the registry need to talk to the outside world
pub struct Context {
    pub settings: Settings,
    pub provisioner: Arc<dyn Provisioner>,
    pub inspector: Arc<dyn ContainerInspector>,
    pub charts: Arc<dyn ChartMaterializer>,
    pub credentials: CredentialsStore,
    pub notifier: SharedNotifier,
    pub events: EventBus,
    /// Accepts self-signed certificates, for dashboard reachability checks only
    pub http: reqwest::Client,
}

impl Context {
    /// CLI-backed collaborators for the tools resolved in `settings`
    pub fn new(settings: Settings, events: EventBus) -> Result<Self, reqwest::Error> {
        let docker_env = settings.docker_env();
        Ok(Context {
            provisioner: Arc::new(K3dCli::new(&settings.tools.k3d, docker_env.clone())),
            inspector: Arc::new(DockerCli::new(&settings.tools.docker, docker_env)),
            charts: Arc::new(HelmChartWriter::in_cache_dir(&settings.cache_dir)),
            credentials: CredentialsStore::new(Arc::new(KubectlCli::new(&settings.tools.kubectl))),
            notifier: notify::from_settings(settings.notify_webhook_url.as_deref()),
            events,
            http: insecure_client()?,
            settings,
        })
    }
}

pub fn insecure_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(DASHBOARD_CHECK_TIMEOUT)
        .build()
}

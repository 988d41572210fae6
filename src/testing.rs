//! In-memory stand-ins for the external tools

use crate::chart::HelmChartWriter;
use crate::config::{Settings, Tools};
use crate::context::{insecure_client, Context};
use crate::docker::{ContainerInfo, ContainerInspector, EndpointSettings, InspectError};
use crate::events::{ClusterEvent, EventBus, EventReceiver};
use crate::k3d::Provisioner;
use crate::kubeconfig::{ContextTool, CredentialsStore};
use crate::notify::{Level, Notification, Notifier};
use crate::process::{LineStream, ProcessError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::config::Kubeconfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn exit_error(program: &str, stderr: &str) -> ProcessError {
    ProcessError::Exit {
        program: program.to_string(),
        exit_code: Some(1),
        stderr: stderr.to_string(),
    }
}

/// A kubeconfig with one cluster, user and context, all called `name`
pub fn kubeconfig_yaml(name: &str, server: &str) -> String {
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": name, "cluster": {"server": server}}],
        "users": [{"name": name, "user": {"token": format!("token-{name}")}}],
        "contexts": [{"name": name, "context": {"cluster": name, "user": name}}],
        "current-context": name,
        "preferences": {},
    });
    serde_yaml::to_string(&doc).unwrap()
}

#[derive(Default)]
struct K3dState {
    /// name → status, in listing order
    clusters: BTreeMap<String, String>,
    create_output: Vec<String>,
    create_exit_error: bool,
    delete_fails: bool,
    /// Remaining `get-kubeconfig` failures per cluster
    kubeconfig_failures: BTreeMap<String, u32>,
    kubeconfig_calls: BTreeMap<String, u32>,
    created_args: Vec<Vec<String>>,
    deleted: Vec<String>,
}

/// Fake `k3d`; every listed cluster has a kubeconfig file under `root`
pub struct FakeProvisioner {
    root: PathBuf,
    state: Mutex<K3dState>,
}

impl FakeProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(K3dState::default()),
        }
    }

    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join("kubeconfig.yaml")
    }

    fn write_kubeconfig(&self, name: &str) {
        let path = self.kubeconfig_path(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, kubeconfig_yaml(name, "https://127.0.0.1:6443")).unwrap();
    }

    /// Make `name` show up in `list` as if created outside the controller
    pub fn add_cluster(&self, name: &str, status: &str) {
        self.write_kubeconfig(name);
        self.state
            .lock()
            .unwrap()
            .clusters
            .insert(name.to_string(), status.to_string());
    }

    pub fn remove_cluster(&self, name: &str) {
        self.state.lock().unwrap().clusters.remove(name);
    }

    /// Lines printed by the next `create` calls
    pub fn set_create_output(&self, lines: &[&str]) {
        self.state.lock().unwrap().create_output = lines.iter().map(|l| l.to_string()).collect();
    }

    pub fn fail_create_exit(&self) {
        self.state.lock().unwrap().create_exit_error = true;
    }

    pub fn fail_delete(&self) {
        self.state.lock().unwrap().delete_fails = true;
    }

    /// `get-kubeconfig` fails `times` times for `name` before succeeding
    pub fn fail_kubeconfig(&self, name: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .kubeconfig_failures
            .insert(name.to_string(), times);
    }

    pub fn kubeconfig_calls(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .kubeconfig_calls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn created_args(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().created_args.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn status_of(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().clusters.get(name).cloned()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn list(&self) -> Result<Vec<String>, ProcessError> {
        let state = self.state.lock().unwrap();
        if state.clusters.is_empty() {
            return Err(exit_error("k3d", "No clusters found!"));
        }

        let border = "+------+-------+--------+---------+".to_string();
        let mut lines = vec![
            border.clone(),
            "| NAME | IMAGE | STATUS | WORKERS |".to_string(),
            border.clone(),
        ];
        for (name, status) in &state.clusters {
            lines.push(format!(
                "| {name} | docker.io/rancher/k3s:v1.17.3-k3s1 | {status} | 0/0 |"
            ));
        }
        lines.push(border);
        Ok(lines)
    }

    fn create(&self, args: Vec<String>) -> Result<LineStream, ProcessError> {
        let name = args
            .iter()
            .find_map(|a| a.strip_prefix("--name="))
            .unwrap_or_default()
            .to_string();

        let mut state = self.state.lock().unwrap();
        state.created_args.push(args);

        let output = state.create_output.clone();
        let fatal = output.iter().any(|l| l.contains("level=fatal"));
        let mut items: Vec<Result<String, ProcessError>> = output.into_iter().map(Ok).collect();

        if state.create_exit_error {
            items.push(Err(exit_error("k3d", "create failed")));
        } else if !fatal {
            state.clusters.insert(name.clone(), "running".to_string());
            drop(state);
            self.write_kubeconfig(&name);
        }

        Ok(stream::iter(items).boxed())
    }

    async fn delete(&self, name: &str) -> Result<(), ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(name.to_string());
        if state.delete_fails {
            return Err(exit_error("k3d", "delete failed"));
        }
        state.clusters.remove(name);
        Ok(())
    }

    async fn get_kubeconfig(&self, name: &str) -> Result<Option<String>, ProcessError> {
        let mut state = self.state.lock().unwrap();
        *state.kubeconfig_calls.entry(name.to_string()).or_default() += 1;

        if let Some(remaining) = state.kubeconfig_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(exit_error("k3d", "cluster not ready"));
            }
        }
        if !state.clusters.contains_key(name) {
            return Err(exit_error("k3d", "no such cluster"));
        }
        Ok(Some(self.kubeconfig_path(name).display().to_string()))
    }

    async fn start(&self, name: &str) -> Result<(), ProcessError> {
        let mut state = self.state.lock().unwrap();
        match state.clusters.get_mut(name) {
            Some(status) => {
                *status = "running".to_string();
                Ok(())
            }
            None => Err(exit_error("k3d", "no such cluster")),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), ProcessError> {
        let mut state = self.state.lock().unwrap();
        match state.clusters.get_mut(name) {
            Some(status) => {
                *status = "stopped".to_string();
                Ok(())
            }
            None => Err(exit_error("k3d", "no such cluster")),
        }
    }
}

/// Fake `kubectl` working on real files
#[derive(Default)]
pub struct FakeKubectl {
    fail_use_context: Mutex<bool>,
    use_context_calls: Mutex<Vec<String>>,
}

impl FakeKubectl {
    pub fn fail_use_context(&self, fail: bool) {
        *self.fail_use_context.lock().unwrap() = fail;
    }

    pub fn use_context_calls(&self) -> Vec<String> {
        self.use_context_calls.lock().unwrap().clone()
    }

    fn load(kubeconfig: &Path) -> Result<serde_yaml::Value, ProcessError> {
        let raw = std::fs::read_to_string(kubeconfig)
            .map_err(|e| exit_error("kubectl", &e.to_string()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| exit_error("kubectl", &e.to_string()))?;
        Ok(value)
    }
}

#[async_trait]
impl ContextTool for FakeKubectl {
    async fn view_merged(&self, search_path: &str) -> Result<String, ProcessError> {
        let mut merged: Option<Kubeconfig> = None;
        for path in std::env::split_paths(search_path) {
            let next = Kubeconfig::read_from(&path).map_err(|e| exit_error("kubectl", &e.to_string()))?;
            merged = Some(match merged {
                Some(current) => current
                    .merge(next)
                    .map_err(|e| exit_error("kubectl", &e.to_string()))?,
                None => next,
            });
        }
        let merged = merged.ok_or_else(|| exit_error("kubectl", "nothing to merge"))?;
        serde_yaml::to_string(&merged).map_err(|e| exit_error("kubectl", &e.to_string()))
    }

    async fn current_context(&self, kubeconfig: &Path) -> Result<Option<String>, ProcessError> {
        let value = Self::load(kubeconfig)?;
        match value.get("current-context").and_then(|c| c.as_str()) {
            Some(name) if !name.is_empty() => Ok(Some(name.to_string())),
            _ => Err(exit_error("kubectl", "error: current-context is not set")),
        }
    }

    async fn use_context(&self, name: &str, kubeconfig: &Path) -> Result<(), ProcessError> {
        self.use_context_calls.lock().unwrap().push(name.to_string());
        if *self.fail_use_context.lock().unwrap() {
            return Err(exit_error("kubectl", "use-context failed"));
        }

        let mut value = Self::load(kubeconfig)?;
        let known = value
            .get("contexts")
            .and_then(|c| c.as_sequence())
            .map(|contexts| {
                contexts
                    .iter()
                    .any(|c| c.get("name").and_then(|n| n.as_str()) == Some(name))
            })
            .unwrap_or(false);
        if !known {
            return Err(exit_error("kubectl", &format!("no context exists with the name: {name:?}")));
        }

        if let Some(map) = value.as_mapping_mut() {
            map.insert("current-context".into(), name.into());
        }
        let raw = serde_yaml::to_string(&value).map_err(|e| exit_error("kubectl", &e.to_string()))?;
        std::fs::write(kubeconfig, raw).map_err(|e| exit_error("kubectl", &e.to_string()))
    }
}

/// Fake Docker daemon holding a fixed set of containers
pub struct FakeDocker {
    reachable: Mutex<bool>,
    containers: Mutex<BTreeMap<String, ContainerInfo>>,
    lookups: Mutex<u32>,
}

impl Default for FakeDocker {
    fn default() -> Self {
        Self {
            reachable: Mutex::new(true),
            containers: Mutex::new(BTreeMap::new()),
            lookups: Mutex::new(0),
        }
    }
}

impl FakeDocker {
    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().unwrap() = reachable;
    }

    /// Add a running container attached to `network` with `ip` (may be empty)
    pub fn add_container(&self, name: &str, network: &str, ip: &str) {
        let mut info = ContainerInfo {
            id: format!("id-{name}"),
            name: format!("/{name}"),
            created: "2020-04-12T10:03:11Z".to_string(),
            ..Default::default()
        };
        info.state.running = true;
        info.network_settings.networks.insert(
            network.to_string(),
            EndpointSettings {
                ip_address: ip.to_string(),
            },
        );
        self.containers.lock().unwrap().insert(name.to_string(), info);
    }

    pub fn lookups(&self) -> u32 {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl ContainerInspector for FakeDocker {
    async fn is_reachable(&self) -> bool {
        *self.reachable.lock().unwrap()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>, InspectError> {
        *self.lookups.lock().unwrap() += 1;
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|n| n.level == Level::Error)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

/// A full set of fakes wired into a [`Context`]
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub provisioner: Arc<FakeProvisioner>,
    pub kubectl: Arc<FakeKubectl>,
    pub docker: Arc<FakeDocker>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: Arc<Context>,
    pub events: EventReceiver,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(customize: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut settings = Settings::new(
            dir.path().join("kube").join("config"),
            dir.path().join("cache"),
            Tools::from_path(),
        );
        settings.kubeconfig_retry_delay = Duration::from_millis(1);
        settings.refresh_interval = Duration::from_millis(50);
        customize(&mut settings);

        let provisioner = Arc::new(FakeProvisioner::new(dir.path().join("k3d")));
        let kubectl = Arc::new(FakeKubectl::default());
        let docker = Arc::new(FakeDocker::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (bus, events) = EventBus::new();

        let ctx = Arc::new(Context {
            provisioner: provisioner.clone(),
            inspector: docker.clone(),
            charts: Arc::new(HelmChartWriter::in_cache_dir(&settings.cache_dir)),
            credentials: CredentialsStore::new(kubectl.clone()),
            notifier: notifier.clone(),
            events: bus,
            http: insecure_client().unwrap(),
            settings,
        });

        Self {
            dir,
            provisioner,
            kubectl,
            docker,
            notifier,
            ctx,
            events,
        }
    }

    pub fn unified_kubeconfig(&self) -> PathBuf {
        self.ctx.settings.kubeconfig.clone()
    }

    /// Every event published so far
    pub fn drain_events(&mut self) -> Vec<ClusterEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

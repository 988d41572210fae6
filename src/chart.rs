//! Add-on charts installed at cluster creation
//!
//! k3s applies every manifest found in its server manifests directory on
//! boot. A chart is rendered as a `HelmChart` resource into a per-cluster
//! scratch directory and volume-mounted there.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Directory inside the server container where k3s picks up manifests
pub const SERVER_MANIFESTS_DIR: &str = "/var/lib/rancher/k3s/server/manifests";

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("chart I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not render chart manifest: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// A chart to install through the k3s Helm controller
#[derive(Debug, Clone, PartialEq)]
pub struct Chart {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub repo: Option<String>,
    pub version: Option<String>,
    /// `--set` style values
    pub values: BTreeMap<String, String>,
    /// Raw YAML documents appended after the chart
    pub extra_manifests: Vec<String>,
}

impl Chart {
    pub fn new(name: impl Into<String>, chart: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chart: chart.into(),
            namespace: "default".to_string(),
            repo: None,
            version: None,
            values: BTreeMap::new(),
            extra_manifests: Vec::new(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn extra_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.extra_manifests.push(manifest.into());
        self
    }

    /// Kubernetes Dashboard exposed through the default ingress controller
    pub fn kubernetes_dashboard() -> Self {
        Chart::new("dashboard", "stable/kubernetes-dashboard")
            .namespace("kube-system")
            .value("enableSkipLogin", "true")
            .value("enableInsecureLogin", "true")
            .value("ingress.enabled", "true")
            .value(r"ingress.annotations.kubernetes\.io/ingress\.class", "traefik")
    }

    /// Where the rendered manifest is mounted in the server container
    pub fn mount_path(&self) -> String {
        format!("{SERVER_MANIFESTS_DIR}/{}.yaml", self.name)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartManifest<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: ManifestMetadata<'a>,
    spec: HelmChartSpec<'a>,
}

#[derive(Serialize)]
struct ManifestMetadata<'a> {
    name: &'a str,
    namespace: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartSpec<'a> {
    chart: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<&'a str>,
    set: &'a BTreeMap<String, String>,
    target_namespace: &'a str,
}

/// Render `chart` as a multi-document YAML manifest
pub fn render(chart: &Chart) -> Result<String, ChartError> {
    let manifest = HelmChartManifest {
        api_version: "helm.cattle.io/v1",
        kind: "HelmChart",
        metadata: ManifestMetadata {
            name: &chart.name,
            namespace: "kube-system",
        },
        spec: HelmChartSpec {
            chart: &chart.chart,
            version: chart.version.as_deref(),
            repo: chart.repo.as_deref(),
            set: &chart.values,
            target_namespace: &chart.namespace,
        },
    };

    let mut out = String::from("---\n");
    out.push_str(&serde_yaml::to_string(&manifest)?);
    for extra in &chart.extra_manifests {
        out.push_str("\n---\n");
        out.push_str(extra.trim_end());
        out.push('\n');
    }
    Ok(out)
}

/// Turns chart descriptors into files that can be mounted into a cluster
pub trait ChartMaterializer: Send + Sync {
    /// Write `chart` for cluster `owner`, returning the file path
    fn materialize(&self, owner: &str, chart: &Chart) -> Result<PathBuf, ChartError>;

    /// Remove everything generated for `owner`
    fn cleanup(&self, owner: &str) -> Result<(), ChartError>;
}

/// Writes charts under `<root>/<cluster>/<chart>.yaml`
pub struct HelmChartWriter {
    root: PathBuf,
}

impl HelmChartWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Conventional location under the application cache directory
    pub fn in_cache_dir(cache_dir: &Path) -> Self {
        Self::new(cache_dir.join("helm"))
    }

    pub fn dir_for(&self, owner: &str) -> PathBuf {
        self.root.join(owner)
    }
}

impl ChartMaterializer for HelmChartWriter {
    fn materialize(&self, owner: &str, chart: &Chart) -> Result<PathBuf, ChartError> {
        let dir = self.dir_for(owner);
        std::fs::create_dir_all(&dir).map_err(|source| ChartError::Io {
            path: dir.clone(),
            source,
        })?;

        let file = dir.join(format!("{}.yaml", chart.name));
        let contents = render(chart)?;
        std::fs::write(&file, &contents).map_err(|source| ChartError::Io {
            path: file.clone(),
            source,
        })?;

        debug!(chart = %chart.name, file = %file.display(), "Saved chart manifest");
        for line in contents.lines() {
            debug!(chart = %chart.name, "  {}", line);
        }

        Ok(file)
    }

    fn cleanup(&self, owner: &str) -> Result<(), ChartError> {
        let dir = self.dir_for(owner);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(owner = %owner, dir = %dir.display(), "Removed chart directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChartError::Io { path: dir, source }),
        }
    }
}

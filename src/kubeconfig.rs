//! Unified credentials file
//!
//! Every cluster has its own kubeconfig. They are merged into a single
//! file (the one users point their tools at) and the "current context" in
//! that file mirrors the active cluster.

use crate::process::{self, ProcessError};
use async_trait::async_trait;
use kube::config::Kubeconfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("cannot build a kubeconfig search path: {0}")]
    SearchPath(String),

    #[error("merged kubeconfig is not valid: {0}")]
    InvalidMerge(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The external context-management tool
#[async_trait]
pub trait ContextTool: Send + Sync {
    /// Merge and flatten every kubeconfig in `search_path` (`KUBECONFIG` syntax)
    async fn view_merged(&self, search_path: &str) -> Result<String, ProcessError>;

    /// Current context stored in `kubeconfig`, `None` when the tool prints nothing
    async fn current_context(&self, kubeconfig: &Path) -> Result<Option<String>, ProcessError>;

    /// Make `name` the current context in `kubeconfig`
    async fn use_context(&self, name: &str, kubeconfig: &Path) -> Result<(), ProcessError>;
}

/// `kubectl`-backed context tool
pub struct KubectlCli {
    kubectl: PathBuf,
}

impl KubectlCli {
    pub fn new(kubectl: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
        }
    }

    fn env_for(kubeconfig: impl Into<String>) -> Vec<(String, String)> {
        vec![("KUBECONFIG".to_string(), kubeconfig.into())]
    }
}

#[async_trait]
impl ContextTool for KubectlCli {
    async fn view_merged(&self, search_path: &str) -> Result<String, ProcessError> {
        process::run_output(
            &self.kubectl,
            ["config", "view", "--merge", "--flatten"],
            &Self::env_for(search_path),
        )
        .await
    }

    async fn current_context(&self, kubeconfig: &Path) -> Result<Option<String>, ProcessError> {
        let lines = process::run_collect(
            &self.kubectl,
            ["config", "current-context"],
            &Self::env_for(kubeconfig.display().to_string()),
        )
        .await?;

        Ok(lines.into_iter().find(|l| !l.is_empty()))
    }

    async fn use_context(&self, name: &str, kubeconfig: &Path) -> Result<(), ProcessError> {
        process::run_collect(
            &self.kubectl,
            ["config", "use-context", name],
            &Self::env_for(kubeconfig.display().to_string()),
        )
        .await?;
        Ok(())
    }
}

/// What a merge did to the destination file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New contents were written
    Written,
    /// Merged contents matched the file already on disk
    Unchanged,
    /// No kubeconfigs given: the file was emptied
    Truncated,
}

/// Merges per-cluster credentials and tracks the current context
#[derive(Clone)]
pub struct CredentialsStore {
    tool: Arc<dyn ContextTool>,
}

impl CredentialsStore {
    pub fn new(tool: Arc<dyn ContextTool>) -> Self {
        Self { tool }
    }

    /// Merge `paths` (in order) into `destination`
    ///
    /// The file is replaced atomically, so concurrent readers never see a
    /// partial write. An empty `paths` empties the file.
    #[instrument(skip(self, paths), fields(destination = %destination.display(), count = paths.len()))]
    pub async fn merge_into(
        &self,
        paths: &[PathBuf],
        destination: &Path,
    ) -> Result<MergeOutcome, CredentialsError> {
        if paths.is_empty() {
            info!("No kubeconfigs to merge, truncating");
            replace_file(destination, String::new()).await?;
            return Ok(MergeOutcome::Truncated);
        }

        let search_path = std::env::join_paths(paths)
            .map_err(|e| CredentialsError::SearchPath(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        let merged = self.tool.view_merged(&search_path).await?;

        let parsed = Kubeconfig::from_yaml(&merged)
            .map_err(|e| CredentialsError::InvalidMerge(e.to_string()))?;
        let contexts: Vec<&str> = parsed.contexts.iter().map(|c| c.name.as_str()).collect();
        debug!(contexts = ?contexts, "Merged kubeconfig");

        let current = tokio::fs::read_to_string(destination)
            .await
            .unwrap_or_default();
        if current.trim() == merged.trim() {
            debug!("No changes in kubeconfig, not rewriting it");
            return Ok(MergeOutcome::Unchanged);
        }

        debug!(
            old_lines = current.lines().count(),
            new_lines = merged.lines().count(),
            "Kubeconfig changed, replacing it"
        );
        replace_file(destination, merged).await?;
        Ok(MergeOutcome::Written)
    }

    /// Current context in `kubeconfig`
    ///
    /// With no clusters there is no current context and the tool fails;
    /// that is the normal state, so it maps to `None`.
    pub async fn current_context(&self, kubeconfig: &Path) -> Option<String> {
        match self.tool.current_context(kubeconfig).await {
            Ok(context) => context,
            Err(e) => {
                debug!(error = %e, "No current context (probably no clusters exist)");
                None
            }
        }
    }

    /// Make `name` the current context in `kubeconfig`. Not retried.
    pub async fn set_current_context(
        &self,
        name: &str,
        kubeconfig: &Path,
    ) -> Result<(), CredentialsError> {
        self.tool.use_context(name, kubeconfig).await.map_err(|e| {
            warn!(context = %name, error = %e, "Could not set the current context");
            CredentialsError::from(e)
        })
    }
}

/// `write_atomic` on the blocking thread pool
pub async fn replace_file(destination: &Path, contents: String) -> Result<(), CredentialsError> {
    let path = destination.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
        .await
        .map_err(|e| CredentialsError::Write {
            path: destination.to_path_buf(),
            source: std::io::Error::other(e),
        })?
}

/// Write `contents` next to `destination` and rename it into place
pub fn write_atomic(destination: &Path, contents: &str) -> Result<(), CredentialsError> {
    let wrap = |source: std::io::Error| CredentialsError::Write {
        path: destination.to_path_buf(),
        source,
    };

    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(wrap)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(contents.as_bytes()).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.persist(destination).map_err(|e| wrap(e.error))?;
    Ok(())
}

#[cfg(test)]
#[path = "kubeconfig_test.rs"]
mod tests;

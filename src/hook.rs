//! User hook scripts run after a cluster is created or destroyed

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
#[error("script {script} failed: {cause}")]
pub struct ScriptError {
    pub script: PathBuf,
    pub cause: String,
}

impl ScriptError {
    fn new(script: &Path, cause: impl Into<String>) -> Self {
        Self {
            script: script.to_path_buf(),
            cause: cause.into(),
        }
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    metadata.is_file()
}

/// Run `script` with `env` layered over the current environment
///
/// The child is killed if it outlives `timeout`.
#[instrument(skip(script, env, timeout), fields(script = %script.display()))]
pub async fn run_hook(
    script: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<(), ScriptError> {
    let metadata = tokio::fs::metadata(script)
        .await
        .map_err(|e| ScriptError::new(script, format!("cannot access script: {e}")))?;
    if !is_executable(&metadata) {
        return Err(ScriptError::new(script, "not an executable file"));
    }

    info!("Running hook script");
    let mut child = Command::new(script)
        .envs(env)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ScriptError::new(script, format!("could not start: {e}")))?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            info!("Hook script finished");
            Ok(())
        }
        Ok(Ok(status)) => Err(ScriptError::new(script, format!("exited with {status}"))),
        Ok(Err(e)) => Err(ScriptError::new(script, format!("could not wait for it: {e}"))),
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "Hook script timed out, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Could not kill hook script");
            }
            Err(ScriptError::new(
                script,
                format!("timeout {}s expired", timeout.as_secs_f64()),
            ))
        }
    }
}

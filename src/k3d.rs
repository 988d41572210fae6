//! The cluster provisioning tool
//!
//! Thin wrappers over the `k3d` subcommands the controller needs. Nothing
//! here interprets the output beyond splitting the `list` table.

use crate::process::{self, LineStream, ProcessError};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, error, instrument, warn};

/// Lines of table decoration before and after the rows in `k3d list`
pub const LIST_HEADER_LEN: usize = 3;
pub const LIST_FOOTER_LEN: usize = 1;

/// One row of `k3d list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedCluster {
    pub name: String,
    pub image: String,
    pub status: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Raw `list` output
    async fn list(&self) -> Result<Vec<String>, ProcessError>;

    /// Start `create` and stream its output as it is produced
    fn create(&self, args: Vec<String>) -> Result<LineStream, ProcessError>;

    /// `delete`, keeping the registry volume
    async fn delete(&self, name: &str) -> Result<(), ProcessError>;

    /// Path of the cluster's kubeconfig; `None` when nothing was printed
    async fn get_kubeconfig(&self, name: &str) -> Result<Option<String>, ProcessError>;

    async fn start(&self, name: &str) -> Result<(), ProcessError>;

    async fn stop(&self, name: &str) -> Result<(), ProcessError>;
}

/// `k3d` CLI backed provisioner
pub struct K3dCli {
    k3d: PathBuf,
    env: Vec<(String, String)>,
}

impl K3dCli {
    /// `env` is passed to every invocation (e.g. a `DOCKER_HOST` override)
    pub fn new(k3d: impl Into<PathBuf>, env: Vec<(String, String)>) -> Self {
        Self {
            k3d: k3d.into(),
            env,
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<String>, ProcessError> {
        let lines = process::run_collect(&self.k3d, args, &self.env).await?;
        for line in &lines {
            debug!("[k3d] {}", line);
        }
        Ok(lines)
    }
}

fn name_arg(name: &str) -> String {
    format!("--name={name}")
}

#[async_trait]
impl Provisioner for K3dCli {
    async fn list(&self) -> Result<Vec<String>, ProcessError> {
        process::run_collect(&self.k3d, ["list"], &self.env).await
    }

    fn create(&self, args: Vec<String>) -> Result<LineStream, ProcessError> {
        let full: Vec<String> = std::iter::once("create".to_string()).chain(args).collect();
        debug!(args = ?full, "Running k3d create");
        process::run_lines(&self.k3d, full, &self.env)
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<(), ProcessError> {
        self.run(&[
            "delete".to_string(),
            name_arg(name),
            "--keep-registry-volume".to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn get_kubeconfig(&self, name: &str) -> Result<Option<String>, ProcessError> {
        let lines = process::run_collect(&self.k3d, ["get-kubeconfig".to_string(), name_arg(name)], &self.env).await?;
        Ok(lines.into_iter().find(|l| !l.is_empty()))
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<(), ProcessError> {
        self.run(&["start".to_string(), name_arg(name)]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, name: &str) -> Result<(), ProcessError> {
        self.run(&["stop".to_string(), name_arg(name)]).await?;
        Ok(())
    }
}

/// Parse the table printed by `k3d list`:
///
/// ```text
/// +-----------------+------------------------------------+---------+---------+
/// |      NAME       |               IMAGE                | STATUS  | WORKERS |
/// +-----------------+------------------------------------+---------+---------+
/// | k3s-cluster-209 | docker.io/rancher/k3s:v1.17.3-k3s1 | running |   0/0   |
/// +-----------------+------------------------------------+---------+---------+
/// ```
///
/// Parsing stops at the first row that does not look like a table row.
pub fn parse_list(lines: &[String]) -> Vec<ListedCluster> {
    let mut clusters = Vec::new();
    if lines.len() <= LIST_HEADER_LEN + LIST_FOOTER_LEN {
        return clusters;
    }

    for line in &lines[LIST_HEADER_LEN..lines.len() - LIST_FOOTER_LEN] {
        let components: Vec<&str> = line
            .split('|')
            .filter(|c| !c.is_empty())
            .map(str::trim)
            .collect();

        match components.as_slice() {
            [name, image, status, ..] if !name.is_empty() => {
                debug!(name = %name, image = %image, status = %status, "Parsed cluster info");
                clusters.push(ListedCluster {
                    name: name.to_string(),
                    image: image.to_string(),
                    status: status.to_string(),
                });
            }
            [_, _, ..] => warn!(line = %line, "Could not parse cluster row"),
            _ => {
                error!(line = %line, "Could not parse k3d list output");
                break;
            }
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<String> {
        raw.lines().map(|l| l.trim().to_string()).collect()
    }

    #[test]
    fn test_parse_list() {
        let out = lines(
            "+-----------------+------------------------------------+---------+---------+
             |      NAME       |               IMAGE                | STATUS  | WORKERS |
             +-----------------+------------------------------------+---------+---------+
             | k3s-cluster-209 | docker.io/rancher/k3s:v1.17.3-k3s1 | running |   0/0   |
             | demo            | docker.io/rancher/k3s:v1.17.3-k3s1 | stopped |   2/2   |
             +-----------------+------------------------------------+---------+---------+",
        );

        let clusters = parse_list(&out);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, "k3s-cluster-209");
        assert_eq!(clusters[0].image, "docker.io/rancher/k3s:v1.17.3-k3s1");
        assert_eq!(clusters[0].status, "running");
        assert_eq!(clusters[1].name, "demo");
        assert_eq!(clusters[1].status, "stopped");
    }

    #[test]
    fn test_parse_list_without_rows() {
        assert!(parse_list(&[]).is_empty());

        let header_only = lines(
            "+------+
             | NAME |
             +------+
             +------+",
        );
        assert!(parse_list(&header_only).is_empty());
    }

    #[test]
    fn test_parse_list_stops_at_garbage() {
        let out = lines(
            "+---+
             | NAME | IMAGE | STATUS |
             +---+
             | a | img | running |
             garbage
             | b | img | running |
             +---+",
        );
        let clusters = parse_list(&out);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "a");
    }
}

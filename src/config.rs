//! Runtime settings
//!
//! Everything is read from `KEHTO_*` environment variables with sensible
//! defaults. External tools are resolved once here and handed to the
//! components that shell out to them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Prefix for every environment variable we read or export to hooks
pub const ENV_PREFIX: &str = "KEHTO";

/// Interval between periodic reconciliation passes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Hard limit for post-create/post-destroy scripts
pub const DEFAULT_SCRIPTS_TIMEOUT: Duration = Duration::from_secs(60);

/// Value passed as `--wait=N` when creating clusters
pub const DEFAULT_WAIT_SECS: u64 = 60;

/// Candidate range for auto-assigned API server ports
pub const DEFAULT_API_PORT_RANGE: (u16, u16) = (6500, 7500);

/// Credentials polling budget while the control plane comes up
pub const DEFAULT_KUBECONFIG_ATTEMPTS: u32 = 20;
pub const DEFAULT_KUBECONFIG_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default port for the local status server
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Directories searched after `PATH` when resolving tools
pub const DEFAULT_EXTRA_PATH: &[&str] = &["/app"];

/// Per-user base directories the defaults are derived from
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseDirs {
    pub home: Option<PathBuf>,
    pub cache: Option<PathBuf>,
}

impl BaseDirs {
    /// The platform directories of the current user
    pub fn detect() -> Self {
        Self {
            home: dirs::home_dir(),
            cache: dirs::cache_dir(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("could not find the `{0}` executable (set KEHTO_{1} or add it to PATH)")]
    ToolNotFound(String, String),

    #[error("could not determine the home directory")]
    NoHome,

    #[error("could not determine the cache directory (set KEHTO_CACHE_DIR)")]
    NoCacheDir,
}

/// Resolved locations of the external CLIs
#[derive(Debug, Clone, PartialEq)]
pub struct Tools {
    /// Provisioning tool (`k3d`)
    pub k3d: PathBuf,
    /// Context-management tool (`kubectl`)
    pub kubectl: PathBuf,
    /// Container runtime CLI (`docker`)
    pub docker: PathBuf,
}

impl Tools {
    /// Use the bare tool names and let the OS search `PATH` at spawn time
    pub fn from_path() -> Self {
        Self {
            k3d: PathBuf::from("k3d"),
            kubectl: PathBuf::from("kubectl"),
            docker: PathBuf::from("docker"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Unified credentials file all per-cluster kubeconfigs are merged into
    pub kubeconfig: PathBuf,
    /// Root for per-cluster scratch directories (generated chart manifests)
    pub cache_dir: PathBuf,
    pub tools: Tools,
    /// Overrides `DOCKER_HOST` for the provisioning tool and the inspector
    pub docker_host: Option<String>,
    pub refresh_interval: Duration,
    pub scripts_timeout: Duration,
    pub wait_secs: u64,
    pub api_port_range: (u16, u16),
    pub kubeconfig_attempts: u32,
    pub kubeconfig_retry_delay: Duration,
    pub create_hook: Option<PathBuf>,
    pub destroy_hook: Option<PathBuf>,
    pub health_port: u16,
    pub notify_webhook_url: Option<String>,
}

impl Settings {
    /// Settings with defaults for everything but the paths
    pub fn new(kubeconfig: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>, tools: Tools) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            cache_dir: cache_dir.into(),
            tools,
            docker_host: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            scripts_timeout: DEFAULT_SCRIPTS_TIMEOUT,
            wait_secs: DEFAULT_WAIT_SECS,
            api_port_range: DEFAULT_API_PORT_RANGE,
            kubeconfig_attempts: DEFAULT_KUBECONFIG_ATTEMPTS,
            kubeconfig_retry_delay: DEFAULT_KUBECONFIG_RETRY_DELAY,
            create_hook: None,
            destroy_hook: None,
            health_port: DEFAULT_HEALTH_PORT,
            notify_webhook_url: None,
        }
    }

    /// Create settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), &BaseDirs::detect())
    }

    /// Create settings from an arbitrary variable lookup
    ///
    /// Uses:
    /// - `KEHTO_KUBECONFIG` (default `<home>/.kube/config`, `$VAR`s expanded)
    /// - `KEHTO_CACHE_DIR` (default `<cache>/kehto`)
    /// - `KEHTO_K3D`, `KEHTO_KUBECTL`, `KEHTO_DOCKER` (default: searched in `PATH` and `/app`)
    /// - `KEHTO_DOCKER_HOST`, `KEHTO_CREATE_HOOK`, `KEHTO_DESTROY_HOOK`, `KEHTO_NOTIFY_WEBHOOK_URL`
    /// - `KEHTO_REFRESH_INTERVAL_SECS`, `KEHTO_SCRIPTS_TIMEOUT_SECS`, `KEHTO_WAIT_SECS`
    /// - `KEHTO_API_PORT_RANGE` (`start-end`), `KEHTO_HEALTH_PORT`
    pub fn from_lookup<F>(lookup: F, dirs: &BaseDirs) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}_{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let kubeconfig = match var("KUBECONFIG") {
            Some(raw) => PathBuf::from(expand_vars(strip_quotes(&raw), &lookup)),
            None => dirs
                .home
                .as_ref()
                .ok_or(ConfigError::NoHome)?
                .join(".kube")
                .join("config"),
        };

        let cache_dir = match var("CACHE_DIR") {
            Some(raw) => PathBuf::from(expand_vars(strip_quotes(&raw), &lookup)),
            None => dirs.cache.as_ref().ok_or(ConfigError::NoCacheDir)?.join("kehto"),
        };

        let search_path = lookup("PATH").unwrap_or_default();
        let resolve = |tool: &str, var_name: &str| -> Result<PathBuf, ConfigError> {
            if let Some(explicit) = var(var_name) {
                return Ok(PathBuf::from(explicit));
            }
            find_executable(tool, &search_path, DEFAULT_EXTRA_PATH)
                .ok_or_else(|| ConfigError::ToolNotFound(tool.to_string(), var_name.to_string()))
        };

        let tools = Tools {
            k3d: resolve("k3d", "K3D")?,
            kubectl: resolve("kubectl", "KUBECTL")?,
            docker: resolve("docker", "DOCKER")?,
        };

        let mut settings = Self::new(kubeconfig, cache_dir, tools);
        settings.docker_host = var("DOCKER_HOST");
        settings.create_hook = var("CREATE_HOOK").map(PathBuf::from);
        settings.destroy_hook = var("DESTROY_HOOK").map(PathBuf::from);
        settings.notify_webhook_url = var("NOTIFY_WEBHOOK_URL");

        if let Some(v) = var("REFRESH_INTERVAL_SECS") {
            let secs: u64 = parse_number("REFRESH_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("REFRESH_INTERVAL_SECS", &v, "must be at least 1 second"));
            }
            settings.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(v) = var("SCRIPTS_TIMEOUT_SECS") {
            settings.scripts_timeout = Duration::from_secs(parse_number("SCRIPTS_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("WAIT_SECS") {
            settings.wait_secs = parse_number("WAIT_SECS", &v)?;
        }
        if let Some(v) = var("API_PORT_RANGE") {
            settings.api_port_range = parse_port_range(&v)?;
        }
        if let Some(v) = var("HEALTH_PORT") {
            settings.health_port = parse_number("HEALTH_PORT", &v)?;
        }

        Ok(settings)
    }

    /// Extra environment for commands that talk to the container runtime
    pub fn docker_env(&self) -> Vec<(String, String)> {
        self.docker_host
            .iter()
            .map(|host| ("DOCKER_HOST".to_string(), host.clone()))
            .collect()
    }
}

fn invalid(var: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var: format!("{ENV_PREFIX}_{var}"),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_number<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(var, value, e.to_string()))
}

/// Parse a `start-end` port range (end exclusive, must be non-empty)
pub fn parse_port_range(value: &str) -> Result<(u16, u16), ConfigError> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| invalid("API_PORT_RANGE", value, "expected start-end"))?;
    let start: u16 = parse_number("API_PORT_RANGE", start.trim())?;
    let end: u16 = parse_number("API_PORT_RANGE", end.trim())?;
    if start == 0 || end <= start {
        return Err(invalid("API_PORT_RANGE", value, "range must be non-empty and start above 0"));
    }
    Ok((start, end))
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|c| c == '\'' || c == '"')
}

/// Expand `$VAR` and `${VAR}` references; unknown variables are left as-is
pub fn expand_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}

/// Find the executable `name` in `search_path` (`PATH` syntax), then in `extra`
///
/// Files without the executable bit are skipped.
pub fn find_executable(name: &str, search_path: &str, extra: &[&str]) -> Option<PathBuf> {
    let dirs: Vec<PathBuf> = std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .chain(extra.iter().map(PathBuf::from))
        .collect();
    let paths = std::env::join_paths(dirs).ok()?;
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

    which::which_in(name, Some(paths), cwd).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn dev_dirs() -> BaseDirs {
        BaseDirs {
            home: Some(PathBuf::from("/home/dev")),
            cache: Some(PathBuf::from("/home/dev/.cache")),
        }
    }

    fn explicit_tools() -> Vec<(&'static str, &'static str)> {
        vec![
            ("KEHTO_K3D", "/opt/k3d"),
            ("KEHTO_KUBECTL", "/opt/kubectl"),
            ("KEHTO_DOCKER", "/opt/docker"),
        ]
    }

    #[test]
    fn test_defaults_from_home() {
        let vars = explicit_tools();

        let settings = Settings::from_lookup(lookup_from(&vars), &dev_dirs()).unwrap();

        assert_eq!(settings.kubeconfig, PathBuf::from("/home/dev/.kube/config"));
        assert_eq!(settings.cache_dir, PathBuf::from("/home/dev/.cache/kehto"));
        assert_eq!(settings.tools.k3d, PathBuf::from("/opt/k3d"));
        assert_eq!(settings.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(settings.scripts_timeout, Duration::from_secs(60));
        assert_eq!(settings.api_port_range, (6500, 7500));
        assert_eq!(settings.kubeconfig_attempts, 20);
        assert!(settings.docker_host.is_none());
        assert!(settings.create_hook.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut vars = explicit_tools();
        vars.extend([
            ("HOME", "/home/dev"),
            ("KEHTO_KUBECONFIG", "'$HOME/.kube/kehto.yaml'"),
            ("KEHTO_CACHE_DIR", "/var/cache/dev/kehto"),
            ("KEHTO_DOCKER_HOST", "tcp://10.0.0.5:2375"),
            ("KEHTO_REFRESH_INTERVAL_SECS", "3"),
            ("KEHTO_API_PORT_RANGE", "7000-7100"),
            ("KEHTO_CREATE_HOOK", "/home/dev/bin/on-create.sh"),
        ]);

        let settings = Settings::from_lookup(lookup_from(&vars), &dev_dirs()).unwrap();

        assert_eq!(settings.kubeconfig, PathBuf::from("/home/dev/.kube/kehto.yaml"));
        assert_eq!(settings.cache_dir, PathBuf::from("/var/cache/dev/kehto"));
        assert_eq!(settings.refresh_interval, Duration::from_secs(3));
        assert_eq!(settings.api_port_range, (7000, 7100));
        assert_eq!(
            settings.docker_env(),
            vec![("DOCKER_HOST".to_string(), "tcp://10.0.0.5:2375".to_string())]
        );
        assert_eq!(
            settings.create_hook,
            Some(PathBuf::from("/home/dev/bin/on-create.sh"))
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let mut vars = explicit_tools();
        vars.extend([("HOME", "/home/dev"), ("KEHTO_WAIT_SECS", "soon")]);

        let err = Settings::from_lookup(lookup_from(&vars), &dev_dirs()).unwrap_err();
        assert!(err.to_string().contains("KEHTO_WAIT_SECS"));
    }

    #[test]
    fn test_zero_refresh_interval_rejected() {
        let mut vars = explicit_tools();
        vars.push(("KEHTO_REFRESH_INTERVAL_SECS", "0"));

        let err = Settings::from_lookup(lookup_from(&vars), &dev_dirs()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref var, .. } if var == "KEHTO_REFRESH_INTERVAL_SECS"
        ));
    }

    #[test]
    fn test_missing_base_dirs() {
        let vars = explicit_tools();

        let err = Settings::from_lookup(lookup_from(&vars), &BaseDirs::default()).unwrap_err();
        assert!(matches!(err, ConfigError::NoHome));

        let home_only = BaseDirs {
            home: Some(PathBuf::from("/home/dev")),
            cache: None,
        };
        let err = Settings::from_lookup(lookup_from(&vars), &home_only).unwrap_err();
        assert!(matches!(err, ConfigError::NoCacheDir));
    }

    #[test]
    fn test_missing_tool() {
        let vars = [("PATH", "/nonexistent-kehto-bin")];
        let err = Settings::from_lookup(lookup_from(&vars), &dev_dirs()).unwrap_err();
        assert!(matches!(err, ConfigError::ToolNotFound(ref tool, _) if tool == "k3d"));
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("6400-6500").unwrap(), (6400, 6500));
        assert!(parse_port_range("6500").is_err());
        assert!(parse_port_range("7000-6000").is_err());
        assert!(parse_port_range("0-10").is_err());
    }

    #[test]
    fn test_expand_vars() {
        let lookup = lookup_from(&[("HOME", "/home/dev"), ("USER", "dev")]);
        assert_eq!(expand_vars("$HOME/.kube/config", &lookup), "/home/dev/.kube/config");
        assert_eq!(expand_vars("${HOME}/x-$USER", &lookup), "/home/dev/x-dev");
        assert_eq!(expand_vars("$UNKNOWN/x", &lookup), "$UNKNOWN/x");
        assert_eq!(expand_vars("cost: 5$", &lookup), "cost: 5$");
    }

    #[cfg(unix)]
    fn write_tool(dir: &std::path::Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let tool = dir.join(name);
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(mode)).unwrap();
        tool
    }

    #[cfg(unix)]
    #[test]
    fn test_find_executable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_tool(dir.path(), "k3d", 0o755);

        let search = format!("/nonexistent-kehto-bin:{}", dir.path().display());
        assert_eq!(find_executable("k3d", &search, &[]), Some(tool));
        assert_eq!(find_executable("kubectl", &search, &[]), None);

        let extra = dir.path().to_str().unwrap();
        assert!(find_executable("k3d", "", &[extra]).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_executable_skips_plain_files() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        write_tool(first.path(), "k3d", 0o644);
        let runnable = write_tool(second.path(), "k3d", 0o755);

        let search = format!("{}:{}", first.path().display(), second.path().display());
        assert_eq!(find_executable("k3d", &search, &[]), Some(runnable));
        assert_eq!(find_executable("k3d", &first.path().display().to_string(), &[]), None);
    }
}

//! Robot backends.
//!
//! One polymorphic [`Robot`] surface over a closed set of backends,
//! selected at construction from the persisted `ROBOT_CLASS` config key:
//! nested-engine (the default), local host-engine compose, and remote
//! host compose. The fleet registry only ever sees the trait.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{robot_type_of, EnvFile, SdkPaths, ROBOT_CLASS_KEY};
use crate::dind::{NestedEngine, StatusBuckets};
use crate::engine::{compose_host, EngineClient};
use crate::error::{Error, Result};
use crate::proxy::RegistryProxy;
use crate::services;

/// Coarse instance status for the dashboard. Always renderable; error
/// cases degrade to text instead of raising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// No container exists for this instance (never created, or removed
    /// out-of-band).
    NotCreated,
    /// The outer container runs but no child containers exist yet.
    StartingUp,
    Running(StatusBuckets),
    Stopped(String),
    Error(String),
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::NotCreated => f.write_str("not created or removed"),
            InstanceStatus::StartingUp => f.write_str("starting up"),
            InstanceStatus::Running(buckets) => write!(f, "running ({buckets})"),
            InstanceStatus::Stopped(detail) => write!(f, "stopped ({detail})"),
            InstanceStatus::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

/// Which backend an instance uses, from its `ROBOT_CLASS` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Dind,
    Local,
    Remote,
}

impl BackendKind {
    pub fn from_config(value: Option<&str>) -> Self {
        match value {
            Some("local") => BackendKind::Local,
            Some("remote") => BackendKind::Remote,
            _ => BackendKind::Dind,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Dind => "dind",
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

/// One robot instance's lifecycle surface. Implementations never panic
/// out of `status` or `cleanup`; both degrade instead.
#[async_trait]
pub trait Robot: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> BackendKind;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Backend-side teardown (containers only; the fleet owns the data
    /// directory). Never fails.
    async fn cleanup(&self);

    async fn ip(&self) -> Result<String>;

    async fn status(&self) -> InstanceStatus;

    fn env(&self, key: &str) -> Result<Option<String>>;

    fn set_env(&self, key: &str, value: &str) -> Result<()>;
}

/// Construct the backend named by the instance's persisted config.
pub fn build_robot(
    engine: Arc<dyn EngineClient>,
    paths: &SdkPaths,
    name: &str,
    proxy: Option<Arc<RegistryProxy>>,
) -> Result<Arc<dyn Robot>> {
    let config = EnvFile::new(paths.instance_config(name));
    let kind = BackendKind::from_config(config.get(ROBOT_CLASS_KEY)?.as_deref());
    debug!(instance = %name, backend = kind.as_str(), "Constructing robot backend");

    Ok(match kind {
        BackendKind::Dind => Arc::new(DindRobot::new(engine, paths, name, proxy)?),
        BackendKind::Local => Arc::new(LocalRobot::new(paths, name, None)?),
        BackendKind::Remote => {
            let host = config
                .get("DOCKER_HOST")?
                .ok_or_else(|| Error::Engine(format!(
                    "instance {name} is remote but has no DOCKER_HOST configured"
                )))?;
            Arc::new(LocalRobot::new(paths, name, Some(host))?)
        }
    })
}

/// The default backend: one nested engine per instance.
pub struct DindRobot {
    instance: NestedEngine,
    paths: SdkPaths,
    config: EnvFile,
}

impl DindRobot {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        paths: &SdkPaths,
        name: &str,
        proxy: Option<Arc<RegistryProxy>>,
    ) -> Result<Self> {
        Ok(Self {
            instance: NestedEngine::new(engine, paths, name, proxy)?,
            paths: paths.clone(),
            config: EnvFile::new(paths.instance_config(name)),
        })
    }

    pub fn instance(&self) -> &NestedEngine {
        &self.instance
    }
}

#[async_trait]
impl Robot for DindRobot {
    fn name(&self) -> &str {
        self.instance.name()
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Dind
    }

    async fn start(&self) -> Result<()> {
        self.instance.ensure_started().await?;
        services::start_services(&self.instance, &self.paths).await
    }

    async fn stop(&self) -> Result<()> {
        if let Err(e) = services::stop_services(&self.instance, &self.paths).await {
            warn!(instance = %self.name(), error = %e, "Service stop incomplete");
        }
        self.instance.stop().await
    }

    async fn cleanup(&self) {
        self.instance.cleanup().await;
    }

    async fn ip(&self) -> Result<String> {
        self.instance.ip().await
    }

    async fn status(&self) -> InstanceStatus {
        let existing = match self.instance.handle().find_existing().await {
            Ok(existing) => existing,
            Err(e) => return InstanceStatus::Error(e.to_string()),
        };
        let Some(existing) = existing else {
            return InstanceStatus::NotCreated;
        };
        if !existing.status.is_running() {
            return InstanceStatus::Stopped(existing.status.to_string());
        }

        // The daemon is live whenever the outer container runs, so the
        // socket can be opened even before this process has started the
        // instance itself (reattach, read-only status views).
        let counts = match self
            .instance
            .handle()
            .engine()
            .open_socket(self.instance.socket_path())
        {
            Ok(client) => child_counts(&*client).await,
            Err(e) => Err(e),
        };
        match counts {
            Ok(buckets) if buckets.is_empty() => InstanceStatus::StartingUp,
            Ok(buckets) => InstanceStatus::Running(buckets),
            Err(e) => InstanceStatus::Error(e.to_string()),
        }
    }

    fn env(&self, key: &str) -> Result<Option<String>> {
        self.config.get(key)
    }

    fn set_env(&self, key: &str, value: &str) -> Result<()> {
        self.config.set(key, value)
    }
}

async fn child_counts(client: &dyn EngineClient) -> Result<StatusBuckets> {
    use crate::engine::ContainerStatus;
    Ok(StatusBuckets {
        running: client.count_by_status(ContainerStatus::Running).await?,
        restarting: client.count_by_status(ContainerStatus::Restarting).await?,
        exited: client.count_by_status(ContainerStatus::Exited).await?,
        created: client.count_by_status(ContainerStatus::Created).await?,
        paused: client.count_by_status(ContainerStatus::Paused).await?,
        dead: client.count_by_status(ContainerStatus::Dead).await?,
    })
}

/// Host-engine compose backend: services run straight on the host's (or
/// a remote host's) engine, no nesting. `docker_host` set makes it the
/// remote variant.
pub struct LocalRobot {
    name: String,
    robot_type: String,
    paths: SdkPaths,
    config: EnvFile,
    docker_host: Option<String>,
}

impl LocalRobot {
    pub fn new(paths: &SdkPaths, name: &str, docker_host: Option<String>) -> Result<Self> {
        let robot_type = robot_type_of(name)?;
        std::fs::create_dir_all(paths.instance_dir(name))?;
        Ok(Self {
            name: name.to_string(),
            robot_type,
            paths: paths.clone(),
            config: EnvFile::new(paths.instance_config(name)),
            docker_host: docker_host.filter(|h| !h.is_empty()),
        })
    }

    fn compose_envs(&self) -> Vec<(String, String)> {
        match &self.docker_host {
            Some(host) => vec![("DOCKER_HOST".to_string(), host.clone())],
            None => Vec::new(),
        }
    }

    fn service_dirs(&self) -> Result<Vec<PathBuf>> {
        let root = self
            .paths
            .robots_dir()
            .join(&self.robot_type)
            .join("services");
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn compose_each(&self, tail: &[&str], autostart_only: bool) -> Result<()> {
        let env_file = self.paths.instance_config(&self.name);
        for dir in self.service_dirs()? {
            let Some(manifest) = services::find_manifest(&dir) else {
                continue;
            };
            if autostart_only {
                let text = match std::fs::read_to_string(&manifest) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(
                            instance = %self.name,
                            service = %dir.display(),
                            error = %e,
                            "Cannot read manifest, skipping"
                        );
                        continue;
                    }
                };
                if !services::autostart_enabled(&text) {
                    continue;
                }
            }
            let mut args = vec![
                format!("--env-file={}", env_file.display()),
                "-f".to_string(),
                manifest.to_string_lossy().into_owned(),
            ];
            args.extend(tail.iter().map(|s| s.to_string()));

            let out = compose_host(&args, &self.compose_envs(), Some(&dir)).await?;
            if !out.success() {
                warn!(
                    instance = %self.name,
                    service = %dir.display(),
                    output = %out.output,
                    "Compose invocation failed"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Robot for LocalRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> BackendKind {
        if self.docker_host.is_some() {
            BackendKind::Remote
        } else {
            BackendKind::Local
        }
    }

    async fn start(&self) -> Result<()> {
        info!(instance = %self.name, "Starting host-engine services");
        self.compose_each(&["up", "-d"], true).await
    }

    async fn stop(&self) -> Result<()> {
        self.compose_each(&["down", "--remove-orphans"], false).await
    }

    async fn cleanup(&self) {
        if let Err(e) = self.stop().await {
            warn!(instance = %self.name, error = %e, "Error during cleanup");
        }
    }

    async fn ip(&self) -> Result<String> {
        match &self.docker_host {
            // tcp://host:port or ssh://user@host
            Some(host) => {
                let trimmed = host.split("://").last().unwrap_or(host);
                let trimmed = trimmed.split('@').last().unwrap_or(trimmed);
                let trimmed = trimmed.split(':').next().unwrap_or(trimmed);
                Ok(trimmed.to_string())
            }
            None => Ok("127.0.0.1".to_string()),
        }
    }

    async fn status(&self) -> InstanceStatus {
        let mut running = 0usize;
        let dirs = match self.service_dirs() {
            Ok(dirs) => dirs,
            Err(e) => return InstanceStatus::Error(e.to_string()),
        };
        for dir in dirs {
            let Some(manifest) = services::find_manifest(&dir) else {
                continue;
            };
            let args = vec![
                "-f".to_string(),
                manifest.to_string_lossy().into_owned(),
                "ps".to_string(),
                "--quiet".to_string(),
            ];
            match compose_host(&args, &self.compose_envs(), Some(&dir)).await {
                Ok(out) if out.success() => {
                    running += out.output.lines().filter(|l| !l.trim().is_empty()).count();
                }
                Ok(_) | Err(_) => {}
            }
        }
        if running > 0 {
            InstanceStatus::Running(StatusBuckets {
                running,
                ..StatusBuckets::default()
            })
        } else {
            InstanceStatus::Stopped("no service containers".to_string())
        }
    }

    fn env(&self, key: &str) -> Result<Option<String>> {
        self.config.get(key)
    }

    fn set_env(&self, key: &str, value: &str) -> Result<()> {
        self.config.set(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_defaults_to_dind() {
        assert_eq!(BackendKind::from_config(None), BackendKind::Dind);
        assert_eq!(BackendKind::from_config(Some("dind")), BackendKind::Dind);
        assert_eq!(BackendKind::from_config(Some("local")), BackendKind::Local);
        assert_eq!(BackendKind::from_config(Some("remote")), BackendKind::Remote);
        assert_eq!(BackendKind::from_config(Some("garbage")), BackendKind::Dind);
    }

    #[test]
    fn status_renders_for_every_variant() {
        assert_eq!(InstanceStatus::NotCreated.to_string(), "not created or removed");
        assert_eq!(InstanceStatus::StartingUp.to_string(), "starting up");
        assert!(InstanceStatus::Running(StatusBuckets::default())
            .to_string()
            .starts_with("running"));
        assert_eq!(
            InstanceStatus::Stopped("exited".to_string()).to_string(),
            "stopped (exited)"
        );
        assert_eq!(
            InstanceStatus::Error("boom".to_string()).to_string(),
            "error: boom"
        );
    }
}

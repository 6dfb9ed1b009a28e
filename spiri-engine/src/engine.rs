//! Engine client adapter.
//!
//! Thin seam over the container engine's control API plus a helper for
//! invoking an external compose tool as a subprocess. Everything above
//! this module talks to [`EngineClient`], never to bollard directly, so
//! the whole lifecycle engine can be driven by a fake in tests and so a
//! nested engine's unix socket can be opened through the same interface.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::{Error, Result};

/// Coarse container state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn is_running(self) -> bool {
        self == ContainerStatus::Running
    }

    /// The engine API's filter string for this status.
    pub fn as_filter(self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl From<ContainerStateStatusEnum> for ContainerStatus {
    fn from(s: ContainerStateStatusEnum) -> Self {
        match s {
            ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
            ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
            ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
            ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
            ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
            ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
            ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
            ContainerStateStatusEnum::EMPTY => ContainerStatus::Unknown,
        }
    }
}

/// A bind mount from a host path into the container.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub host_path: std::path::PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// A published port. `host_port == None` asks the engine to auto-assign.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: Option<u16>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub privileged: bool,
    pub auto_remove: bool,
    pub env: std::collections::BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<PortSpec>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
}

#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub status: ContainerStatus,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Synchronous-looking async contract over the container engine.
///
/// All methods are safe to call from any worker task; errors are
/// pre-classified into the taxonomy of [`Error`].
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// List containers whose name contains `name`. Empty string lists all.
    async fn list_containers(&self, name: &str, all: bool) -> Result<Vec<ContainerSummary>>;

    /// List containers carrying the label `key=value`.
    async fn list_by_label(&self, key: &str, value: &str, all: bool)
        -> Result<Vec<ContainerSummary>>;

    /// Count containers currently in the given status bucket.
    async fn count_by_status(&self, status: ContainerStatus) -> Result<usize>;

    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails>;

    async fn exec(&self, id: &str, cmd: Vec<String>, workdir: Option<String>)
        -> Result<ExecOutput>;

    async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()>;

    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Open a client against another engine daemon reachable through a
    /// unix socket (a nested engine's control socket).
    fn open_socket(&self, socket: &Path) -> Result<Arc<dyn EngineClient>>;
}

fn classify(err: bollard::errors::Error) -> Error {
    use bollard::errors::Error as B;
    match err {
        B::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        B::DockerResponseServerError {
            status_code,
            message,
        } => Error::Engine(format!("status {status_code}: {message}")),
        B::IOError { err } => Error::Unreachable(err.to_string()),
        other => Error::Engine(other.to_string()),
    }
}

fn server_status(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// [`EngineClient`] backed by a Docker-compatible engine over bollard.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the host engine via its default socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        Ok(Self { docker })
    }

    /// Connect to an engine daemon over an explicit unix socket.
    pub fn connect_unix(socket: &Path) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(classify)?;
        Ok(Self { docker })
    }

    async fn list_filtered(
        &self,
        filters: HashMap<String, Vec<String>>,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            filters,
            ..Default::default()
        };
        let listed = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: c.state.as_deref().map(ContainerStatus::from).unwrap_or(
                    ContainerStatus::Unknown,
                ),
            })
            .collect())
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(&self, name: &str, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        if !name.is_empty() {
            filters.insert("name".to_string(), vec![name.to_string()]);
        }
        self.list_filtered(filters, all).await
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        self.list_filtered(filters, all).await
    }

    async fn count_by_status(&self, status: ContainerStatus) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "status".to_string(),
            vec![status.as_filter().to_string()],
        );
        Ok(self.list_filtered(filters, true).await?.len())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|m| {
                format!(
                    "{}:{}:{}",
                    m.host_path.display(),
                    m.container_path,
                    if m.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: port.host_port.map(|p| p.to_string()),
                }]),
            );
        }

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                privileged: Some(spec.privileged),
                auto_remove: Some(spec.auto_remove),
                binds: (!binds.is_empty()).then_some(binds),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;

        debug!(name = %spec.name, id = %created.id, "Created container");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(e) if server_status(&e) == Some(304) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let status = details
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(ContainerStatus::from)
            .unwrap_or(ContainerStatus::Unknown);

        let ip_address = details
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        Ok(ContainerDetails {
            id: details.id.unwrap_or_else(|| id.to_string()),
            status,
            ip_address,
        })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        workdir: Option<String>,
    ) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: workdir,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(log) => output.push_str(&log.to_string()),
                    Err(e) => return Err(classify(e)),
                }
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(0),
            output,
        })
    }

    async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if server_status(&e) == Some(304) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(classify)?;
        Ok(())
    }

    fn open_socket(&self, socket: &Path) -> Result<Arc<dyn EngineClient>> {
        Ok(Arc::new(DockerEngine::connect_unix(socket)?))
    }
}

/// Run the external compose tool on the host, capturing combined output.
///
/// Used by the local and remote robot backends; nested-engine instances
/// exec compose inside their own container instead.
pub async fn compose_host(
    args: &[String],
    envs: &[(String, String)],
    workdir: Option<&Path>,
) -> Result<ExecOutput> {
    let mut cmd = tokio::process::Command::new("docker");
    cmd.arg("compose").args(args);
    for (k, v) in envs {
        cmd.env(k, v);
    }
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    let out = cmd.output().await?;
    let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&out.stderr));

    Ok(ExecOutput {
        exit_code: out.status.code().unwrap_or(-1) as i64,
        output,
    })
}

//! Nested engine instance: a privileged container running its own
//! container engine daemon, one per robot instance.
//!
//! The nested daemon exposes its control socket into a host directory at
//! a path derived from the scoped instance name, so the host process can
//! command child containers without the nested engine publishing any TCP
//! port. Readiness is therefore defined by socket usability, not by the
//! outer container reaching `running`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::getgid;
use tracing::{debug, info, warn};

use crate::config::{robot_type_of, SdkPaths};
use crate::engine::{ContainerStatus, EngineClient, ExecOutput};
use crate::error::{Error, Result};
use crate::handle::{ContainerHandle, DEFAULT_READY_TIMEOUT};
use crate::proxy::RegistryProxy;

const DIND_IMAGE: &str = "docker:dind";
const CA_CERT_FILE: &str = "registry-ca.crt";
const CA_TRUST_PATH: &str = "/usr/local/share/ca-certificates/registry-ca.crt";

/// Child-container counts by engine status bucket, queried through the
/// nested engine's own socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusBuckets {
    pub running: usize,
    pub restarting: usize,
    pub exited: usize,
    pub created: usize,
    pub paused: usize,
    pub dead: usize,
}

impl StatusBuckets {
    pub fn is_empty(&self) -> bool {
        *self == StatusBuckets::default()
    }
}

impl std::fmt::Display for StatusBuckets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} running, {} restarting, {} exited, {} created, {} paused, {} dead",
            self.running, self.restarting, self.exited, self.created, self.paused, self.dead
        )
    }
}

pub struct NestedEngine {
    handle: ContainerHandle,
    name: String,
    robot_type: String,
    data_root: PathBuf,
    socket_path: PathBuf,
    proxy: Option<Arc<RegistryProxy>>,
    ready_attempts: u32,
}

impl NestedEngine {
    /// Bind a nested engine to an instance name, creating its data
    /// directory. The container itself is not touched until
    /// [`ensure_started`](Self::ensure_started).
    pub fn new(
        engine: Arc<dyn EngineClient>,
        paths: &SdkPaths,
        name: &str,
        proxy: Option<Arc<RegistryProxy>>,
    ) -> Result<Self> {
        let robot_type = robot_type_of(name)?;
        let data_root = paths.instance_dir(name);
        std::fs::create_dir_all(&data_root)?;
        std::fs::create_dir_all(paths.socket_dir())?;

        let handle = ContainerHandle::new(engine, DIND_IMAGE, name);
        let socket_path = paths.socket_dir().join(format!("{}.socket", handle.scoped_name()));

        handle.set_privileged(true);
        handle.set_env("DOCKER_TLS_CERTDIR", "");
        handle.add_mount(&data_root, "/data", false);
        handle.add_mount(paths.socket_dir(), "/dind-sockets", false);
        handle.add_mount(
            paths.robots_dir().join(&robot_type),
            &format!("/robots/{robot_type}"),
            false,
        );
        // The daemon binds its control socket at a path deterministic
        // from the scoped name, so the host side never has to ask the
        // container where the socket landed.
        handle.set_command(vec![format!(
            "--host=unix:///dind-sockets/{}.socket",
            handle.scoped_name()
        )]);

        Ok(Self {
            handle,
            name: name.to_string(),
            robot_type,
            data_root,
            socket_path,
            proxy,
            ready_attempts: DEFAULT_READY_TIMEOUT,
        })
    }

    pub fn with_ready_attempts(mut self, attempts: u32) -> Self {
        self.ready_attempts = attempts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn robot_type(&self) -> &str {
        &self.robot_type
    }

    pub fn data_root(&self) -> &std::path::Path {
        &self.data_root
    }

    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// The manifest root as seen from inside the nested engine.
    pub fn services_mount(&self) -> String {
        format!("/robots/{}", self.robot_type)
    }

    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Bring the nested engine to a usable state: proxy trust and proxy
    /// environment first (environment is frozen at container creation),
    /// then the base container lifecycle, then daemon readiness over the
    /// control socket.
    pub async fn ensure_started(&self) -> Result<()> {
        if let Some(proxy) = &self.proxy {
            self.prepare_proxy(proxy).await?;
        }

        self.handle.ensure_started().await?;

        if self.proxy.is_some() {
            self.refresh_trust_store().await?;
        }

        self.wait_daemon_ready().await
    }

    /// Fetch the proxy CA into the instance's data directory and point
    /// the nested engine's pulls at the proxy. Runs strictly before the
    /// container exists; when re-attaching to a live container the env
    /// is already baked in and only the trust refresh applies.
    async fn prepare_proxy(&self, proxy: &RegistryProxy) -> Result<()> {
        proxy.ensure_started().await?;
        let cert = proxy.ca_cert().await?;
        std::fs::write(self.data_root.join(CA_CERT_FILE), &cert)?;

        for (key, value) in proxy.proxy_env().await? {
            self.handle.set_env(&key, &value);
        }
        Ok(())
    }

    /// Copy the staged CA from the data mount into the trust store and
    /// rebuild it. Works the same whether the container was freshly
    /// created or adopted already running.
    async fn refresh_trust_store(&self) -> Result<()> {
        let cp = self
            .handle
            .exec(
                vec![
                    "cp".into(),
                    format!("/data/{CA_CERT_FILE}"),
                    CA_TRUST_PATH.into(),
                ],
                None,
            )
            .await?;
        if !cp.success() {
            warn!(instance = %self.name, output = %cp.output, "CA certificate copy failed");
        }

        let refresh = self
            .handle
            .exec(vec!["update-ca-certificates".into()], None)
            .await?;
        if !refresh.success() {
            warn!(instance = %self.name, output = %refresh.output, "Trust store refresh failed");
        }
        Ok(())
    }

    /// Poll until the nested daemon answers over its control socket.
    ///
    /// The daemon creates the socket as the in-container exec user, so
    /// each attempt first re-fixes ownership and mode for the host
    /// process's primary group before trying to connect.
    async fn wait_daemon_ready(&self) -> Result<()> {
        let socket_in_container = format!(
            "/dind-sockets/{}.socket",
            self.handle.scoped_name()
        );
        let gid = getgid();
        let mut last = String::from("socket never became available");

        for attempt in 1..=self.ready_attempts {
            let outcome = match self
                .fix_socket_permissions(&socket_in_container, gid.as_raw())
                .await
            {
                Ok(()) => self.try_ping().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    info!(instance = %self.name, attempts = attempt, "Nested engine ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!(instance = %self.name, attempt, error = %e, "Nested engine not ready");
                    last = e.to_string();
                }
            }
            if attempt < self.ready_attempts {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        Err(Error::DaemonNotReady {
            name: self.name.clone(),
            attempts: self.ready_attempts,
            last,
        })
    }

    async fn fix_socket_permissions(&self, socket: &str, gid: u32) -> Result<()> {
        self.handle
            .exec(vec!["chown".into(), format!(":{gid}"), socket.into()], None)
            .await?;
        self.handle
            .exec(vec!["chmod".into(), "660".into(), socket.into()], None)
            .await?;
        Ok(())
    }

    async fn try_ping(&self) -> Result<()> {
        let client = self.nested_client()?;
        client.ping().await
    }

    /// An engine client bound to this instance's control socket.
    pub fn nested_client(&self) -> Result<Arc<dyn EngineClient>> {
        if self.handle.runtime_id().is_none() {
            return Err(Error::NotRunning(self.name.clone()));
        }
        self.handle.engine().open_socket(&self.socket_path)
    }

    /// Child-container counts through the nested engine's own socket.
    pub async fn child_status_counts(&self) -> Result<StatusBuckets> {
        let client = self.nested_client()?;
        Ok(StatusBuckets {
            running: client.count_by_status(ContainerStatus::Running).await?,
            restarting: client.count_by_status(ContainerStatus::Restarting).await?,
            exited: client.count_by_status(ContainerStatus::Exited).await?,
            created: client.count_by_status(ContainerStatus::Created).await?,
            paused: client.count_by_status(ContainerStatus::Paused).await?,
            dead: client.count_by_status(ContainerStatus::Dead).await?,
        })
    }

    pub async fn ip(&self) -> Result<String> {
        self.handle.ip().await
    }

    pub async fn exec(&self, cmd: Vec<String>, workdir: Option<String>) -> Result<ExecOutput> {
        self.handle.exec(cmd, workdir).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.handle.stop().await
    }

    /// Best-effort teardown; never fails.
    pub async fn cleanup(&self) {
        self.handle.cleanup().await;
    }
}

impl std::fmt::Debug for NestedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedEngine")
            .field("name", &self.name)
            .field("robot_type", &self.robot_type)
            .field("socket", &self.socket_path)
            .finish()
    }
}

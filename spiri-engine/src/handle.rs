//! Managed container handle: a named, idempotent-to-start wrapper around
//! one container on the engine.
//!
//! The handle caches an engine-side runtime reference and recovers from
//! the engine losing track of it (auto-removal, out-of-band deletion) by
//! clearing the reference and recreating under the same scoped name.
//! Mutating two lifecycle operations on the same handle concurrently is
//! the caller's bug; the fleet registry serializes them per instance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::engine::{ContainerSpec, EngineClient, ExecOutput, MountSpec, PortSpec};
use crate::error::{Error, Result};

/// Fixed prefix scoping this engine's managed containers apart from
/// unrelated containers on the host.
pub const NAME_PREFIX: &str = "spirisdk_";

/// Default bound on readiness polling, one attempt per second.
pub const DEFAULT_READY_TIMEOUT: u32 = 30;

const CLEANUP_STOP_TIMEOUT_SECS: i64 = 5;

pub struct ContainerHandle {
    engine: Arc<dyn EngineClient>,
    image: String,
    scoped_name: String,
    privileged: Mutex<bool>,
    auto_remove: Mutex<bool>,
    env: Mutex<BTreeMap<String, String>>,
    mounts: Mutex<Vec<MountSpec>>,
    ports: Mutex<Vec<PortSpec>>,
    command: Mutex<Option<Vec<String>>>,
    entrypoint: Mutex<Option<Vec<String>>>,
    /// Engine-side container id; `None` until first successful start or
    /// after the engine reports the container gone.
    container_id: Mutex<Option<String>>,
    ready_timeout: u32,
}

impl ContainerHandle {
    pub fn new(engine: Arc<dyn EngineClient>, image: &str, logical_name: &str) -> Self {
        Self {
            engine,
            image: image.to_string(),
            scoped_name: format!("{NAME_PREFIX}{logical_name}"),
            privileged: Mutex::new(false),
            auto_remove: Mutex::new(true),
            env: Mutex::new(BTreeMap::new()),
            mounts: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
            command: Mutex::new(None),
            entrypoint: Mutex::new(None),
            container_id: Mutex::new(None),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, attempts: u32) -> Self {
        self.ready_timeout = attempts;
        self
    }

    pub fn scoped_name(&self) -> &str {
        &self.scoped_name
    }

    pub fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }

    pub fn set_privileged(&self, privileged: bool) {
        *self.privileged.lock().unwrap() = privileged;
    }

    pub fn set_auto_remove(&self, auto_remove: bool) {
        *self.auto_remove.lock().unwrap() = auto_remove;
    }

    /// Environment is only effective when set before the container is
    /// created; the engine freezes it at creation time.
    pub fn set_env(&self, key: &str, value: &str) {
        self.env
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Host paths are normalized to absolute before use.
    pub fn add_mount(&self, host_path: impl Into<PathBuf>, container_path: &str, read_only: bool) {
        let host_path: PathBuf = host_path.into();
        let host_path = if host_path.is_absolute() {
            host_path
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&host_path))
                .unwrap_or(host_path)
        };
        self.mounts.lock().unwrap().push(MountSpec {
            host_path,
            container_path: container_path.to_string(),
            read_only,
        });
    }

    pub fn add_port(&self, port: PortSpec) {
        self.ports.lock().unwrap().push(port);
    }

    pub fn set_command(&self, command: Vec<String>) {
        *self.command.lock().unwrap() = Some(command);
    }

    pub fn set_entrypoint(&self, entrypoint: Vec<String>) {
        *self.entrypoint.lock().unwrap() = Some(entrypoint);
    }

    pub fn runtime_id(&self) -> Option<String> {
        self.container_id.lock().unwrap().clone()
    }

    fn set_runtime_id(&self, id: Option<String>) {
        *self.container_id.lock().unwrap() = id;
    }

    fn build_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            name: self.scoped_name.clone(),
            privileged: *self.privileged.lock().unwrap(),
            auto_remove: *self.auto_remove.lock().unwrap(),
            env: self.env.lock().unwrap().clone(),
            mounts: self.mounts.lock().unwrap().clone(),
            ports: self.ports.lock().unwrap().clone(),
            command: self.command.lock().unwrap().clone(),
            entrypoint: self.entrypoint.lock().unwrap().clone(),
        }
    }

    /// Is a container with this handle's scoped name currently running
    /// on the engine? Queries by name, so it works without (and does not
    /// touch) the cached runtime reference.
    pub async fn find_existing(&self) -> Result<Option<crate::engine::ContainerSummary>> {
        let listed = self.engine.list_containers(&self.scoped_name, true).await?;
        Ok(listed.into_iter().find(|c| c.name == self.scoped_name))
    }

    /// Bring the container to `running`, creating it if needed. Idempotent:
    /// calling twice with no external interference yields exactly one
    /// container and two successes.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut recreated = false;
        let id = loop {
            match self.start_once().await {
                Ok(id) => break id,
                // A freshly listed or created container cannot itself come
                // back NotFound from step 1, so one retry suffices.
                Err(e) if e.is_not_found() && !recreated => {
                    warn!(
                        container = %self.scoped_name,
                        "Container vanished (probably auto-removed), recreating"
                    );
                    self.set_runtime_id(None);
                    recreated = true;
                }
                Err(e) => {
                    return Err(Error::StartFailed {
                        name: self.scoped_name.clone(),
                        source: Box::new(e),
                    })
                }
            }
        };

        self.wait_running(&id).await
    }

    /// One pass of the start state machine; returns the container id to
    /// poll for readiness. Raises `NotFound` only from the cached-reference
    /// branch, which the caller recovers from.
    async fn start_once(&self) -> Result<String> {
        match self.runtime_id() {
            None => {
                if let Some(existing) = self.find_existing().await? {
                    self.set_runtime_id(Some(existing.id.clone()));
                    if existing.status.is_running() {
                        debug!(container = %self.scoped_name, "Already running, adopting");
                        return Ok(existing.id);
                    }
                    info!(container = %self.scoped_name, "Starting existing container");
                    self.engine.start(&existing.id).await?;
                    return Ok(existing.id);
                }

                let spec = self.build_spec();
                info!(container = %self.scoped_name, image = %self.image, "Creating container");
                let id = self.engine.create(&spec).await?;
                self.set_runtime_id(Some(id.clone()));
                self.engine.start(&id).await?;
                Ok(id)
            }
            Some(id) => {
                let details = self.engine.inspect(&id).await?;
                if !details.status.is_running() {
                    info!(container = %self.scoped_name, "Starting container");
                    self.engine.start(&id).await?;
                }
                Ok(id)
            }
        }
    }

    /// Poll the engine until the container reports `running`, bounded by
    /// the readiness timeout at one attempt per second.
    async fn wait_running(&self, id: &str) -> Result<()> {
        for attempt in 1..=self.ready_timeout {
            match self.engine.inspect(id).await {
                Ok(details) if details.status.is_running() => return Ok(()),
                Ok(_) | Err(_) => {
                    debug!(
                        container = %self.scoped_name,
                        attempt,
                        "Waiting for container to run"
                    );
                }
            }
            if attempt < self.ready_timeout {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        Err(Error::StartTimeout {
            name: self.scoped_name.clone(),
            attempts: self.ready_timeout,
        })
    }

    /// The engine-side id, falling back to a lookup by scoped name when
    /// no reference is cached (an instance known to this process but
    /// last started by a previous one). A found container is adopted.
    async fn resolve_id(&self) -> Result<Option<String>> {
        if let Some(id) = self.runtime_id() {
            return Ok(Some(id));
        }
        match self.find_existing().await? {
            Some(existing) => {
                self.set_runtime_id(Some(existing.id.clone()));
                Ok(Some(existing.id))
            }
            None => Ok(None),
        }
    }

    /// The container's address on the engine's default network. Transiently
    /// unassigned right after creation; callers treat `NoIpAssigned` as
    /// "not ready yet" and retry.
    pub async fn ip(&self) -> Result<String> {
        let id = self
            .runtime_id()
            .ok_or_else(|| Error::NotRunning(self.scoped_name.clone()))?;
        let details = match self.engine.inspect(&id).await {
            Ok(details) => details,
            Err(e) => {
                if e.is_not_found() {
                    self.set_runtime_id(None);
                }
                return Err(e);
            }
        };
        details
            .ip_address
            .ok_or_else(|| Error::NoIpAssigned(self.scoped_name.clone()))
    }

    pub async fn exec(&self, cmd: Vec<String>, workdir: Option<String>) -> Result<ExecOutput> {
        let id = self
            .resolve_id()
            .await?
            .ok_or_else(|| Error::NotRunning(self.scoped_name.clone()))?;
        match self.engine.exec(&id, cmd, workdir).await {
            Ok(out) => Ok(out),
            Err(e) => {
                if e.is_not_found() {
                    self.set_runtime_id(None);
                }
                Err(e)
            }
        }
    }

    /// Stop and wait (bounded) until the engine reports the container no
    /// longer running; a disappearing container counts as stopped.
    pub async fn stop(&self) -> Result<()> {
        let id = self
            .resolve_id()
            .await?
            .ok_or_else(|| Error::NotRunning(self.scoped_name.clone()))?;
        match self.engine.stop(&id, CLEANUP_STOP_TIMEOUT_SECS).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.set_runtime_id(None);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        for _ in 0..self.ready_timeout {
            match self.engine.inspect(&id).await {
                Ok(details) if !details.status.is_running() => break,
                Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(e) if e.is_not_found() => {
                    self.set_runtime_id(None);
                    break;
                }
                Err(e) => {
                    warn!(container = %self.scoped_name, error = %e, "Error waiting for stop");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Ok(())
    }

    /// Best-effort teardown. Never fails: this runs from shutdown paths
    /// with no one left to handle an error. Falls back to a lookup by
    /// scoped name so a container surviving from a previous process is
    /// torn down too. The runtime reference is cleared unconditionally.
    pub async fn cleanup(&self) {
        let id = match self.resolve_id().await {
            Ok(id) => id,
            Err(e) => {
                error!(container = %self.scoped_name, error = %e, "Error during cleanup");
                None
            }
        };
        if let Some(id) = id {
            debug!(container = %self.scoped_name, "Cleaning up container");
            match self.engine.stop(&id, CLEANUP_STOP_TIMEOUT_SECS).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(container = %self.scoped_name, error = %e, "Error during cleanup");
                }
            }
        }
        self.set_runtime_id(None);
    }
}

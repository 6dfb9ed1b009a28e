//! Fleet registry: the process-wide collection of robot instances.
//!
//! Owns the instance map and the active sys-id set, serializes
//! lifecycle-mutating operations per instance, and reattaches to
//! instances found on disk at startup. Status queries never take the
//! lifecycle lock and tolerate instances disappearing mid-read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::{instance_name, sys_id_of, SdkPaths};
use crate::engine::EngineClient;
use crate::error::{Error, Result};
use crate::proxy::RegistryProxy;
use crate::robot::{build_robot, InstanceStatus, Robot};

/// Parallelism bound for fleet-wide operations. Nested engines are
/// independent; only the shared proxy serializes internally.
const FLEET_CONCURRENCY: usize = 4;

/// Notified after any fleet-mutating operation so the presentation
/// layer can refresh.
pub trait FleetObserver: Send + Sync {
    fn instances_changed(&self);
}

struct InstanceEntry {
    robot: Arc<dyn Robot>,
    /// Held for the duration of any lifecycle-mutating call, so a
    /// concurrent start and delete on the same name cannot interleave.
    lifecycle: tokio::sync::Mutex<()>,
}

pub struct FleetRegistry {
    engine: Arc<dyn EngineClient>,
    paths: SdkPaths,
    proxy: Option<Arc<RegistryProxy>>,
    instances: RwLock<HashMap<String, Arc<InstanceEntry>>>,
    active_sys_ids: Mutex<HashSet<u32>>,
    observers: Mutex<Vec<Arc<dyn FleetObserver>>>,
}

impl FleetRegistry {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        paths: SdkPaths,
        proxy: Option<Arc<RegistryProxy>>,
    ) -> Self {
        Self {
            engine,
            paths,
            proxy,
            instances: RwLock::new(HashMap::new()),
            active_sys_ids: Mutex::new(HashSet::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn paths(&self) -> &SdkPaths {
        &self.paths
    }

    pub fn add_observer(&self, observer: Arc<dyn FleetObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    fn notify(&self) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.instances_changed();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn active_sys_ids(&self) -> HashSet<u32> {
        self.active_sys_ids.lock().unwrap().clone()
    }

    fn entry(&self, name: &str) -> Option<Arc<InstanceEntry>> {
        self.instances.read().unwrap().get(name).cloned()
    }

    fn register(&self, name: &str) -> Result<Arc<InstanceEntry>> {
        let robot = build_robot(
            Arc::clone(&self.engine),
            &self.paths,
            name,
            self.proxy.clone(),
        )?;
        let entry = Arc::new(InstanceEntry {
            robot,
            lifecycle: tokio::sync::Mutex::new(()),
        });
        self.instances
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Register every instance found under the persisted data root
    /// without starting anything. Single-shot commands use this to
    /// address instances by name; `reattach_all` builds on it.
    pub async fn load_persisted(&self) -> Result<Vec<String>> {
        let data_dir = self.paths.data_dir();
        let mut found: Vec<String> = Vec::new();
        if data_dir.is_dir() {
            for dir_entry in std::fs::read_dir(&data_dir)? {
                let dir_entry = dir_entry?;
                if dir_entry.file_type()?.is_dir() {
                    found.push(dir_entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        found.sort();

        let mut loaded = Vec::new();
        for name in found {
            match sys_id_of(&name) {
                Ok(sys_id) => {
                    self.active_sys_ids.lock().unwrap().insert(sys_id);
                }
                Err(e) => {
                    warn!(instance = %name, error = %e, "Skipping directory with unparseable name");
                    continue;
                }
            }
            match self.register(&name) {
                Ok(_) => loaded.push(name),
                Err(e) => error!(instance = %name, error = %e, "Failed to reconstruct instance"),
            }
        }
        self.notify();
        Ok(loaded)
    }

    /// Rebuild the fleet from the persisted instance directories and
    /// bring every instance up, adopting containers that survived a
    /// previous process. Per-instance failures are logged, never fatal.
    pub async fn reattach_all(&self) -> Result<()> {
        let loaded = self.load_persisted().await?;
        info!(count = loaded.len(), "Reattaching persisted instances");

        let entries: Vec<(String, Arc<InstanceEntry>)> = loaded
            .into_iter()
            .filter_map(|name| self.entry(&name).map(|entry| (name, entry)))
            .collect();

        // All instances are registered before any of them starts, so
        // status queries see the full fleet during the (slow) bring-up.
        let results: Vec<(String, Result<()>)> = stream::iter(entries)
            .map(|(name, entry)| async move {
                let _guard = entry.lifecycle.lock().await;
                let result = entry.robot.start().await;
                (name, result)
            })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect()
            .await;

        for (name, result) in results {
            match result {
                Ok(()) => debug!(instance = %name, "Instance reattached"),
                Err(e) => error!(instance = %name, error = %e, "Instance failed to start on reattach"),
            }
        }
        self.notify();
        Ok(())
    }

    /// Provision a new instance. The sys id is validated and reserved
    /// before any side effect, so a rejected create leaves nothing
    /// behind.
    pub async fn create(
        &self,
        robot_type: &str,
        sys_id: u32,
        options: &BTreeMap<String, String>,
    ) -> Result<String> {
        let name = instance_name(robot_type, sys_id);
        {
            let mut ids = self.active_sys_ids.lock().unwrap();
            if !ids.insert(sys_id) {
                return Err(Error::SysIdInUse(sys_id));
            }
        }

        let entry = match self.persist_and_register(&name, options) {
            Ok(entry) => entry,
            Err(e) => {
                // Reservation rollback; nothing else was built yet.
                self.active_sys_ids.lock().unwrap().remove(&sys_id);
                let _ = std::fs::remove_dir_all(self.paths.instance_dir(&name));
                return Err(e);
            }
        };
        self.notify();

        info!(instance = %name, sys_id, "Creating instance");
        let result = {
            let _guard = entry.lifecycle.lock().await;
            entry.robot.start().await
        };
        if let Err(e) = result {
            // The instance stays registered; the operator can retry or
            // delete it.
            error!(instance = %name, error = %e, "Instance failed to start after create");
            self.notify();
            return Err(e);
        }

        self.notify();
        Ok(name)
    }

    fn persist_and_register(
        &self,
        name: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Arc<InstanceEntry>> {
        std::fs::create_dir_all(self.paths.instance_dir(name))?;
        crate::config::EnvFile::new(self.paths.instance_config(name)).set_many(options)?;
        self.register(name)
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        let result = {
            let _guard = entry.lifecycle.lock().await;
            entry.robot.start().await
        };
        self.notify();
        result
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        let result = {
            let _guard = entry.lifecycle.lock().await;
            entry.robot.stop().await
        };
        self.notify();
        result
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        let result = {
            let _guard = entry.lifecycle.lock().await;
            entry.robot.restart().await
        };
        self.notify();
        result
    }

    /// Remove an instance: map entry first (so status queries stop
    /// seeing it immediately), then best-effort container teardown, then
    /// the data directory. Idempotent and always terminates.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let entry = self.instances.write().unwrap().remove(name);

        if let Some(entry) = entry {
            let _guard = entry.lifecycle.lock().await;
            entry.robot.cleanup().await;
        }

        if let Ok(sys_id) = sys_id_of(name) {
            self.active_sys_ids.lock().unwrap().remove(&sys_id);
        }

        let dir = self.paths.instance_dir(name);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(instance = %name, error = %e, "Failed to delete instance data directory");
            }
        }

        info!(instance = %name, "Instance deleted");
        self.notify();
        Ok(())
    }

    /// Never raises; unknown or vanished instances report `NotCreated`.
    pub async fn status(&self, name: &str) -> InstanceStatus {
        match self.entry(name) {
            Some(entry) => entry.robot.status().await,
            None => InstanceStatus::NotCreated,
        }
    }

    pub async fn statuses(&self) -> Vec<(String, InstanceStatus)> {
        let entries: Vec<(String, Arc<InstanceEntry>)> = {
            let map = self.instances.read().unwrap();
            map.iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut statuses: Vec<(String, InstanceStatus)> = stream::iter(entries)
            .map(|(name, entry)| async move {
                let status = entry.robot.status().await;
                (name, status)
            })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect()
            .await;
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub async fn ip(&self, name: &str) -> Result<String> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        entry.robot.ip().await
    }

    pub fn env(&self, name: &str, key: &str) -> Result<Option<String>> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        entry.robot.env(key)
    }

    pub fn set_env(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let entry = self
            .entry(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        entry.robot.set_env(key, value)
    }

    /// Graceful-shutdown path: best-effort cleanup of every live
    /// instance and the shared proxy. Never fails.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Arc<InstanceEntry>)> = {
            let map = self.instances.read().unwrap();
            map.iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
                .collect()
        };
        info!(count = entries.len(), "Shutting down fleet");

        stream::iter(entries)
            .map(|(name, entry)| async move {
                let _guard = entry.lifecycle.lock().await;
                entry.robot.cleanup().await;
                debug!(instance = %name, "Instance cleaned up");
            })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;

        if let Some(proxy) = &self.proxy {
            proxy.cleanup().await;
        }
        self.notify();
    }
}

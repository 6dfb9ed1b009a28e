//! In-memory engine fake driving the lifecycle tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use spiri_engine::engine::{
    ContainerDetails, ContainerSpec, ContainerStatus, ContainerSummary, EngineClient, ExecOutput,
};
use spiri_engine::error::{Error, Result};

#[derive(Clone)]
struct Container {
    id: String,
    name: String,
    status: ContainerStatus,
    auto_remove: bool,
    labels: HashMap<String, String>,
    spec: Option<ContainerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExec {
    pub container: String,
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
}

struct Inner {
    containers: Vec<Container>,
    next_id: u64,
    created: u64,
    inspects: u64,
    execs: Vec<RecordedExec>,
    exec_results: VecDeque<ExecOutput>,
    ping_failures: u32,
    /// When false, `start` leaves containers in `Created` so readiness
    /// loops can be driven to exhaustion.
    run_on_start: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            containers: Vec::new(),
            next_id: 0,
            created: 0,
            inspects: 0,
            execs: Vec::new(),
            exec_results: VecDeque::new(),
            ping_failures: 0,
            run_on_start: true,
        }
    }
}

pub struct FakeEngine {
    inner: Mutex<Inner>,
    nested: Mutex<Option<Arc<FakeEngine>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            nested: Mutex::new(None),
        })
    }

    /// The engine handed out for any nested socket, created lazily.
    pub fn nested(&self) -> Arc<FakeEngine> {
        let mut nested = self.nested.lock().unwrap();
        nested.get_or_insert_with(FakeEngine::new).clone()
    }

    pub fn set_run_on_start(&self, run: bool) {
        self.inner.lock().unwrap().run_on_start = run;
    }

    pub fn set_ping_failures(&self, failures: u32) {
        self.inner.lock().unwrap().ping_failures = failures;
    }

    pub fn push_exec_result(&self, result: ExecOutput) {
        self.inner.lock().unwrap().exec_results.push_back(result);
    }

    /// Out-of-band removal, as if an operator ran `rm -f` on the host.
    pub fn remove_named(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .containers
            .retain(|c| c.name != name);
    }

    /// Insert a container as if it predated this process.
    pub fn seed_running(&self, name: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("seed-{}", inner.next_id);
        inner.containers.push(Container {
            id: id.clone(),
            name: name.to_string(),
            status: ContainerStatus::Running,
            auto_remove: true,
            labels: HashMap::new(),
            spec: None,
        });
        id
    }

    /// The creation spec recorded for a container, if it was created
    /// through this fake (seeded containers have none).
    pub fn created_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.spec.clone())
    }

    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.iter_mut().find(|c| c.name == name) {
            c.labels.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(c) = inner.containers.iter_mut().find(|c| c.name == name) {
            c.status = status;
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn created_count(&self) -> u64 {
        self.inner.lock().unwrap().created
    }

    pub fn inspect_count(&self) -> u64 {
        self.inner.lock().unwrap().inspects
    }

    pub fn reset_inspect_count(&self) {
        self.inner.lock().unwrap().inspects = 0;
    }

    pub fn execs(&self) -> Vec<RecordedExec> {
        self.inner.lock().unwrap().execs.clone()
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn list_containers(&self, name: &str, all: bool) -> Result<Vec<ContainerSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .iter()
            .filter(|c| name.is_empty() || c.name.contains(name))
            .filter(|c| all || c.status.is_running())
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .iter()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .filter(|c| all || c.status.is_running())
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn count_by_status(&self, status: ContainerStatus) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .iter()
            .filter(|c| c.status == status)
            .count())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.iter().any(|c| c.name == spec.name) {
            return Err(Error::Engine(format!("name {} already in use", spec.name)));
        }
        inner.next_id += 1;
        inner.created += 1;
        let id = format!("fake-{}", inner.next_id);
        inner.containers.push(Container {
            id: id.clone(),
            name: spec.name.clone(),
            status: ContainerStatus::Created,
            auto_remove: spec.auto_remove,
            labels: HashMap::new(),
            spec: Some(spec.clone()),
        });
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner.run_on_start;
        let container = inner
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if run {
            container.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let mut inner = self.inner.lock().unwrap();
        inner.inspects += 1;
        let container = inner
            .containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let ip = container
            .status
            .is_running()
            .then(|| format!("10.89.0.{}", container.id.len()));
        Ok(ContainerDetails {
            id: container.id.clone(),
            status: container.status,
            ip_address: ip,
        })
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        workdir: Option<String>,
    ) -> Result<ExecOutput> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let name = container.name.clone();
        inner.execs.push(RecordedExec {
            container: name,
            cmd,
            workdir,
        });
        Ok(inner.exec_results.pop_front().unwrap_or(ExecOutput {
            exit_code: 0,
            output: String::new(),
        }))
    }

    async fn stop(&self, id: &str, _timeout_secs: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = inner
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Exited;
        if container.auto_remove {
            inner.containers.retain(|c| c.id != id);
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.containers.len();
        inner.containers.retain(|c| c.id != id);
        if inner.containers.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.ping_failures > 0 {
            inner.ping_failures -= 1;
            return Err(Error::Unreachable("daemon still booting".to_string()));
        }
        Ok(())
    }

    fn open_socket(&self, _socket: &Path) -> Result<Arc<dyn EngineClient>> {
        Ok(self.nested())
    }
}

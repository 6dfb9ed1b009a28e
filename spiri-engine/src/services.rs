//! Service stack launcher.
//!
//! Walks a robot type's service-definition tree, decides autostart per
//! manifest flag, and runs compose inside the nested engine over its
//! private socket. The manifest is never interpreted beyond the
//! autostart field; an existing compose implementation does the rest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::SdkPaths;
use crate::dind::NestedEngine;
use crate::engine::{ContainerStatus, ExecOutput};
use crate::error::{Error, Result};

/// Accepted manifest filenames, in lookup order.
const MANIFEST_NAMES: [&str; 2] = ["docker-compose.yaml", "docker-compose.yml"];

/// Instance config file as seen from inside the nested engine; passed to
/// compose as its env file.
const ENV_FILE_ARG: &str = "--env-file=/data/config.env";

const COMPOSE_ATTEMPTS: u32 = 3;
const COMPOSE_BACKOFF: Duration = Duration::from_secs(5);

/// Bound on waiting for a project's containers to drain after a down.
const STOP_DRAIN_ATTEMPTS: u32 = 30;

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Locate a service's compose manifest, trying the accepted filenames in
/// order.
pub fn find_manifest(service_dir: &Path) -> Option<PathBuf> {
    MANIFEST_NAMES
        .iter()
        .map(|name| service_dir.join(name))
        .find(|p| p.is_file())
}

/// The only part of a manifest this engine reads: the custom top-level
/// `x-spiri-sdk-autostart` field. Service internals stay opaque.
#[derive(Debug, Deserialize)]
struct ManifestFlags {
    #[serde(rename = "x-spiri-sdk-autostart", default = "autostart_default")]
    autostart: bool,
}

fn autostart_default() -> bool {
    true
}

/// Read the autostart flag from manifest text. Absent or unparseable
/// means enabled.
pub fn autostart_enabled(manifest_text: &str) -> bool {
    serde_yaml::from_str::<ManifestFlags>(manifest_text)
        .map(|flags| flags.autostart)
        .unwrap_or(true)
}

/// Run one compose invocation inside the nested engine with bounded
/// retry. Retries cover the whole invocation (transient daemon
/// unavailability, nonzero exits), not individual services.
pub async fn run_compose(
    instance: &NestedEngine,
    args: Vec<String>,
    workdir: &str,
) -> Result<ExecOutput> {
    let mut cmd = vec!["docker".to_string(), "compose".to_string(), ENV_FILE_ARG.to_string()];
    cmd.extend(args);

    let mut last_output = String::new();
    for attempt in 1..=COMPOSE_ATTEMPTS {
        match instance.exec(cmd.clone(), Some(workdir.to_string())).await {
            Ok(out) if out.success() => return Ok(out),
            Ok(out) => {
                debug!(instance = %instance.name(), attempt, exit = out.exit_code, "Compose attempt failed");
                last_output = out.output;
            }
            Err(e) => {
                debug!(instance = %instance.name(), attempt, error = %e, "Compose invocation failed");
                last_output = e.to_string();
            }
        }
        if attempt < COMPOSE_ATTEMPTS {
            tokio::time::sleep(COMPOSE_BACKOFF).await;
        }
    }

    Err(Error::ComposeFailed {
        attempts: COMPOSE_ATTEMPTS,
        output: last_output,
    })
}

/// One discovered service: its directory name and manifest paths on both
/// sides of the services mount.
struct Service {
    name: String,
    manifest_host: PathBuf,
    manifest_in_container: String,
    workdir_in_container: String,
}

fn discover_services(instance: &NestedEngine, paths: &SdkPaths) -> Result<Vec<Service>> {
    let services_root = paths
        .robots_dir()
        .join(instance.robot_type())
        .join("services");
    if !services_root.is_dir() {
        info!(
            instance = %instance.name(),
            path = %services_root.display(),
            "No service definitions for robot type"
        );
        return Ok(Vec::new());
    }

    let mount_root = format!("{}/services", instance.services_mount());
    let mut services = Vec::new();
    for entry in std::fs::read_dir(&services_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(manifest_host) = find_manifest(&entry.path()) else {
            warn!(instance = %instance.name(), service = %name, "No compose manifest, skipping");
            continue;
        };
        let file_name = manifest_host
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        services.push(Service {
            manifest_in_container: format!("{mount_root}/{name}/{file_name}"),
            workdir_in_container: format!("{mount_root}/{name}"),
            name,
            manifest_host,
        });
    }
    services.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(services)
}

/// Bring up every autostart-enabled service of the instance. A single
/// service failing is logged and does not stop the batch.
pub async fn start_services(instance: &NestedEngine, paths: &SdkPaths) -> Result<()> {
    for service in discover_services(instance, paths)? {
        let manifest_text = match std::fs::read_to_string(&service.manifest_host) {
            Ok(text) => text,
            Err(e) => {
                warn!(instance = %instance.name(), service = %service.name, error = %e, "Cannot read manifest, skipping");
                continue;
            }
        };
        if !autostart_enabled(&manifest_text) {
            debug!(instance = %instance.name(), service = %service.name, "Autostart disabled, skipping");
            continue;
        }

        info!(instance = %instance.name(), service = %service.name, "Starting service");
        let args = vec![
            "-f".to_string(),
            service.manifest_in_container.clone(),
            "up".to_string(),
            "-d".to_string(),
        ];
        if let Err(e) = run_compose(instance, args, &service.workdir_in_container).await {
            warn!(instance = %instance.name(), service = %service.name, error = %e, "Service failed to start");
        }
    }
    Ok(())
}

/// Take down every service with a resolvable manifest, then wait
/// (bounded) for each project's containers to drain. A project that
/// cannot confirm drains is logged and skipped rather than blocking.
pub async fn stop_services(instance: &NestedEngine, paths: &SdkPaths) -> Result<()> {
    for service in discover_services(instance, paths)? {
        info!(instance = %instance.name(), service = %service.name, "Stopping service");
        let args = vec![
            "-f".to_string(),
            service.manifest_in_container.clone(),
            "down".to_string(),
            "--remove-orphans".to_string(),
        ];
        if let Err(e) = run_compose(instance, args, &service.workdir_in_container).await {
            warn!(instance = %instance.name(), service = %service.name, error = %e, "Service failed to stop");
            continue;
        }
        wait_project_drained(instance, &service.name).await;
    }
    Ok(())
}

/// Compose labels child containers with their project (the service
/// directory name, lowercased); wait until none of them are live.
async fn wait_project_drained(instance: &NestedEngine, service: &str) {
    let project = service.to_lowercase();
    let client = match instance.nested_client() {
        Ok(client) => client,
        Err(e) => {
            warn!(instance = %instance.name(), service, error = %e, "Cannot confirm service stop");
            return;
        }
    };

    for _ in 0..STOP_DRAIN_ATTEMPTS {
        let live = match client.list_by_label(COMPOSE_PROJECT_LABEL, &project, true).await {
            Ok(listed) => listed
                .iter()
                .filter(|c| {
                    matches!(
                        c.status,
                        ContainerStatus::Running
                            | ContainerStatus::Created
                            | ContainerStatus::Restarting
                    )
                })
                .count(),
            Err(e) => {
                warn!(instance = %instance.name(), service, error = %e, "Cannot confirm service stop");
                return;
            }
        };
        if live == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    warn!(instance = %instance.name(), service, "Service containers still live after stop");
}

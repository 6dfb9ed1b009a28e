mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::FakeEngine;
use spiri_engine::config::SdkPaths;
use spiri_engine::engine::EngineClient;
use spiri_engine::error::Error;
use spiri_engine::fleet::{FleetObserver, FleetRegistry};
use spiri_engine::robot::InstanceStatus;
use tempfile::TempDir;

struct ChangeCounter(AtomicUsize);

impl FleetObserver for ChangeCounter {
    fn instances_changed(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn registry(root: &TempDir, engine: Arc<FakeEngine>) -> FleetRegistry {
    let paths = SdkPaths::new(root.path()).with_socket_dir(root.path().join("sockets"));
    FleetRegistry::new(engine as Arc<dyn EngineClient>, paths, None)
}

fn options() -> BTreeMap<String, String> {
    BTreeMap::from([("WORLD".to_string(), "citadel_hill".to_string())])
}

#[tokio::test]
async fn sys_ids_are_exclusive_across_active_instances() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    let name = fleet.create("spiri_mu", 7, &options()).await.unwrap();
    assert_eq!(name, "spiri_mu_7");

    let containers_before = engine.container_count();
    let err = fleet.create("spiri_mu", 7, &options()).await.unwrap_err();
    assert!(matches!(err, Error::SysIdInUse(7)));
    // Rejected before any side effect.
    assert_eq!(engine.container_count(), containers_before);

    let name = fleet.create("spiri_mu", 8, &options()).await.unwrap();
    assert_eq!(name, "spiri_mu_8");
    assert_eq!(
        fleet.active_sys_ids(),
        std::collections::HashSet::from([7, 8])
    );
}

#[tokio::test]
async fn create_persists_the_instance_config() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();

    let config = root.path().join("data/spiri_mu_7/config.env");
    let text = std::fs::read_to_string(config).unwrap();
    assert!(text.contains("WORLD=citadel_hill"));

    assert_eq!(fleet.env("spiri_mu_7", "WORLD").unwrap().as_deref(), Some("citadel_hill"));
    fleet.set_env("spiri_mu_7", "WORLD", "warehouse").unwrap();
    assert_eq!(fleet.env("spiri_mu_7", "WORLD").unwrap().as_deref(), Some("warehouse"));
}

#[tokio::test]
async fn delete_is_order_safe_and_idempotent() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();
    assert!(root.path().join("data/spiri_mu_7").is_dir());

    fleet.delete("spiri_mu_7").await.unwrap();
    assert!(!root.path().join("data/spiri_mu_7").exists());
    assert!(fleet.active_sys_ids().is_empty());
    assert_eq!(engine.container_count(), 0);

    // A second delete finds nothing and still succeeds.
    fleet.delete("spiri_mu_7").await.unwrap();

    // The freed sys id is usable again.
    fleet.create("spiri_mu", 7, &options()).await.unwrap();
}

#[tokio::test]
async fn status_degrades_to_not_created_after_out_of_band_removal() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();
    assert_eq!(fleet.status("spiri_mu_7").await, InstanceStatus::StartingUp);

    engine.remove_named("spirisdk_spiri_mu_7");
    assert_eq!(fleet.status("spiri_mu_7").await, InstanceStatus::NotCreated);

    // Unknown names also degrade instead of raising.
    assert_eq!(fleet.status("spiri_mu_99").await, InstanceStatus::NotCreated);
}

#[tokio::test]
async fn status_reports_child_container_buckets() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();
    engine.nested().seed_running("mavros");

    match fleet.status("spiri_mu_7").await {
        InstanceStatus::Running(buckets) => assert_eq!(buckets.running, 1),
        other => panic!("expected running status, got {other}"),
    }
}

#[tokio::test]
async fn reattach_adopts_containers_from_a_previous_process() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.seed_running("spirisdk_spiri_mu_7");
    std::fs::create_dir_all(root.path().join("data/spiri_mu_7")).unwrap();
    std::fs::write(root.path().join("data/spiri_mu_7/config.env"), "WORLD=citadel_hill\n").unwrap();

    let fleet = registry(&root, engine.clone());
    fleet.reattach_all().await.unwrap();

    assert_eq!(fleet.names(), vec!["spiri_mu_7"]);
    assert_eq!(fleet.active_sys_ids(), std::collections::HashSet::from([7]));
    // Adopted, not recreated.
    assert_eq!(engine.created_count(), 0);
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test]
async fn delete_tears_down_containers_from_a_previous_process() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.seed_running("spirisdk_spiri_mu_7");
    std::fs::create_dir_all(root.path().join("data/spiri_mu_7")).unwrap();
    std::fs::write(root.path().join("data/spiri_mu_7/config.env"), "WORLD=citadel_hill\n").unwrap();

    // Single-shot commands register from disk without starting anything,
    // so no runtime reference is cached when delete runs.
    let fleet = registry(&root, engine.clone());
    fleet.load_persisted().await.unwrap();

    fleet.delete("spiri_mu_7").await.unwrap();

    assert_eq!(engine.container_count(), 0);
    assert!(!root.path().join("data/spiri_mu_7").exists());
    assert!(fleet.active_sys_ids().is_empty());
}

#[tokio::test]
async fn stop_reaches_containers_from_a_previous_process() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    engine.seed_running("spirisdk_spiri_mu_7");
    std::fs::create_dir_all(root.path().join("data/spiri_mu_7")).unwrap();
    std::fs::write(root.path().join("data/spiri_mu_7/config.env"), "WORLD=citadel_hill\n").unwrap();

    let fleet = registry(&root, engine.clone());
    fleet.load_persisted().await.unwrap();

    fleet.stop("spiri_mu_7").await.unwrap();

    assert_eq!(engine.container_count(), 0);
}

#[tokio::test]
async fn unknown_instances_are_rejected_by_lifecycle_calls() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    assert!(matches!(
        fleet.start("spiri_mu_7").await,
        Err(Error::UnknownInstance(_))
    ));
    assert!(matches!(
        fleet.stop("spiri_mu_7").await,
        Err(Error::UnknownInstance(_))
    ));
}

#[tokio::test]
async fn observers_fire_on_mutations() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());
    let counter = Arc::new(ChangeCounter(AtomicUsize::new(0)));
    fleet.add_observer(counter.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();
    let after_create = counter.0.load(Ordering::SeqCst);
    assert!(after_create > 0);

    fleet.delete("spiri_mu_7").await.unwrap();
    assert!(counter.0.load(Ordering::SeqCst) > after_create);
}

#[tokio::test]
async fn shutdown_cleans_up_every_instance() {
    let root = TempDir::new().unwrap();
    let engine = FakeEngine::new();
    let fleet = registry(&root, engine.clone());

    fleet.create("spiri_mu", 7, &options()).await.unwrap();
    fleet.create("spiri_mu", 8, &options()).await.unwrap();
    assert_eq!(engine.container_count(), 2);

    fleet.shutdown().await;
    assert_eq!(engine.container_count(), 0);

    // Data directories survive shutdown; only delete removes them.
    assert!(root.path().join("data/spiri_mu_7").is_dir());
    assert!(root.path().join("data/spiri_mu_8").is_dir());
}

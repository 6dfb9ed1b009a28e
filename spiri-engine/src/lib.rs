//! Container lifecycle orchestration for simulated robot fleets.
//!
//! Each robot instance is backed by a nested container engine (a
//! privileged container running its own daemon) hosting the robot's
//! compose-declared service stack. This crate owns the full lifecycle:
//! creation, readiness, registry-proxy trust injection, service
//! autostart, status, and teardown, coordinated through a fleet
//! registry.

pub mod config;
pub mod dind;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod handle;
pub mod proxy;
pub mod robot;
pub mod services;
pub mod settings;
pub mod sim;

pub use config::SdkPaths;
pub use dind::{NestedEngine, StatusBuckets};
pub use engine::{ContainerStatus, DockerEngine, EngineClient};
pub use error::{Error, Result};
pub use fleet::{FleetObserver, FleetRegistry};
pub use handle::ContainerHandle;
pub use proxy::{CertSource, RegistryProxy};
pub use robot::{BackendKind, InstanceStatus, Robot};
pub use settings::{RegistryCredentials, Settings};

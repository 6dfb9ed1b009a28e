//! Error taxonomy for the fleet engine.
//!
//! `NotFound` is the one recoverable engine error: the container handle
//! state machine consumes it internally by recreating the container, and
//! it never bubbles past that layer. Everything else surfaces to the
//! fleet registry, which logs and notifies rather than crashing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The engine lost track of a container (removed out-of-band or
    /// auto-removed). Always recoverable by recreating.
    #[error("container not found: {0}")]
    NotFound(String),

    /// The engine daemon could not be reached. Transient.
    #[error("container engine unreachable: {0}")]
    Unreachable(String),

    /// Any other engine-side failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// Operation attempted on a handle with no live runtime reference.
    #[error("container {0} is not running")]
    NotRunning(String),

    /// The engine reported an empty address. Transient right after
    /// creation; callers retry rather than treating it as fatal.
    #[error("container {0} has no IP address assigned")]
    NoIpAssigned(String),

    #[error("container {name} not running after {attempts} attempts")]
    StartTimeout { name: String, attempts: u32 },

    #[error("failed to start container {name}")]
    StartFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("nested engine in {name} not ready after {attempts} attempts: {last}")]
    DaemonNotReady {
        name: String,
        attempts: u32,
        last: String,
    },

    #[error("registry proxy certificate not available after {attempts} attempts\ncert dir contents:\n{detail}")]
    CertificateTimeout { attempts: u32, detail: String },

    #[error("compose failed after {attempts} attempts: {output}")]
    ComposeFailed { attempts: u32, output: String },

    #[error("sys id {0} is already in use")]
    SysIdInUse(u32),

    #[error("no instance named {0}")]
    UnknownInstance(String),

    #[error("invalid instance name {0:?}: expected <robot_type>_<sys_id>")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

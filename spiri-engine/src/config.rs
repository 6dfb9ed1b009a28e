//! Process-wide paths, the instance naming convention, and the flat
//! `KEY=VALUE` config store backing each instance's `config.env`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable selecting the common ancestor of the data and
/// robot-definition trees. Absent means the current working directory.
pub const ROOT_ENV_VAR: &str = "SPIRI_SDK_ROOT";

/// Per-instance config file name inside the instance's data directory.
pub const CONFIG_FILE: &str = "config.env";

/// Config key selecting the robot backend.
pub const ROBOT_CLASS_KEY: &str = "ROBOT_CLASS";

const DEFAULT_SOCKET_DIR: &str = "/tmp/dind-sockets";

/// Resolved filesystem layout for one engine process.
#[derive(Debug, Clone)]
pub struct SdkPaths {
    root: PathBuf,
    socket_dir: PathBuf,
}

impl SdkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self {
            root,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
        }
    }

    /// Resolve from `SPIRI_SDK_ROOT`, defaulting to the working directory.
    pub fn from_env() -> Self {
        let root = std::env::var_os(ROOT_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(root)
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-instance persisted directories live here, one per instance name.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Robot-type definition trees (`<type>/services/<service>/...`).
    pub fn robots_dir(&self) -> PathBuf {
        self.root.join("robots")
    }

    /// Registry proxy certificate cache.
    pub fn cert_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("certs")
    }

    /// Shared host directory where nested engines expose control sockets.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    pub fn instance_config(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(CONFIG_FILE)
    }
}

/// `<robot_type>_<sys_id>` → robot type. The delimiter is `_` throughout;
/// the type itself may contain underscores, so only the trailing numeric
/// segment is stripped.
pub fn robot_type_of(name: &str) -> Result<String> {
    let (head, tail) = name
        .rsplit_once('_')
        .ok_or_else(|| Error::InvalidName(name.to_string()))?;
    if head.is_empty() || tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(head.to_string())
}

/// `<robot_type>_<sys_id>` → numeric system id.
pub fn sys_id_of(name: &str) -> Result<u32> {
    let (_, tail) = name
        .rsplit_once('_')
        .ok_or_else(|| Error::InvalidName(name.to_string()))?;
    tail.parse()
        .map_err(|_| Error::InvalidName(name.to_string()))
}

pub fn instance_name(robot_type: &str, sys_id: u32) -> String {
    format!("{robot_type}_{sys_id}")
}

/// A flat `KEY=VALUE` file: one declared variable per line, values
/// unquoted, `#` lines preserved as comments.
#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
}

impl EnvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All declared variables. A missing file reads as empty.
    pub fn load(&self) -> Result<BTreeMap<String, String>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut vars = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.trim().to_string(), value.to_string());
            }
        }
        Ok(vars)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    /// Set one variable, rewriting the file in place. Unrelated lines
    /// (comments, other keys) keep their order.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let existing = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<String> = Vec::new();
        let mut replaced = false;
        for line in existing.lines() {
            let trimmed = line.trim();
            let is_target = !trimmed.starts_with('#')
                && trimmed
                    .split_once('=')
                    .is_some_and(|(k, _)| k.trim() == key);
            if is_target {
                lines.push(format!("{key}={value}"));
                replaced = true;
            } else {
                lines.push(line.to_string());
            }
        }
        if !replaced {
            lines.push(format!("{key}={value}"));
        }

        std::fs::write(&self.path, lines.join("\n") + "\n")?;
        Ok(())
    }

    pub fn set_many(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in vars {
            self.set(key, value)?;
        }
        Ok(())
    }
}

//! Process-wide settings store.
//!
//! Registry credentials for the mirror proxy live in a flat `.env` file
//! at the SDK root, shared with whatever UI edits them. The file is
//! created empty on first touch so operators always have something to
//! edit.

use std::path::Path;

use crate::config::EnvFile;
use crate::error::Result;

const SETTINGS_FILE: &str = ".env";
const REGISTRIES_KEY: &str = "REGISTRIES";
const AUTH_REGISTRIES_KEY: &str = "AUTH_REGISTRIES";

/// Upstream registries the proxy mirrors, and the `host:user:password`
/// triples it authenticates with. Both are space-separated lists in the
/// proxy's own format; this store never parses them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub registries: String,
    pub auth_registries: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    file: EnvFile,
}

impl Settings {
    /// Open the settings store under `root`, creating an empty file when
    /// none exists yet.
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            std::fs::create_dir_all(root)?;
            std::fs::write(&path, "")?;
        }
        Ok(Self {
            file: EnvFile::new(path),
        })
    }

    pub fn registry_credentials(&self) -> Result<RegistryCredentials> {
        let vars = self.file.load()?;
        Ok(RegistryCredentials {
            registries: vars.get(REGISTRIES_KEY).cloned().unwrap_or_default(),
            auth_registries: vars.get(AUTH_REGISTRIES_KEY).cloned().unwrap_or_default(),
        })
    }

    pub fn set_registry_credentials(&self, creds: &RegistryCredentials) -> Result<()> {
        self.file.set(REGISTRIES_KEY, &creds.registries)?;
        self.file.set(AUTH_REGISTRIES_KEY, &creds.auth_registries)?;
        Ok(())
    }
}

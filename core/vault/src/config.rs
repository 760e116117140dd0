//! Engine configuration (`avp.toml`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentvault_common::{Error, Result, WorkspaceName};
use agentvault_storage::BackendConfig;

/// Default session lifetime in seconds.
pub const DEFAULT_SESSION_TTL: u64 = 3600;

/// Workspace used when the caller does not name one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// Complete engine configuration.
///
/// Treated as immutable once the engine is built; `validate` runs once at
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace for `authenticate_default`.
    #[serde(default = "default_workspace")]
    pub name: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: default_workspace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl: default_ttl() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file mirroring the audit trail. In-memory only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

fn default_ttl() -> u64 {
    DEFAULT_SESSION_TTL
}

impl EngineConfig {
    /// In-memory backend with defaults elsewhere.
    pub fn memory() -> Self {
        Self {
            backend: BackendConfig::Memory,
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    /// - `InvalidInput` for malformed TOML, unknown backend types or wrong
    ///   value types
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::InvalidInput(format!("Invalid config: {}", e)))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    /// - `InvalidInput` if it does not parse
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("Config file not found: {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        Self::from_toml_str(&content)
    }

    /// Check the configuration can start an engine.
    ///
    /// # Errors
    /// - `InvalidInput` for a zero TTL, an invalid workspace name, or
    ///   invalid backend values
    pub fn validate(&self) -> Result<()> {
        if self.session.ttl == 0 {
            return Err(Error::InvalidInput(
                "session.ttl must be at least 1 second".to_string(),
            ));
        }
        self.default_workspace()?;
        self.backend.validate()
    }

    /// The configured workspace name.
    pub fn default_workspace(&self) -> Result<WorkspaceName> {
        WorkspaceName::new(self.workspace.name.as_str())
    }

    /// Session lifetime.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl)
    }
}

//! Secret backend trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareInfo;
use crate::model::{Labels, Secret};
use agentvault_common::{
    BackendKind, Error, Result, SecretName, SecurityLevel, SensitiveBytes, WorkspaceName,
};

/// Master credential presented to a backend.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Vault password (EncryptedFile, Memory).
    Password(SensitiveBytes),
    /// Device PIN (Hardware).
    Pin(SensitiveBytes),
    /// Rely on the operating system login session (Keychain).
    OsLogin,
}

impl Credential {
    /// Build a password credential.
    pub fn password(password: impl Into<SensitiveBytes>) -> Self {
        Credential::Password(password.into())
    }

    /// Build a PIN credential.
    pub fn pin(pin: impl Into<SensitiveBytes>) -> Self {
        Credential::Pin(pin.into())
    }

    /// Which kind of credential this is. Never exposes the value.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Password(_) => CredentialKind::Password,
            Credential::Pin(_) => CredentialKind::Pin,
            Credential::OsLogin => CredentialKind::OsLogin,
        }
    }
}

/// Credential a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    Pin,
    OsLogin,
    /// Anything is accepted (unprotected memory backend).
    Any,
}

/// Capability and trust description returned by DISCOVER.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend variant.
    pub kind: BackendKind,
    /// Descriptive security level.
    pub security_level: SecurityLevel,
    /// Credential the backend expects at authentication.
    pub credential: CredentialKind,
    /// Whether secrets survive a process restart.
    pub persistent: bool,
    /// Whether every access needs physical touch confirmation.
    pub requires_touch: bool,
    /// Whether the backend link is currently established.
    pub connected: bool,
    /// Device details, for the hardware backend.
    pub hardware: Option<HardwareInfo>,
}

/// Storage backend for secrets, keyed by (workspace, name).
///
/// Implementations own their locking: mutating calls on the same vault are
/// serialized inside the backend. Backends never see sessions; the engine
/// has already resolved the workspace before calling in.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Backend variant tag.
    fn kind(&self) -> BackendKind;

    /// Describe capabilities without requiring authentication.
    async fn info(&self) -> BackendInfo;

    /// Establish the backend link (file directory, keychain service, device
    /// channel).
    ///
    /// # Errors
    /// - `Connection` if the resource is unavailable
    async fn connect(&self) -> Result<()>;

    /// Release the backend link and forget any unlocked key material.
    async fn disconnect(&self) -> Result<()>;

    /// One-time initialization with a master credential.
    ///
    /// # Errors
    /// - `InvalidState` for backends that need no provisioning
    /// - `AlreadyExists` if already provisioned
    async fn provision(&self, credential: &Credential) -> Result<()> {
        let _ = credential;
        Err(Error::InvalidState(format!(
            "{} backend does not support provisioning",
            self.kind()
        )))
    }

    /// Verify the master credential and unlock the backend.
    ///
    /// # Errors
    /// - `Authentication` for a rejected credential
    /// - `Integrity` if stored ciphertext fails to authenticate
    /// - `DeviceWiped` if the hardware erased itself
    async fn authenticate(&self, credential: &Credential) -> Result<()>;

    /// Store a secret, destructively overwriting any existing one.
    /// Returns the new version (1).
    async fn put(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
        labels: Labels,
    ) -> Result<u64>;

    /// Fetch a secret.
    ///
    /// # Errors
    /// - `NotFound` if absent from this workspace
    async fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<Secret>;

    /// Remove a secret. Returns whether one was removed.
    async fn delete(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<bool>;

    /// Secret names in this workspace, in the backend's native order.
    async fn list(&self, workspace: &WorkspaceName) -> Result<Vec<SecretName>>;

    /// Replace a value and increment its version. Returns the new version.
    ///
    /// # Errors
    /// - `NotFound` if absent from this workspace
    async fn rotate(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64>;
}

/// Error for calls made before a successful `authenticate`.
pub(crate) fn locked_error(kind: BackendKind) -> Error {
    Error::InvalidState(format!("{} backend is locked; authenticate first", kind))
}

/// Error for a credential of the wrong kind.
pub(crate) fn wrong_credential(kind: BackendKind, expected: CredentialKind) -> Error {
    Error::Authentication(format!(
        "{} backend expects a {:?} credential",
        kind, expected
    ))
}

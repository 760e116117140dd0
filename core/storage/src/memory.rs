//! In-memory secret backend for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{locked_error, BackendInfo, Credential, CredentialKind, SecretBackend};
use crate::model::{Labels, Secret, SecretTable};
use agentvault_common::{
    BackendKind, Error, Result, SecretName, SensitiveBytes, WorkspaceName,
};

/// In-memory secret backend.
///
/// Useful for testing and development. Nothing is encrypted and all data is
/// lost on drop.
pub struct MemoryBackend {
    table: RwLock<SecretTable>,
    password: Option<SensitiveBytes>,
    connected: AtomicBool,
    unlocked: AtomicBool,
}

impl MemoryBackend {
    /// Create a new empty backend that accepts any credential.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(SecretTable::new()),
            password: None,
            connected: AtomicBool::new(false),
            unlocked: AtomicBool::new(false),
        }
    }

    /// Create a backend that only accepts the given password.
    pub fn with_password(password: impl Into<SensitiveBytes>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::new()
        }
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.unlocked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(locked_error(BackendKind::Memory))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Memory,
            security_level: BackendKind::Memory.security_level(),
            credential: if self.password.is_some() {
                CredentialKind::Password
            } else {
                CredentialKind::Any
            },
            persistent: false,
            requires_touch: false,
            connected: self.connected.load(Ordering::SeqCst),
            hardware: None,
        }
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.unlocked.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        if let Some(expected) = &self.password {
            let accepted = match credential {
                Credential::Password(given) => {
                    bool::from(given.as_bytes().ct_eq(expected.as_bytes()))
                }
                _ => false,
            };
            if !accepted {
                debug!("Memory backend rejected credential");
                return Err(Error::Authentication("Invalid credential".to_string()));
            }
        }
        self.unlocked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn put(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
        labels: Labels,
    ) -> Result<u64> {
        self.ensure_unlocked()?;
        Ok(self.table.write().await.put(workspace, name, value, labels))
    }

    async fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<Secret> {
        self.ensure_unlocked()?;
        self.table.read().await.get(workspace, name).cloned()
    }

    async fn delete(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<bool> {
        self.ensure_unlocked()?;
        Ok(self.table.write().await.delete(workspace, name))
    }

    async fn list(&self, workspace: &WorkspaceName) -> Result<Vec<SecretName>> {
        self.ensure_unlocked()?;
        Ok(self.table.read().await.list(workspace))
    }

    async fn rotate(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64> {
        self.ensure_unlocked()?;
        self.table.write().await.rotate(workspace, name, value)
    }
}

//! OS keychain secret backend.
//!
//! Each secret is one keychain entry under the configured service, with the
//! account `secret:{workspace}:{name}`. Workspace names cannot contain `:`,
//! so the mapping is unambiguous. A per-workspace index entry
//! (`index:{workspace}`) records names in insertion order because keychains
//! cannot enumerate a service portably.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::backend::{
    locked_error, wrong_credential, BackendInfo, Credential, CredentialKind, SecretBackend,
};
use crate::model::{Labels, Secret};
use agentvault_common::{
    BackendKind, Error, Result, SecretName, SensitiveBytes, WorkspaceName,
};

/// Default keychain service name.
pub const DEFAULT_SERVICE: &str = "agentvault";

/// Account used to check that the keychain answers at all.
const PROBE_ACCOUNT: &str = "__agentvault_probe__";

/// Blocking access to a keychain service.
///
/// Implementations are called from `spawn_blocking`, never on the async
/// executor.
pub trait KeyringStore: Send + Sync + 'static {
    /// Read an entry. `None` if it does not exist.
    fn get(&self, account: &str) -> Result<Option<String>>;

    /// Create or replace an entry.
    fn set(&self, account: &str, value: &str) -> Result<()>;

    /// Remove an entry. Returns whether it existed.
    fn delete(&self, account: &str) -> Result<bool>;

    /// Check the keychain is reachable.
    fn probe(&self) -> Result<()>;
}

/// The platform keychain via the `keyring` crate.
#[derive(Debug, Clone)]
pub struct OsKeyring {
    service: String,
}

impl OsKeyring {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, account).map_err(keyring_error)
    }
}

fn keyring_error(e: keyring::Error) -> Error {
    match e {
        keyring::Error::NoStorageAccess(_) => {
            Error::Authentication(format!("Keychain access denied: {}", e))
        }
        keyring::Error::PlatformFailure(_) => {
            Error::Connection(format!("Keychain unavailable: {}", e))
        }
        other => Error::Storage(format!("Keychain error: {}", other)),
    }
}

impl KeyringStore for OsKeyring {
    fn get(&self, account: &str) -> Result<Option<String>> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }

    fn set(&self, account: &str, value: &str) -> Result<()> {
        self.entry(account)?
            .set_password(value)
            .map_err(keyring_error)
    }

    fn delete(&self, account: &str) -> Result<bool> {
        match self.entry(account)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(keyring_error(e)),
        }
    }

    fn probe(&self) -> Result<()> {
        self.get(PROBE_ACCOUNT).map(|_| ())
    }
}

/// Process-local keychain, for tests and hosts without a keychain daemon.
#[derive(Debug, Default)]
pub struct InMemoryKeyring {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl InMemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyringStore for InMemoryKeyring {
    fn get(&self, account: &str) -> Result<Option<String>> {
        Ok(self.entries().get(account).cloned())
    }

    fn set(&self, account: &str, value: &str) -> Result<()> {
        self.entries().insert(account.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, account: &str) -> Result<bool> {
        Ok(self.entries().remove(account).is_some())
    }

    fn probe(&self) -> Result<()> {
        Ok(())
    }
}

fn secret_account(workspace: &WorkspaceName, name: &SecretName) -> String {
    format!("secret:{}:{}", workspace, name)
}

fn index_account(workspace: &WorkspaceName) -> String {
    format!("index:{}", workspace)
}

/// Secret backend over the OS keychain.
///
/// Access control is the operating system's: authentication only accepts
/// [`Credential::OsLogin`].
pub struct KeychainBackend {
    store: Arc<dyn KeyringStore>,
    service: String,
    write_lock: Mutex<()>,
    connected: AtomicBool,
    unlocked: AtomicBool,
}

impl KeychainBackend {
    /// Backend over the platform keychain under `service`.
    pub fn new(service: impl Into<String>) -> Self {
        let service = service.into();
        Self::with_store(service.clone(), Arc::new(OsKeyring::new(service)))
    }

    /// Backend over an explicit keyring store.
    pub fn with_store(service: impl Into<String>, store: Arc<dyn KeyringStore>) -> Self {
        Self {
            store,
            service: service.into(),
            write_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            unlocked: AtomicBool::new(false),
        }
    }

    /// Keychain service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.unlocked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(locked_error(BackendKind::Keychain))
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyringStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::Storage(format!("Keychain task failed: {}", e)))?
    }

    async fn read_index(&self, workspace: &WorkspaceName) -> Result<Vec<String>> {
        let account = index_account(workspace);
        let raw = self.blocking(move |store| store.get(&account)).await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|_| Error::Integrity("Keychain index entry is corrupt".to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, workspace: &WorkspaceName, names: Vec<String>) -> Result<()> {
        let account = index_account(workspace);
        if names.is_empty() {
            self.blocking(move |store| store.delete(&account)).await?;
            return Ok(());
        }
        let raw =
            serde_json::to_string(&names).map_err(|e| Error::Serialization(e.to_string()))?;
        self.blocking(move |store| store.set(&account, &raw)).await
    }

    async fn read_secret(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
    ) -> Result<Option<Secret>> {
        let account = secret_account(workspace, name);
        let raw = self.blocking(move |store| store.get(&account)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let raw = Zeroizing::new(raw);
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| Error::Integrity(format!("Keychain entry for '{}' is corrupt", name)))
    }

    async fn write_secret(&self, workspace: &WorkspaceName, secret: &Secret) -> Result<()> {
        let account = secret_account(workspace, &secret.name);
        let raw = Zeroizing::new(
            serde_json::to_string(secret).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        self.blocking(move |store| store.set(&account, &raw)).await
    }
}

#[async_trait]
impl SecretBackend for KeychainBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Keychain
    }

    async fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Keychain,
            security_level: BackendKind::Keychain.security_level(),
            credential: CredentialKind::OsLogin,
            persistent: true,
            requires_touch: false,
            connected: self.connected.load(Ordering::SeqCst),
            hardware: None,
        }
    }

    async fn connect(&self) -> Result<()> {
        if let Err(e) = self.blocking(|store| store.probe()).await {
            warn!(service = %self.service, "Keychain probe failed");
            return Err(match e {
                Error::Connection(_) => e,
                other => Error::Connection(other.to_string()),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!(service = %self.service, "Keychain connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.unlocked.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        if !matches!(credential, Credential::OsLogin) {
            return Err(wrong_credential(BackendKind::Keychain, CredentialKind::OsLogin));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Connection("Keychain is not connected".to_string()));
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
        let _guard = self.write_lock.lock().await;

        let secret = Secret::new(name.clone(), value, labels);
        self.write_secret(workspace, &secret).await?;

        let mut index = self.read_index(workspace).await?;
        if !index.iter().any(|n| n == name.as_str()) {
            index.push(name.as_str().to_string());
            self.write_index(workspace, index).await?;
        }
        Ok(secret.version)
    }

    async fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<Secret> {
        self.ensure_unlocked()?;
        self.read_secret(workspace, name).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Secret '{}' not found in workspace '{}'",
                name, workspace
            ))
        })
    }

    async fn delete(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<bool> {
        self.ensure_unlocked()?;
        let _guard = self.write_lock.lock().await;

        let account = secret_account(workspace, name);
        let removed = self.blocking(move |store| store.delete(&account)).await?;

        let mut index = self.read_index(workspace).await?;
        let before = index.len();
        index.retain(|n| n != name.as_str());
        if index.len() != before {
            self.write_index(workspace, index).await?;
        }
        Ok(removed)
    }

    async fn list(&self, workspace: &WorkspaceName) -> Result<Vec<SecretName>> {
        self.ensure_unlocked()?;
        self.read_index(workspace)
            .await?
            .into_iter()
            .map(SecretName::new)
            .collect()
    }

    async fn rotate(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64> {
        self.ensure_unlocked()?;
        let _guard = self.write_lock.lock().await;

        let mut secret = self.read_secret(workspace, name).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Secret '{}' not found in workspace '{}'",
                name, workspace
            ))
        })?;
        let version = secret.rotate(value);
        self.write_secret(workspace, &secret).await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(name: &str) -> WorkspaceName {
        WorkspaceName::new(name).unwrap()
    }

    fn name(name: &str) -> SecretName {
        SecretName::new(name).unwrap()
    }

    async fn unlocked() -> (KeychainBackend, Arc<InMemoryKeyring>) {
        let store = Arc::new(InMemoryKeyring::new());
        let backend = KeychainBackend::with_store("agentvault-test", store.clone());
        backend.connect().await.unwrap();
        backend.authenticate(&Credential::OsLogin).await.unwrap();
        (backend, store)
    }

    #[tokio::test]
    async fn test_entries_are_namespaced_by_workspace() {
        let (backend, store) = unlocked().await;
        backend
            .put(&ws("researcher"), &name("api_key"), "sk".into(), Labels::new())
            .await
            .unwrap();

        assert!(store.get("secret:researcher:api_key").unwrap().is_some());
        assert!(matches!(
            backend.get(&ws("coder"), &name("api_key")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_follows_insertion_order() {
        let (backend, _) = unlocked().await;
        for n in ["b", "a", "c"] {
            backend
                .put(&ws("w"), &name(n), "v".into(), Labels::new())
                .await
                .unwrap();
        }
        backend
            .put(&ws("w"), &name("b"), "v2".into(), Labels::new())
            .await
            .unwrap();
        assert_eq!(
            backend.list(&ws("w")).await.unwrap(),
            vec![name("b"), name("a"), name("c")]
        );
    }

    #[tokio::test]
    async fn test_rotate_and_delete() {
        let (backend, store) = unlocked().await;
        backend
            .put(&ws("w"), &name("k"), "v1".into(), Labels::new())
            .await
            .unwrap();
        assert_eq!(backend.rotate(&ws("w"), &name("k"), "v2".into()).await.unwrap(), 2);
        assert_eq!(
            backend.get(&ws("w"), &name("k")).await.unwrap().value.as_bytes(),
            b"v2"
        );

        assert!(backend.delete(&ws("w"), &name("k")).await.unwrap());
        assert!(!backend.delete(&ws("w"), &name("k")).await.unwrap());
        assert!(backend.list(&ws("w")).await.unwrap().is_empty());
        assert!(store.get("index:w").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_os_login_accepted() {
        let backend = KeychainBackend::with_store("svc", Arc::new(InMemoryKeyring::new()));
        backend.connect().await.unwrap();
        assert!(matches!(
            backend.authenticate(&Credential::password("pw")).await,
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            backend.list(&ws("w")).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_integrity_failure() {
        let (backend, store) = unlocked().await;
        store.set("secret:w:k", "not json").unwrap();
        assert!(matches!(
            backend.get(&ws("w"), &name("k")).await,
            Err(Error::Integrity(_))
        ));
    }
}

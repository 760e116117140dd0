//! Encrypted single-file secret backend.
//!
//! The whole workspace→secret table is serialized, encrypted under a key
//! derived from the master password, and written as one file. Every mutation
//! re-reads, decrypts, mutates, re-encrypts with a fresh nonce, and atomically
//! replaces the file (write to temp + rename).

pub mod format;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::backend::{
    locked_error, wrong_credential, BackendInfo, Credential, CredentialKind, SecretBackend,
};
use crate::model::{Labels, Secret, SecretTable};
use agentvault_common::{
    BackendKind, Error, Result, SecretName, SensitiveBytes, WorkspaceName,
};
use agentvault_crypto::{decrypt_with_aad, derive_key, encrypt_with_aad, DataKey, KdfParams};
use format::VaultHeader;

/// Purpose tag for the envelope subkey.
const ENVELOPE_PURPOSE: &[u8] = b"vault-envelope";

/// One lock per vault path, shared by every backend instance in the process.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

    let key = lock_key(path);
    let locks = LOCKS.get_or_init(Default::default);
    let mut locks = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(key).or_default().clone()
}

/// Canonical form of a vault path, usable before the file exists.
fn lock_key(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    match (std::fs::canonicalize(&parent), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

#[derive(Default)]
struct FileState {
    connected: bool,
    key: Option<DataKey>,
}

/// Secret backend persisting an encrypted vault file.
pub struct EncryptedFileBackend {
    path: PathBuf,
    kdf_params: KdfParams,
    create_if_missing: bool,
    lock: Arc<Mutex<()>>,
    state: Mutex<FileState>,
}

impl EncryptedFileBackend {
    /// Create a backend for the vault at `path`.
    ///
    /// Nothing is read until `connect`/`authenticate`. A missing vault is
    /// created on first authentication unless disabled with
    /// [`EncryptedFileBackend::create_if_missing`].
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            lock: path_lock(&path),
            path,
            kdf_params: KdfParams::default(),
            create_if_missing: true,
            state: Mutex::new(FileState::default()),
        }
    }

    /// Set KDF parameters used when a new vault file is created.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf_params = params;
        self
    }

    /// Whether `authenticate` may create a missing vault.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Path of the vault file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vault".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }

    /// Replace the vault file without ever exposing a partial write.
    async fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.temp_path();

        let written: std::io::Result<()> = async {
            let mut options = fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut file = options.open(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().await.connected {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "Vault file {} is not connected",
                self.path.display()
            )))
        }
    }

    async fn unlocked_key(&self) -> Result<DataKey> {
        self.state
            .lock()
            .await
            .key
            .clone()
            .ok_or_else(|| locked_error(BackendKind::File))
    }

    /// Create a new, empty vault. Caller holds the path lock.
    async fn create_vault(&self, password: &SensitiveBytes) -> Result<DataKey> {
        let header = VaultHeader::new(self.kdf_params);
        let key = derive_envelope_key(password.clone(), header).await?;
        let sealed = seal_envelope(&key, &header, &SecretTable::new())?;
        self.write_atomic(&sealed).await?;
        info!(path = %self.path.display(), "Vault file created");
        Ok(key)
    }

    async fn read_table<T>(&self, f: impl FnOnce(&SecretTable) -> Result<T>) -> Result<T> {
        let key = self.unlocked_key().await?;
        let _guard = self.lock.lock().await;
        let bytes = self.read_file().await?.ok_or_else(|| self.missing())?;
        let (_, table) = open_envelope(&key, &bytes)?;
        f(&table)
    }

    /// Read-decrypt-mutate-encrypt-write under the vault-wide lock.
    ///
    /// Nothing is written when `f` fails.
    async fn mutate<T>(&self, f: impl FnOnce(&mut SecretTable) -> Result<T>) -> Result<T> {
        let key = self.unlocked_key().await?;
        let _guard = self.lock.lock().await;
        let bytes = self.read_file().await?.ok_or_else(|| self.missing())?;
        let (header, mut table) = open_envelope(&key, &bytes)?;
        let result = f(&mut table)?;
        let sealed = seal_envelope(&key, &header, &table)?;
        self.write_atomic(&sealed).await?;
        Ok(result)
    }

    fn missing(&self) -> Error {
        Error::NotFound(format!("Vault file not found: {}", self.path.display()))
    }
}

/// Run the slow KDF off the async executor.
async fn derive_envelope_key(password: SensitiveBytes, header: VaultHeader) -> Result<DataKey> {
    tokio::task::spawn_blocking(move || {
        let master = derive_key(password.as_bytes(), &header.salt, &header.kdf_params)?;
        Ok(master.derive_subkey(ENVELOPE_PURPOSE))
    })
    .await
    .map_err(|e| Error::InvalidState(format!("Key derivation task failed: {}", e)))?
}

fn open_envelope(key: &DataKey, bytes: &[u8]) -> Result<(VaultHeader, SecretTable)> {
    let (header, envelope) = VaultHeader::decode(bytes)?;
    let plaintext = Zeroizing::new(decrypt_with_aad(
        key.as_bytes(),
        envelope,
        &header.encode(),
    )?);
    let table = serde_json::from_slice(&plaintext)
        .map_err(|_| Error::Integrity("Vault payload is corrupt".to_string()))?;
    Ok((header, table))
}

fn seal_envelope(key: &DataKey, header: &VaultHeader, table: &SecretTable) -> Result<Vec<u8>> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(table).map_err(|e| Error::Serialization(e.to_string()))?,
    );
    let header_bytes = header.encode();
    let ciphertext = encrypt_with_aad(key.as_bytes(), &plaintext, &header_bytes)?;

    let mut out = Vec::with_capacity(header_bytes.len() + ciphertext.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn password_of(credential: &Credential) -> Result<&SensitiveBytes> {
    match credential {
        Credential::Password(password) => Ok(password),
        _ => Err(wrong_credential(BackendKind::File, CredentialKind::Password)),
    }
}

#[async_trait]
impl SecretBackend for EncryptedFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::File,
            security_level: BackendKind::File.security_level(),
            credential: CredentialKind::Password,
            persistent: true,
            requires_touch: false,
            connected: self.state.lock().await.connected,
            hardware: None,
        }
    }

    async fn connect(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let parent_ok = fs::metadata(&parent)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !parent_ok {
            return Err(Error::Connection(format!(
                "Vault directory {} is not available",
                parent.display()
            )));
        }
        if let Ok(meta) = fs::metadata(&self.path).await {
            if meta.is_dir() {
                return Err(Error::Connection(format!(
                    "Vault path {} is a directory",
                    self.path.display()
                )));
            }
        }

        self.state.lock().await.connected = true;
        debug!(path = %self.path.display(), "Vault file connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.key = None;
        state.connected = false;
        Ok(())
    }

    async fn provision(&self, credential: &Credential) -> Result<()> {
        let password = password_of(credential)?;
        self.ensure_connected().await?;

        let _guard = self.lock.lock().await;
        if self.read_file().await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "Vault file already exists: {}",
                self.path.display()
            )));
        }
        let key = self.create_vault(password).await?;
        self.state.lock().await.key = Some(key);
        Ok(())
    }

    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        let password = password_of(credential)?;
        self.ensure_connected().await?;

        let _guard = self.lock.lock().await;
        let key = match self.read_file().await? {
            Some(bytes) => {
                let (header, _) = VaultHeader::decode(&bytes)?;
                let key = derive_envelope_key(password.clone(), header).await?;
                if let Err(e) = open_envelope(&key, &bytes) {
                    warn!(path = %self.path.display(), "Vault file failed to decrypt");
                    return Err(e);
                }
                key
            }
            None if self.create_if_missing => self.create_vault(password).await?,
            None => return Err(self.missing()),
        };

        self.state.lock().await.key = Some(key);
        debug!(path = %self.path.display(), "Vault file unlocked");
        Ok(())
    }

    async fn put(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
        labels: Labels,
    ) -> Result<u64> {
        self.mutate(|table| Ok(table.put(workspace, name, value, labels)))
            .await
    }

    async fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<Secret> {
        self.read_table(|table| table.get(workspace, name).cloned())
            .await
    }

    async fn delete(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<bool> {
        self.mutate(|table| Ok(table.delete(workspace, name))).await
    }

    async fn list(&self, workspace: &WorkspaceName) -> Result<Vec<SecretName>> {
        self.read_table(|table| Ok(table.list(workspace))).await
    }

    async fn rotate(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64> {
        self.mutate(|table| table.rotate(workspace, name, value))
            .await
    }
}

//! Backend selection from configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::backend::SecretBackend;
use crate::file::EncryptedFileBackend;
use crate::hardware::{DevicePolicy, HardwareBackend, SecureElement, SimulatedTouch};
use crate::keychain::{KeychainBackend, DEFAULT_SERVICE};
use crate::memory::MemoryBackend;
use agentvault_common::{Error, Result};
use agentvault_crypto::KdfProfile;

/// Default vault file name inside the data directory.
pub const DEFAULT_VAULT_FILE: &str = "vault.avp";

/// Backend section of the engine configuration.
///
/// ```toml
/// [backend]
/// type = "file"
/// path = "~/.local/share/agentvault/vault.avp"
/// kdf = "moderate"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Unencrypted, process-local.
    Memory,
    /// Encrypted vault file.
    File {
        /// Vault path. Defaults to `<data dir>/agentvault/vault.avp`.
        #[serde(default)]
        path: Option<PathBuf>,
        /// KDF cost profile for newly created vaults.
        #[serde(default)]
        kdf: KdfProfile,
        /// Create the vault on first authentication if missing.
        #[serde(default = "default_true")]
        create_if_missing: bool,
    },
    /// OS keychain.
    Keychain {
        #[serde(default = "default_service")]
        service: String,
    },
    /// Simulated secure element.
    Hardware {
        #[serde(default = "default_device_id")]
        device_id: String,
        #[serde(default = "default_max_slots")]
        max_slots: usize,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_touch_timeout_secs")]
        touch_timeout_secs: u64,
        /// Delay before the simulated touch confirms.
        #[serde(default)]
        simulated_touch_ms: u64,
        /// Argon2id cost for the stored PIN digest.
        #[serde(default = "default_pin_kdf")]
        pin_kdf: KdfProfile,
    },
}

fn default_true() -> bool {
    true
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

fn default_device_id() -> String {
    crate::hardware::SIMULATED_DEVICE_ID.to_string()
}

fn default_max_slots() -> usize {
    DevicePolicy::default().max_slots
}

fn default_max_attempts() -> u32 {
    DevicePolicy::default().max_attempts
}

fn default_pin_kdf() -> KdfProfile {
    KdfProfile::Interactive
}

fn default_touch_timeout_secs() -> u64 {
    DevicePolicy::default().touch_timeout.as_secs()
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::File {
            path: None,
            kdf: KdfProfile::default(),
            create_if_missing: true,
        }
    }
}

impl BackendConfig {
    /// Check values a backend cannot start with.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::Memory => Ok(()),
            BackendConfig::File { path, .. } => match path {
                Some(path) if path.as_os_str().is_empty() => Err(Error::InvalidInput(
                    "backend.path must not be empty".to_string(),
                )),
                _ => Ok(()),
            },
            BackendConfig::Keychain { service } => {
                if service.trim().is_empty() {
                    return Err(Error::InvalidInput(
                        "backend.service must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            BackendConfig::Hardware {
                max_slots,
                max_attempts,
                touch_timeout_secs,
                ..
            } => {
                if *max_slots == 0 {
                    return Err(Error::InvalidInput("backend.max_slots must be at least 1".to_string()));
                }
                if *max_attempts == 0 {
                    return Err(Error::InvalidInput(
                        "backend.max_attempts must be at least 1".to_string(),
                    ));
                }
                if *touch_timeout_secs == 0 {
                    return Err(Error::InvalidInput(
                        "backend.touch_timeout_secs must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Default vault file location: `<data dir>/agentvault/vault.avp`.
///
/// # Errors
/// - `InvalidState` if the platform has no data directory
pub fn default_vault_path() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("agentvault").join(DEFAULT_VAULT_FILE))
        .ok_or_else(|| {
            Error::InvalidState("No data directory on this platform; set backend.path".to_string())
        })
}

/// Build the backend described by `config`.
///
/// Creates the default vault directory when the file backend uses the
/// default path. Nothing is connected or unlocked.
///
/// # Errors
/// - `InvalidInput` for invalid configuration values
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn SecretBackend>> {
    config.validate()?;

    let backend: Arc<dyn SecretBackend> = match config {
        BackendConfig::Memory => Arc::new(MemoryBackend::new()),
        BackendConfig::File {
            path,
            kdf,
            create_if_missing,
        } => {
            let path = match path {
                Some(path) => path.clone(),
                None => {
                    let path = default_vault_path()?;
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    path
                }
            };
            Arc::new(
                EncryptedFileBackend::new(path)
                    .with_kdf_params(kdf.params())
                    .create_if_missing(*create_if_missing),
            )
        }
        BackendConfig::Keychain { service } => Arc::new(KeychainBackend::new(service.clone())),
        BackendConfig::Hardware {
            device_id,
            max_slots,
            max_attempts,
            touch_timeout_secs,
            simulated_touch_ms,
            pin_kdf,
        } => {
            let policy = DevicePolicy {
                max_attempts: *max_attempts,
                max_slots: *max_slots,
                touch_timeout: Duration::from_secs(*touch_timeout_secs),
                pin_kdf: pin_kdf.params(),
            };
            let touch = Arc::new(SimulatedTouch::new(Duration::from_millis(*simulated_touch_ms)));
            Arc::new(HardwareBackend::new(Arc::new(SecureElement::new(
                device_id.clone(),
                policy,
                touch,
            ))))
        }
    };

    info!(backend = %backend.kind(), "Backend created");
    Ok(backend)
}

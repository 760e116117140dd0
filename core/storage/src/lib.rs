//! Secret backends for AgentVault.
//!
//! Every backend implements [`SecretBackend`], keyed by (workspace, name):
//! - [`MemoryBackend`]: unencrypted, for tests and development
//! - [`EncryptedFileBackend`]: one password-encrypted vault file
//! - [`KeychainBackend`]: the OS keychain
//! - [`HardwareBackend`]: a PIN-gated secure element with touch confirmation
//!
//! Backends never see sessions. The engine resolves the workspace from the
//! session before calling in.

pub mod backend;
pub mod factory;
pub mod file;
pub mod hardware;
pub mod keychain;
pub mod memory;
pub mod model;

pub use backend::{BackendInfo, Credential, CredentialKind, SecretBackend};
pub use factory::{create_backend, default_vault_path, BackendConfig};
pub use file::EncryptedFileBackend;
pub use hardware::{
    touch_channel, DevicePolicy, DeviceStatus, HardwareBackend, HardwareInfo, SecureElement,
    SimulatedTouch, TouchButton, TouchChannel, TouchSensor,
};
pub use keychain::{InMemoryKeyring, KeychainBackend, KeyringStore, OsKeyring};
pub use memory::MemoryBackend;
pub use model::{Labels, Secret, SecretTable};

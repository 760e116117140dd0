//! Password stretching for encrypted vault files.
//!
//! Argon2id turns the vault password into the master key; the parameters
//! are stored in the file header so a vault opens with the cost it was
//! created with.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use agentvault_common::{Error, Result};

/// Largest memory cost accepted from a vault header (4 GiB).
pub const MAX_MEMORY_COST: u32 = 4 * 1024 * 1024;

/// Largest iteration count accepted from a vault header.
pub const MAX_TIME_COST: u32 = 64;

/// Largest parallelism accepted from a vault header.
pub const MAX_PARALLELISM: u32 = 64;

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for constrained machines.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Smallest parameters Argon2id accepts. Tests only.
    pub fn minimal() -> Self {
        Self {
            memory_cost: 8,
            time_cost: 1,
            parallelism: 1,
        }
    }

    /// Check the parameters are within the bounds this crate accepts.
    ///
    /// Used when parameters come from an untrusted file header.
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(Error::InvalidInput(format!(
                "KDF parallelism out of range: {}",
                self.parallelism
            )));
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(Error::InvalidInput(format!(
                "KDF time cost out of range: {}",
                self.time_cost
            )));
        }
        if self.memory_cost < 8 * self.parallelism || self.memory_cost > MAX_MEMORY_COST {
            return Err(Error::InvalidInput(format!(
                "KDF memory cost out of range: {}",
                self.memory_cost
            )));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Named KDF strength, as written in configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfProfile {
    Interactive,
    #[default]
    Moderate,
    Sensitive,
}

impl KdfProfile {
    /// Resolve the profile to concrete parameters.
    pub fn params(self) -> KdfParams {
        match self {
            KdfProfile::Interactive => KdfParams::interactive(),
            KdfProfile::Moderate => KdfParams::moderate(),
            KdfProfile::Sensitive => KdfParams::sensitive(),
        }
    }
}

/// Stretch `password` into a master key.
///
/// Same password, salt and parameters always give the same key.
///
/// # Errors
/// - `InvalidInput` for an empty password or parameters Argon2 rejects
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::InvalidInput(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(password, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::InvalidInput(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
}

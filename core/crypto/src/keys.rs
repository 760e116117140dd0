//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kdf::{derive_key, KdfParams};
use agentvault_common::Result;

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of KDF and PIN salts in bytes.
pub const SALT_LENGTH: usize = 32;

fn blake2b_256(parts: &[&[u8]]) -> [u8; KEY_LENGTH] {
    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; KEY_LENGTH];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Master key derived from the user password.
///
/// Never used directly for encryption; purpose-bound subkeys are derived
/// from it with [`MasterKey::derive_subkey`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive a key bound to `purpose` (e.g. `b"vault-envelope"`).
    ///
    /// Uses blake2b over master key, purpose and a fixed domain tag.
    pub fn derive_subkey(&self, purpose: &[u8]) -> DataKey {
        let mut derived = blake2b_256(&[&self.key[..], purpose, b"agentvault-subkey"]);
        let key = DataKey::from_bytes(derived);
        derived.zeroize();
        key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Symmetric key for encrypting a payload (vault envelope, device slot).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
}

impl DataKey {
    /// Create a data key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Generate a random data key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

/// Argon2id digest of a device PIN. The PIN itself is never kept.
///
/// PINs are short, so the digest is stretched like a vault password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PinDigest {
    #[zeroize(skip)]
    salt: Salt,
    #[zeroize(skip)]
    params: KdfParams,
    digest: [u8; KEY_LENGTH],
}

impl PinDigest {
    /// Stretch `pin` under a freshly generated salt.
    ///
    /// Blocks for the duration of the KDF.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty PIN or parameters Argon2 rejects
    pub fn new(pin: &[u8], params: &KdfParams) -> Result<Self> {
        Self::with_salt(pin, &Salt::generate(), params)
    }

    /// Stretch `pin` under the given salt.
    pub fn with_salt(pin: &[u8], salt: &Salt, params: &KdfParams) -> Result<Self> {
        let key = derive_key(pin, salt, params)?;
        Ok(Self {
            salt: *salt,
            params: *params,
            digest: *key.as_bytes(),
        })
    }

    /// Check `pin` against this digest in constant time.
    ///
    /// A PIN the KDF refuses (empty) never matches.
    pub fn verify(&self, pin: &[u8]) -> bool {
        match derive_key(pin, &self.salt, &self.params) {
            Ok(candidate) => candidate.as_bytes()[..].ct_eq(&self.digest[..]).into(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PinDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinDigest([REDACTED])")
    }
}

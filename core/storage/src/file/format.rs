//! On-disk layout of the encrypted vault file.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "AVPV"
//! 4       2     format version (big endian)
//! 6       1     KDF algorithm id (1 = Argon2id)
//! 7       32    salt
//! 39      4     memory cost KiB (big endian)
//! 43      4     time cost
//! 47      4     parallelism
//! 51      ..    nonce || ciphertext || tag
//! ```
//!
//! The 51 header bytes are authenticated as associated data, so a modified
//! salt or cost field fails decryption instead of silently deriving a
//! different key.

use agentvault_common::{Error, Result};
use agentvault_crypto::{KdfParams, Salt, SALT_LENGTH};

/// File magic.
pub const MAGIC: [u8; 4] = *b"AVPV";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Argon2id identifier in the KDF field.
pub const KDF_ARGON2ID: u8 = 1;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 4 + 2 + 1 + SALT_LENGTH + 4 + 4 + 4;

/// Parsed vault file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultHeader {
    /// Format version.
    pub version: u16,
    /// Salt for master key derivation.
    pub salt: Salt,
    /// KDF cost parameters.
    pub kdf_params: KdfParams,
}

impl VaultHeader {
    /// Create a header for a new vault with a fresh salt.
    pub fn new(kdf_params: KdfParams) -> Self {
        Self {
            version: FORMAT_VERSION,
            salt: Salt::generate(),
            kdf_params,
        }
    }

    /// Encode the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6] = KDF_ARGON2ID;
        out[7..39].copy_from_slice(self.salt.as_bytes());
        out[39..43].copy_from_slice(&self.kdf_params.memory_cost.to_be_bytes());
        out[43..47].copy_from_slice(&self.kdf_params.time_cost.to_be_bytes());
        out[47..51].copy_from_slice(&self.kdf_params.parallelism.to_be_bytes());
        out
    }

    /// Split a vault file into its header and the encrypted envelope.
    ///
    /// # Errors
    /// - `UnsupportedFormat` for a short file, wrong magic, unknown version,
    ///   unknown KDF, or out-of-range cost parameters
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::UnsupportedFormat(
                "Vault file is shorter than its header".to_string(),
            ));
        }
        let (header, envelope) = bytes.split_at(HEADER_LEN);

        if header[0..4] != MAGIC {
            return Err(Error::UnsupportedFormat("Not a vault file".to_string()));
        }

        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "Unsupported vault format version {}",
                version
            )));
        }

        if header[6] != KDF_ARGON2ID {
            return Err(Error::UnsupportedFormat(format!(
                "Unsupported KDF algorithm id {}",
                header[6]
            )));
        }

        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&header[7..39]);

        let kdf_params = KdfParams {
            memory_cost: read_u32(&header[39..43]),
            time_cost: read_u32(&header[43..47]),
            parallelism: read_u32(&header[47..51]),
        };
        kdf_params
            .validate()
            .map_err(|e| Error::UnsupportedFormat(e.to_string()))?;

        Ok((
            Self {
                version,
                salt: Salt::from_bytes(salt),
                kdf_params,
            },
            envelope,
        ))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

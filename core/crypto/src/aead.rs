//! XChaCha20-Poly1305 sealing with associated data.
//!
//! Sealed output is `nonce || ciphertext || tag`. The associated data
//! (a file header, a slot name) is authenticated but not stored, so the
//! caller passes the same bytes back when opening.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use agentvault_common::{Error, Result};

/// Random nonce length.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Key must be {} bytes, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Seal `plaintext` under `key`, binding `aad` to it.
///
/// # Errors
/// - `InvalidInput` if the key is not 32 bytes
pub fn encrypt_with_aad(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::InvalidState("Encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open output of [`encrypt_with_aad`].
///
/// A wrong key, a modified byte and mismatched `aad` all report the same
/// `Integrity` error.
///
/// # Errors
/// - `InvalidInput` if the key is not 32 bytes
/// - `Integrity` if the input is truncated or fails authentication
pub fn decrypt_with_aad(key: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;

    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Integrity("Ciphertext too short".to_string()));
    }

    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: body, aad })
        .map_err(|_| Error::Integrity("Decryption failed".to_string()))
}

//! Cryptographic primitives for AgentVault.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305, with optional
//!   associated data for binding file headers to their ciphertext
//! - Key types with automatic zeroization
//! - Salted PIN digests for the hardware secure-element model
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt_with_aad, encrypt_with_aad};
pub use kdf::{derive_key, KdfParams, KdfProfile};
pub use keys::{DataKey, MasterKey, PinDigest, Salt, KEY_LENGTH, SALT_LENGTH};

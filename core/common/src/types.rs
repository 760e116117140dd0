//! Common types used throughout AgentVault.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroize;

/// Maximum length of a workspace or secret name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

fn validate_name(kind: &str, name: &str, forbidden: &[char]) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(crate::Error::InvalidInput(format!(
            "{} exceeds {} bytes",
            kind, MAX_NAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_control() || forbidden.contains(&c)) {
        return Err(crate::Error::InvalidInput(format!(
            "{} contains a forbidden character",
            kind
        )));
    }
    Ok(())
}

/// Name of an isolated partition of secrets (e.g. `"researcher"`).
///
/// Workspace names never contain `/` or `:`, so backends can use them as
/// unambiguous key prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceName(String);

impl WorkspaceName {
    /// Create a new WorkspaceName.
    ///
    /// # Errors
    /// - Returns error if the name is empty, too long, or contains `/`, `:`
    ///   or control characters
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_name("Workspace name", &name, &['/', ':', '\\'])?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkspaceName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<WorkspaceName> for String {
    fn from(value: WorkspaceName) -> Self {
        value.0
    }
}

impl fmt::Display for WorkspaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a secret, unique within its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretName(String);

impl SecretName {
    /// Create a new SecretName.
    ///
    /// # Errors
    /// - Returns error if the name is empty, too long, or contains control
    ///   characters
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_name("Secret name", &name, &[])?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SecretName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<SecretName> for String {
    fn from(value: SecretName) -> Self {
        value.0
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensitive data wrapper that zeroizes on drop.
///
/// Serializes as base64 so it can live inside the encrypted vault payload.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SensitiveBytes {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl From<&[u8]> for SensitiveBytes {
    fn from(data: &[u8]) -> Self {
        Self(data.to_vec())
    }
}

impl From<String> for SensitiveBytes {
    fn from(data: String) -> Self {
        Self(data.into_bytes())
    }
}

impl From<&str> for SensitiveBytes {
    fn from(data: &str) -> Self {
        Self(data.as_bytes().to_vec())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

impl Serialize for SensitiveBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut encoded = STANDARD.encode(&self.0);
        let result = serializer.serialize_str(&encoded);
        encoded.zeroize();
        result
    }
}

impl<'de> Deserialize<'de> for SensitiveBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom);
        encoded.zeroize();
        decoded.map(Self)
    }
}

/// Descriptive trust level of a storage approach.
///
/// Purely metadata for callers choosing a backend; it never changes engine
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Plaintext = 1,
    EncryptedFile = 2,
    OsKeychain = 3,
    Hardware = 4,
}

impl SecurityLevel {
    /// Numeric ordinal (1 = plaintext ... 4 = hardware).
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Tag selecting a storage backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    Keychain,
    Hardware,
}

impl BackendKind {
    /// Security level this backend kind provides.
    pub fn security_level(self) -> SecurityLevel {
        match self {
            BackendKind::Memory => SecurityLevel::Plaintext,
            BackendKind::File => SecurityLevel::EncryptedFile,
            BackendKind::Keychain => SecurityLevel::OsKeychain,
            BackendKind::Hardware => SecurityLevel::Hardware,
        }
    }

    /// Get the backend name as used in configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
            BackendKind::Keychain => "keychain",
            BackendKind::Hardware => "hardware",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Common utilities and types shared across AgentVault modules.
//!
//! This module provides the error taxonomy and the validated name and
//! sensitive-value types used by every backend and by the engine.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{BackendKind, SecretName, SecurityLevel, SensitiveBytes, WorkspaceName};

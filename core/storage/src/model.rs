//! Secret records and the ordered workspace table shared by the software
//! backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use agentvault_common::{Error, Result, SecretName, SensitiveBytes, WorkspaceName};

/// Free-form metadata attached to a secret.
pub type Labels = BTreeMap<String, String>;

/// A stored secret and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Name, unique within the workspace.
    pub name: SecretName,
    /// Opaque value.
    pub value: SensitiveBytes,
    /// Starts at 1, incremented by every rotation.
    pub version: u64,
    /// Caller-supplied labels.
    #[serde(default)]
    pub labels: Labels,
    /// When this version line was first stored.
    pub created_at: DateTime<Utc>,
    /// Last store or rotation.
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    /// Create version 1 of a secret.
    pub fn new(name: SecretName, value: SensitiveBytes, labels: Labels) -> Self {
        let now = Utc::now();
        Self {
            name,
            value,
            version: 1,
            labels,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the value and bump the version, keeping labels and creation
    /// time.
    pub fn rotate(&mut self, value: SensitiveBytes) -> u64 {
        self.value = value;
        self.version += 1;
        self.updated_at = Utc::now();
        self.version
    }
}

/// Workspace-partitioned secret table.
///
/// Secrets within a workspace keep insertion order; that order is what
/// `list` reports. Used as the whole in-memory state of the memory backend
/// and as the encrypted payload of the vault file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretTable {
    workspaces: BTreeMap<WorkspaceName, Vec<Secret>>,
}

impl SecretTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or destructively overwrite a secret. Returns the new version,
    /// which is always 1.
    pub fn put(
        &mut self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
        labels: Labels,
    ) -> u64 {
        let secret = Secret::new(name.clone(), value, labels);
        let version = secret.version;
        let secrets = self.workspaces.entry(workspace.clone()).or_default();
        match secrets.iter().position(|s| &s.name == name) {
            Some(index) => secrets[index] = secret,
            None => secrets.push(secret),
        }
        version
    }

    /// Get a secret.
    ///
    /// # Errors
    /// - `NotFound` if the name is absent from this workspace
    pub fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<&Secret> {
        self.workspaces
            .get(workspace)
            .and_then(|secrets| secrets.iter().find(|s| &s.name == name))
            .ok_or_else(|| not_found(workspace, name))
    }

    /// Remove a secret. Returns whether it existed.
    pub fn delete(&mut self, workspace: &WorkspaceName, name: &SecretName) -> bool {
        let Some(secrets) = self.workspaces.get_mut(workspace) else {
            return false;
        };
        let before = secrets.len();
        secrets.retain(|s| &s.name != name);
        let removed = secrets.len() != before;
        if secrets.is_empty() {
            self.workspaces.remove(workspace);
        }
        removed
    }

    /// Names in a workspace, in insertion order.
    pub fn list(&self, workspace: &WorkspaceName) -> Vec<SecretName> {
        self.workspaces
            .get(workspace)
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Replace a value and bump its version.
    ///
    /// # Errors
    /// - `NotFound` if the name is absent from this workspace
    pub fn rotate(
        &mut self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64> {
        let secret = self
            .workspaces
            .get_mut(workspace)
            .and_then(|secrets| secrets.iter_mut().find(|s| &s.name == name))
            .ok_or_else(|| not_found(workspace, name))?;
        Ok(secret.rotate(value))
    }

    /// Workspaces that currently hold at least one secret.
    pub fn workspaces(&self) -> impl Iterator<Item = &WorkspaceName> {
        self.workspaces.keys()
    }

    /// Total number of secrets across all workspaces.
    pub fn len(&self) -> usize {
        self.workspaces.values().map(Vec::len).sum()
    }

    /// Check if the table holds no secrets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(workspace: &WorkspaceName, name: &SecretName) -> Error {
    Error::NotFound(format!("Secret '{}' not found in workspace '{}'", name, workspace))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(name: &str) -> WorkspaceName {
        WorkspaceName::new(name).unwrap()
    }

    fn name(name: &str) -> SecretName {
        SecretName::new(name).unwrap()
    }

    #[test]
    fn test_put_get() {
        let mut table = SecretTable::new();
        let version = table.put(&ws("a"), &name("k"), "v".into(), Labels::new());
        assert_eq!(version, 1);
        assert_eq!(table.get(&ws("a"), &name("k")).unwrap().value.as_bytes(), b"v");
    }

    #[test]
    fn test_workspaces_are_isolated() {
        let mut table = SecretTable::new();
        table.put(&ws("a"), &name("k"), "v".into(), Labels::new());
        assert!(matches!(
            table.get(&ws("b"), &name("k")),
            Err(Error::NotFound(_))
        ));
        assert!(table.list(&ws("b")).is_empty());
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let mut table = SecretTable::new();
        for n in ["zeta", "alpha", "mid"] {
            table.put(&ws("a"), &name(n), "v".into(), Labels::new());
        }
        // Overwrite keeps the original slot.
        table.put(&ws("a"), &name("zeta"), "v2".into(), Labels::new());
        assert_eq!(table.list(&ws("a")), vec![name("zeta"), name("alpha"), name("mid")]);
    }

    #[test]
    fn test_rotate_then_store_resets_version() {
        let mut table = SecretTable::new();
        let mut labels = Labels::new();
        labels.insert("provider".into(), "anthropic".into());
        table.put(&ws("a"), &name("k"), "v1".into(), labels);

        assert_eq!(table.rotate(&ws("a"), &name("k"), "v2".into()).unwrap(), 2);
        assert_eq!(table.rotate(&ws("a"), &name("k"), "v3".into()).unwrap(), 3);
        let secret = table.get(&ws("a"), &name("k")).unwrap();
        assert_eq!(secret.value.as_bytes(), b"v3");
        assert_eq!(secret.labels.get("provider").map(String::as_str), Some("anthropic"));

        assert_eq!(table.put(&ws("a"), &name("k"), "v4".into(), Labels::new()), 1);
        assert_eq!(table.get(&ws("a"), &name("k")).unwrap().version, 1);
    }

    #[test]
    fn test_rotate_missing_fails() {
        let mut table = SecretTable::new();
        assert!(matches!(
            table.rotate(&ws("a"), &name("k"), "v".into()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut table = SecretTable::new();
        table.put(&ws("a"), &name("k"), "v".into(), Labels::new());
        assert!(table.delete(&ws("a"), &name("k")));
        assert!(!table.delete(&ws("a"), &name("k")));
        assert!(table.is_empty());
        assert_eq!(table.workspaces().count(), 0);
    }

    #[test]
    fn test_serialization_roundtrip_preserves_order() {
        let mut table = SecretTable::new();
        table.put(&ws("a"), &name("second"), "2".into(), Labels::new());
        table.put(&ws("a"), &name("first"), "1".into(), Labels::new());

        let json = serde_json::to_vec(&table).unwrap();
        let restored: SecretTable = serde_json::from_slice(&json).unwrap();
        assert_eq!(restored.list(&ws("a")), vec![name("second"), name("first")]);
        assert_eq!(restored.len(), 2);
    }
}

//! Migration of plaintext credentials into a vault workspace.
//!
//! Parses the usual insecure sources (`.env` files, `keys.json`-style JSON
//! objects, process environment) into candidates and stores them through a
//! session, so every import is audited like any other STORE.

use serde::Serialize;
use tracing::info;

use crate::engine::VaultEngine;
use crate::session::Session;
use agentvault_common::{Error, Result, SecretName, SensitiveBytes};
use agentvault_storage::Labels;

/// Label key recording where an imported secret came from.
pub const SOURCE_LABEL: &str = "source";

/// Environment variables checked by [`from_environment`] by default.
pub const DEFAULT_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GITHUB_TOKEN",
    "AWS_SECRET_ACCESS_KEY",
];

/// JSON string values at or below this length are not treated as
/// credentials.
const MIN_JSON_VALUE_LEN: usize = 10;

/// A credential found in a plaintext source.
#[derive(Debug, Clone)]
pub struct ImportCandidate {
    pub name: String,
    pub value: SensitiveBytes,
    /// Where it was found (`.env`, a file name, `environment`).
    pub source: String,
}

/// Outcome of [`VaultEngine::import`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<SecretName>,
    /// Names already present and left untouched.
    pub skipped: Vec<SecretName>,
}

fn looks_like_credential(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["KEY", "TOKEN", "SECRET"].iter().any(|m| upper.contains(m))
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

/// Credential-looking assignments in `.env` content.
///
/// Keys containing `KEY`, `TOKEN` or `SECRET` are kept and lowercased.
/// Comments, blank lines and an `export ` prefix are handled.
pub fn parse_env(content: &str, source: &str) -> Vec<ImportCandidate> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let key = key.trim();
            (key.strip_prefix("export ").unwrap_or(key).trim(), unquote(value))
        })
        .filter(|(key, value)| !key.is_empty() && !value.is_empty() && looks_like_credential(key))
        .map(|(key, value)| ImportCandidate {
            name: key.to_lowercase(),
            value: value.into(),
            source: source.to_string(),
        })
        .collect()
}

/// String values longer than 10 bytes from a flat JSON object.
///
/// # Errors
/// - `InvalidInput` if the content is not a JSON object
pub fn parse_json(content: &str, source: &str) -> Result<Vec<ImportCandidate>> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| Error::InvalidInput(format!("{} is not valid JSON: {}", source, e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidInput(format!("{} is not a JSON object", source)))?;

    Ok(object
        .iter()
        .filter_map(|(key, value)| {
            let value = value.as_str()?;
            (value.len() > MIN_JSON_VALUE_LEN).then(|| ImportCandidate {
                name: key.clone(),
                value: value.into(),
                source: source.to_string(),
            })
        })
        .collect())
}

/// Set variables among `vars`, named in lowercase.
pub fn from_environment(vars: &[&str]) -> Vec<ImportCandidate> {
    vars.iter()
        .filter_map(|var| {
            let value = std::env::var(var).ok().filter(|v| !v.is_empty())?;
            Some(ImportCandidate {
                name: var.to_lowercase(),
                value: value.into(),
                source: "environment".to_string(),
            })
        })
        .collect()
}

impl VaultEngine {
    /// Store `candidates` in the session's workspace.
    ///
    /// Existing secrets are skipped unless `overwrite` is set. Each store
    /// is an ordinary audited STORE labelled with its source. Stops at the
    /// first failure other than an existing name.
    pub async fn import(
        &self,
        session: &Session,
        candidates: Vec<ImportCandidate>,
        overwrite: bool,
    ) -> Result<ImportReport> {
        let existing = if overwrite {
            Vec::new()
        } else {
            self.list(session).await?
        };

        let mut report = ImportReport::default();
        for candidate in candidates {
            let name = SecretName::new(candidate.name.as_str())?;
            if !overwrite && (existing.contains(&name) || report.imported.contains(&name)) {
                report.skipped.push(name);
                continue;
            }

            let mut labels = Labels::new();
            labels.insert(SOURCE_LABEL.to_string(), candidate.source);
            self.store(session, name.as_str(), candidate.value, labels)
                .await?;
            report.imported.push(name);
        }

        info!(
            workspace = %session.workspace(),
            imported = report.imported.len(),
            skipped = report.skipped.len(),
            "Credentials imported"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use agentvault_storage::Credential;

    #[test]
    fn test_parse_env() {
        let content = r#"
# comment
ANTHROPIC_API_KEY="sk-ant-123"
export GITHUB_TOKEN='ghp_abc'
DEBUG=true
AWS_SECRET_ACCESS_KEY = wJalr
EMPTY_KEY=
"#;
        let found = parse_env(content, ".env");
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["anthropic_api_key", "github_token", "aws_secret_access_key"]
        );
        assert_eq!(found[0].value.as_bytes(), b"sk-ant-123");
        assert_eq!(found[1].value.as_bytes(), b"ghp_abc");
        assert_eq!(found[2].source, ".env");
    }

    #[test]
    fn test_parse_json() {
        let content = r#"{"openai": "sk-proj-0123456789", "short": "abc", "nested": {"a": 1}}"#;
        let found = parse_json(content, "keys.json").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "openai");
        assert_eq!(found[0].source, "keys.json");

        assert!(matches!(
            parse_json("[1, 2]", "keys.json"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_environment_skips_unset() {
        assert!(from_environment(&["AGENTVAULT_TEST_SURELY_UNSET_VAR"]).is_empty());
    }

    #[tokio::test]
    async fn test_import_skips_existing_unless_overwrite() {
        let engine = VaultEngine::new(EngineConfig::memory()).await.unwrap();
        let session = engine.authenticate(&Credential::OsLogin, "agent").await.unwrap();
        engine
            .store(&session, "github_token", "old", Labels::new())
            .await
            .unwrap();

        let candidates = parse_env("GITHUB_TOKEN=new\nOPENAI_API_KEY=sk-1\n", ".env");
        let report = engine.import(&session, candidates.clone(), false).await.unwrap();
        assert_eq!(report.imported, vec![SecretName::new("openai_api_key").unwrap()]);
        assert_eq!(report.skipped, vec![SecretName::new("github_token").unwrap()]);
        assert_eq!(
            engine.retrieve(&session, "github_token").await.unwrap().value.as_bytes(),
            b"old"
        );

        let imported = engine.retrieve(&session, "openai_api_key").await.unwrap();
        assert_eq!(imported.labels.get(SOURCE_LABEL).map(String::as_str), Some(".env"));

        let report = engine.import(&session, candidates, true).await.unwrap();
        assert_eq!(report.imported.len(), 2);
        assert_eq!(
            engine.retrieve(&session, "github_token").await.unwrap().value.as_bytes(),
            b"new"
        );
    }
}

//! Append-only, hash-chained audit trail.
//!
//! Every entry carries the BLAKE2b-256 hash of its own fields and of the
//! previous entry's hash, so removing, reordering or editing an entry breaks
//! the chain. Entries never contain secret values or credentials.
//!
//! With a configured path the trail is also written as JSON lines. An
//! existing file is reloaded and verified when the log is opened, and an
//! entry the file cannot take fails the operation that produced it.

use async_trait::async_trait;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::session::SessionId;
use agentvault_common::{Error, ErrorKind, Result, SecretName, WorkspaceName};

type Blake2b256 = Blake2b<U32>;

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionCreated,
    AuthenticationFailed,
    SessionClosed,
    Store,
    Retrieve,
    Delete,
    Rotate,
    List,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::SessionCreated => "session_created",
            AuditAction::AuthenticationFailed => "authentication_failed",
            AuditAction::SessionClosed => "session_closed",
            AuditAction::Store => "store",
            AuditAction::Retrieve => "retrieve",
            AuditAction::Delete => "delete",
            AuditAction::Rotate => "rotate",
            AuditAction::List => "list",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the attempt ended. Failures keep only the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure(ErrorKind),
}

impl AuditOutcome {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => AuditOutcome::Success,
            Err(e) => AuditOutcome::Failure(e.kind()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AuditOutcome::Success)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, from 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub workspace: WorkspaceName,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<SecretName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub outcome: AuditOutcome,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    /// Hash over every field except `hash` itself.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Blake2b256::new();
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.timestamp.timestamp().to_be_bytes());
        hasher.update(self.timestamp.timestamp_subsec_nanos().to_be_bytes());
        update_field(&mut hasher, self.workspace.as_str().as_bytes());
        update_field(&mut hasher, self.action.as_str().as_bytes());
        match &self.secret_name {
            Some(name) => update_field(&mut hasher, name.as_str().as_bytes()),
            None => hasher.update([0u8]),
        }
        match &self.session_id {
            Some(id) => update_field(&mut hasher, id.to_string().as_bytes()),
            None => hasher.update([0u8]),
        }
        match self.outcome {
            AuditOutcome::Success => update_field(&mut hasher, b"success"),
            AuditOutcome::Failure(kind) => {
                update_field(&mut hasher, b"failure");
                update_field(&mut hasher, format!("{:?}", kind).as_bytes());
            }
        }
        update_field(&mut hasher, self.prev_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Length-prefixed field, so adjacent fields cannot run together.
fn update_field(hasher: &mut Blake2b256, bytes: &[u8]) {
    hasher.update([1u8]);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Fields supplied by the caller of [`AuditLog::record`].
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub workspace: WorkspaceName,
    pub action: AuditAction,
    pub secret_name: Option<SecretName>,
    pub session_id: Option<SessionId>,
    pub outcome: AuditOutcome,
}

/// Aggregate view of the trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub failures: usize,
    pub by_workspace: BTreeMap<WorkspaceName, usize>,
    pub by_action: BTreeMap<AuditAction, usize>,
    /// Secret names that appeared in any entry.
    pub secrets_touched: BTreeSet<SecretName>,
}

/// Check a sequence of entries forms an unbroken chain from genesis.
///
/// # Errors
/// - `Integrity` naming the first entry whose sequence, link or hash is wrong
pub fn verify_chain(entries: &[AuditEntry]) -> Result<()> {
    let mut prev = GENESIS_HASH;
    for (index, entry) in entries.iter().enumerate() {
        if entry.sequence != index as u64 {
            return Err(Error::Integrity(format!(
                "Audit entry {} has sequence {}",
                index, entry.sequence
            )));
        }
        if entry.prev_hash != prev {
            return Err(Error::Integrity(format!(
                "Audit entry {} does not link to its predecessor",
                index
            )));
        }
        if entry.hash != entry.compute_hash() {
            return Err(Error::Integrity(format!("Audit entry {} was modified", index)));
        }
        prev = entry.hash.as_str();
    }
    Ok(())
}

/// Durable destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Persist one entry. On error no part of the entry may remain.
    async fn append(&mut self, entry: &AuditEntry) -> Result<()>;
}

/// JSON-lines file sink.
///
/// Tracks the length of the last complete line; a failed append truncates
/// back to it so the file never holds a partial entry. If that truncation
/// also fails the sink refuses further appends.
struct JsonLinesSink {
    path: PathBuf,
    file: File,
    committed: u64,
    broken: bool,
}

impl JsonLinesSink {
    /// Open `path` for appending. The file must end at a line boundary
    /// `committed` bytes in.
    async fn open(path: PathBuf, committed: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.set_len(committed).await?;
        Ok(Self {
            path,
            file,
            committed,
            broken: false,
        })
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn append(&mut self, entry: &AuditEntry) -> Result<()> {
        if self.broken {
            return Err(Error::Storage(format!(
                "Audit file {} holds a partial entry",
                self.path.display()
            )));
        }

        let mut line =
            serde_json::to_string(entry).map_err(|e| Error::Serialization(e.to_string()))?;
        line.push('\n');

        let written: std::io::Result<()> = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.committed += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.file.set_len(self.committed).await {
                    error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "Audit file rollback failed"
                    );
                    self.broken = true;
                }
                Err(e.into())
            }
        }
    }
}

struct AuditInner {
    entries: Vec<AuditEntry>,
    sink: Option<Box<dyn AuditSink>>,
}

/// Append-only audit log.
///
/// Appends are serialized behind one lock; the in-memory order is the
/// order of `record` calls. With a sink, an entry only joins the trail once
/// the sink has accepted it.
pub struct AuditLog {
    path: Option<PathBuf>,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Log kept in process memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(AuditInner {
                entries: Vec::new(),
                sink: None,
            }),
        }
    }

    /// Fresh log mirrored to `sink`.
    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        Self {
            path: None,
            inner: Mutex::new(AuditInner {
                entries: Vec::new(),
                sink: Some(sink),
            }),
        }
    }

    /// Log mirrored to a JSON-lines file, continuing an existing trail.
    ///
    /// An unterminated last line is an append that never completed; it is
    /// dropped with a warning.
    ///
    /// # Errors
    /// - `Integrity` if a complete line is unparseable or the chain is broken
    /// - `Io` if the file cannot be opened
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let complete = content.rfind('\n').map_or(0, |i| i + 1);
        if complete < content.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = content.len() - complete,
                "Dropping incomplete audit line"
            );
        }

        let entries = parse_lines(&content[..complete])?;
        verify_chain(&entries)?;

        let sink = JsonLinesSink::open(path.clone(), complete as u64).await?;
        debug!(path = %path.display(), entries = entries.len(), "Audit log opened");

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(AuditInner {
                entries,
                sink: Some(Box::new(sink)),
            }),
        })
    }

    /// File the trail is mirrored to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether entries are persisted beyond this process.
    pub async fn is_durable(&self) -> bool {
        self.inner.lock().await.sink.is_some()
    }

    /// Append an entry and return it.
    ///
    /// # Errors
    /// - `Io`, `Storage` or `Serialization` if the sink rejects the entry.
    ///   The entry is then not part of the trail and its sequence number is
    ///   reused by the next append.
    pub async fn record(&self, event: AuditEvent) -> Result<AuditEntry> {
        let mut inner = self.inner.lock().await;

        let prev_hash = inner
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut entry = AuditEntry {
            sequence: inner.entries.len() as u64,
            timestamp: Utc::now(),
            workspace: event.workspace,
            action: event.action,
            secret_name: event.secret_name,
            session_id: event.session_id,
            outcome: event.outcome,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();

        if let Some(sink) = inner.sink.as_mut() {
            if let Err(e) = sink.append(&entry).await {
                error!(sink = sink.name(), error = %e, "Audit entry not persisted");
                return Err(e);
            }
        }

        inner.entries.push(entry.clone());
        Ok(entry)
    }

    /// All entries in insertion order. Non-destructive.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.entries.clone()
    }

    /// Entries for one workspace, in insertion order.
    pub async fn entries_for(&self, workspace: &WorkspaceName) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| &e.workspace == workspace)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Verify the in-memory chain.
    pub async fn verify(&self) -> Result<()> {
        verify_chain(&self.inner.lock().await.entries)
    }

    pub async fn summary(&self) -> AuditSummary {
        let inner = self.inner.lock().await;
        let mut summary = AuditSummary {
            total: inner.entries.len(),
            ..AuditSummary::default()
        };
        for entry in &inner.entries {
            if !entry.outcome.is_success() {
                summary.failures += 1;
            }
            *summary
                .by_workspace
                .entry(entry.workspace.clone())
                .or_default() += 1;
            *summary.by_action.entry(entry.action).or_default() += 1;
            if let Some(name) = &entry.secret_name {
                summary.secrets_touched.insert(name.clone());
            }
        }
        summary
    }
}

fn parse_lines(content: &str) -> Result<Vec<AuditEntry>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::Integrity(format!("Audit file line {} is corrupt: {}", number + 1, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws(name: &str) -> WorkspaceName {
        WorkspaceName::new(name).unwrap()
    }

    fn event(workspace: &str, action: AuditAction, name: Option<&str>) -> AuditEvent {
        AuditEvent {
            workspace: ws(workspace),
            action,
            secret_name: name.map(|n| SecretName::new(n).unwrap()),
            session_id: None,
            outcome: AuditOutcome::Success,
        }
    }

    #[tokio::test]
    async fn test_entries_are_chained_in_order() {
        let log = AuditLog::in_memory();
        log.record(event("a", AuditAction::Store, Some("k"))).await.unwrap();
        log.record(event("a", AuditAction::Retrieve, Some("k"))).await.unwrap();
        log.record(event("b", AuditAction::List, None)).await.unwrap();

        let entries = log.entries().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(
            entries.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        log.verify().await.unwrap();

        // Reading is non-destructive.
        assert_eq!(log.entries().await, entries);
    }

    #[tokio::test]
    async fn test_verify_detects_edits_and_removal() {
        let log = AuditLog::in_memory();
        for _ in 0..3 {
            log.record(event("a", AuditAction::Retrieve, Some("k"))).await.unwrap();
        }
        let entries = log.entries().await;

        let mut edited = entries.clone();
        edited[1].action = AuditAction::List;
        assert!(matches!(verify_chain(&edited), Err(Error::Integrity(_))));

        let mut removed = entries.clone();
        removed.remove(1);
        assert!(matches!(verify_chain(&removed), Err(Error::Integrity(_))));

        let mut swapped = entries;
        swapped.swap(0, 2);
        assert!(verify_chain(&swapped).is_err());
    }

    #[tokio::test]
    async fn test_failure_outcome_keeps_only_kind() {
        let log = AuditLog::in_memory();
        let result: Result<()> = Err(Error::NotFound("Secret 'x' not found".into()));
        let entry = log
            .record(AuditEvent {
                outcome: AuditOutcome::of(&result),
                ..event("a", AuditAction::Retrieve, Some("x"))
            })
            .await
            .unwrap();
        assert_eq!(entry.outcome, AuditOutcome::Failure(ErrorKind::NotFound));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"status\":\"failure\""));
        assert!(!json.contains("not found"));
    }

    #[tokio::test]
    async fn test_summary() {
        let log = AuditLog::in_memory();
        log.record(event("researcher", AuditAction::Store, Some("anthropic_api_key"))).await.unwrap();
        log.record(event("researcher", AuditAction::Retrieve, Some("anthropic_api_key"))).await.unwrap();
        log.record(event("writer", AuditAction::Retrieve, Some("openai_api_key"))).await.unwrap();
        log.record(AuditEvent {
            outcome: AuditOutcome::Failure(ErrorKind::NotFound),
            ..event("writer", AuditAction::Retrieve, Some("missing"))
        })
        .await
        .unwrap();

        let summary = log.summary().await;
        assert_eq!(summary.total, 4);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.by_workspace[&ws("researcher")], 2);
        assert_eq!(summary.by_action[&AuditAction::Retrieve], 3);
        assert_eq!(summary.secrets_touched.len(), 3);
        assert_eq!(log.entries_for(&ws("writer")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_file_trail_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path).await.unwrap();
            log.record(event("a", AuditAction::Store, Some("k"))).await.unwrap();
            log.record(event("a", AuditAction::Delete, Some("k"))).await.unwrap();
        }

        let log = AuditLog::open(&path).await.unwrap();
        assert_eq!(log.len().await, 2);
        let entry = log.record(event("a", AuditAction::List, None)).await.unwrap();
        assert_eq!(entry.sequence, 2);
        log.verify().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_tampered_file_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path).await.unwrap();
            log.record(event("a", AuditAction::Store, Some("k"))).await.unwrap();
            log.record(event("a", AuditAction::Retrieve, Some("k"))).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let first_line_end = content.find('\n').unwrap() + 1;
        std::fs::write(&path, &content[first_line_end..]).unwrap();

        assert!(matches!(AuditLog::open(&path).await, Err(Error::Integrity(_))));
    }

    struct RejectingSink {
        remaining_failures: usize,
    }

    #[async_trait]
    impl AuditSink for RejectingSink {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn append(&mut self, _entry: &AuditEntry) -> Result<()> {
            if self.remaining_failures > 0 {
                self.remaining_failures -= 1;
                return Err(Error::Storage("sink unavailable".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rejected_entry_is_not_kept() {
        let log = AuditLog::with_sink(Box::new(RejectingSink {
            remaining_failures: 1,
        }));
        assert!(log.is_durable().await);

        log.record(event("a", AuditAction::Store, Some("k"))).await.unwrap();
        assert!(matches!(
            log.record(event("a", AuditAction::Retrieve, Some("k"))).await,
            Err(Error::Storage(_))
        ));
        let entry = log.record(event("a", AuditAction::List, None)).await.unwrap();

        assert_eq!(entry.sequence, 1);
        assert_eq!(log.len().await, 2);
        log.verify().await.unwrap();
    }

    #[tokio::test]
    async fn test_incomplete_last_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path).await.unwrap();
            log.record(event("a", AuditAction::Store, Some("k"))).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"sequence\":1,\"times");
        std::fs::write(&path, &content).unwrap();

        let log = AuditLog::open(&path).await.unwrap();
        assert_eq!(log.len().await, 1);
        log.record(event("a", AuditAction::List, None)).await.unwrap();

        let reopened = AuditLog::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        reopened.verify().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }
}

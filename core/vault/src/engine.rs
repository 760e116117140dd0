//! The vault engine: session-scoped secret operations over one backend.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEntry, AuditEvent, AuditLog, AuditOutcome};
use crate::auth::Authenticator;
use crate::config::EngineConfig;
use crate::session::{Session, SessionId, SessionState};
use agentvault_common::{Error, Result, SecretName, SensitiveBytes, WorkspaceName};
use agentvault_storage::{
    create_backend, BackendInfo, Credential, Labels, Secret, SecretBackend,
};

struct SessionRecord {
    session: Session,
    closed: bool,
}

impl SessionRecord {
    fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.session.is_expired() {
            SessionState::Expired
        } else {
            SessionState::Authenticated
        }
    }
}

/// Secret vault engine.
///
/// Every operation takes a [`Session`] and is confined to that session's
/// workspace. Every attempt, including failed ones, is appended to the audit
/// log before the result is returned. When a durable audit sink rejects the
/// entry, the operation reports the sink's error instead of its result.
pub struct VaultEngine {
    config: EngineConfig,
    backend: Arc<dyn SecretBackend>,
    authenticator: Authenticator,
    sessions: RwLock<HashMap<SessionId, SessionRecord>>,
    audit: AuditLog,
}

impl VaultEngine {
    /// Build an engine and its backend from configuration.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration does not validate
    /// - `Integrity` if a configured audit file fails verification
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend = create_backend(&config.backend)?;
        Self::with_backend(config, backend).await
    }

    /// Build an engine over an existing backend. `config.backend` is
    /// ignored.
    pub async fn with_backend(config: EngineConfig, backend: Arc<dyn SecretBackend>) -> Result<Self> {
        config.validate()?;
        let audit = match &config.audit.path {
            Some(path) => AuditLog::open(path).await?,
            None => AuditLog::in_memory(),
        };
        Self::with_audit(config, backend, audit).await
    }

    /// Build an engine over an existing backend and audit log.
    /// `config.backend` and `config.audit` are ignored.
    pub async fn with_audit(
        config: EngineConfig,
        backend: Arc<dyn SecretBackend>,
        audit: AuditLog,
    ) -> Result<Self> {
        config.validate()?;
        let authenticator = Authenticator::new(backend.clone(), config.session_ttl());
        let durable_audit = audit.is_durable().await;

        info!(
            backend = %backend.kind(),
            ttl_secs = config.session.ttl,
            durable_audit,
            "Vault engine ready"
        );

        Ok(Self {
            config,
            backend,
            authenticator,
            sessions: RwLock::new(HashMap::new()),
            audit,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn SecretBackend> {
        &self.backend
    }

    /// The audit log itself, for verification and summaries.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Backend capabilities and security level. Needs no authentication.
    pub async fn discover(&self) -> BackendInfo {
        self.backend.info().await
    }

    /// Establish the backend link ahead of authentication.
    pub async fn connect(&self) -> Result<()> {
        self.authenticator.connect().await
    }

    /// One-time backend initialization (new vault file, device PIN).
    pub async fn provision(&self, credential: &Credential) -> Result<()> {
        self.authenticator.provision(credential).await
    }

    /// Verify `credential` and open a session bound to `workspace`.
    ///
    /// Sessions for different workspaces are independent; each call checks
    /// the credential again.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid workspace name (not audited: there is
    ///   no workspace to attribute it to)
    /// - `Connection`, `Authentication`, `Integrity`, `DeviceWiped` from the
    ///   backend, audited as `authentication_failed`
    pub async fn authenticate(&self, credential: &Credential, workspace: &str) -> Result<Session> {
        let workspace = WorkspaceName::new(workspace)?;
        self.open_session(credential, workspace).await
    }

    /// Authenticate to the configured workspace.
    pub async fn authenticate_default(&self, credential: &Credential) -> Result<Session> {
        let workspace = self.config.default_workspace()?;
        self.open_session(credential, workspace).await
    }

    /// A session is only handed out once its creation is on the audit trail.
    /// Closed and expired sessions are forgotten here, so the session map
    /// only holds live sessions plus those that ended since the last call.
    async fn open_session(&self, credential: &Credential, workspace: WorkspaceName) -> Result<Session> {
        match self.authenticator.authenticate(credential, &workspace).await {
            Ok(session) => {
                self.audit
                    .record(AuditEvent {
                        workspace: workspace.clone(),
                        action: AuditAction::SessionCreated,
                        secret_name: None,
                        session_id: Some(session.id()),
                        outcome: AuditOutcome::Success,
                    })
                    .await?;
                {
                    let mut sessions = self.sessions.write().await;
                    sessions.retain(|_, record| record.state() == SessionState::Authenticated);
                    sessions.insert(
                        session.id(),
                        SessionRecord {
                            session: session.clone(),
                            closed: false,
                        },
                    );
                }
                info!(
                    session = %session.id().short(),
                    workspace = %workspace,
                    "Session created"
                );
                Ok(session)
            }
            Err(e) => {
                // The attempt already failed; its own error is the one to report.
                let _ = self
                    .audit
                    .record(AuditEvent {
                        workspace: workspace.clone(),
                        action: AuditAction::AuthenticationFailed,
                        secret_name: None,
                        session_id: None,
                        outcome: AuditOutcome::Failure(e.kind()),
                    })
                    .await;
                warn!(workspace = %workspace, kind = ?e.kind(), "Authentication failed");
                Err(e)
            }
        }
    }

    /// Resolve a live session to its workspace.
    async fn check_session(&self, session: &Session) -> Result<WorkspaceName> {
        let sessions = self.sessions.read().await;
        let record = sessions
            .get(&session.id())
            .ok_or_else(|| Error::SessionExpired("Unknown session".to_string()))?;
        match record.state() {
            SessionState::Authenticated => Ok(record.session.workspace().clone()),
            SessionState::Expired => Err(Error::SessionExpired(format!(
                "Session expired at {}",
                record.session.expires_at()
            ))),
            SessionState::Closed => Err(Error::SessionExpired("Session is closed".to_string())),
        }
    }

    /// Audit the attempt, then hand back its result. If the audit log
    /// cannot take the entry the call fails with that error instead, so no
    /// result leaves the engine unaudited.
    async fn finish<T>(
        &self,
        session: &Session,
        action: AuditAction,
        secret_name: Option<SecretName>,
        result: Result<T>,
    ) -> Result<T> {
        let outcome = AuditOutcome::of(&result);
        let entry = self
            .audit
            .record(AuditEvent {
                workspace: session.workspace().clone(),
                action,
                secret_name,
                session_id: Some(session.id()),
                outcome,
            })
            .await?;

        match &result {
            Ok(_) => debug!(
                session = %session.id().short(),
                workspace = %entry.workspace,
                action = %action,
                sequence = entry.sequence,
                "Operation succeeded"
            ),
            Err(e) => warn!(
                session = %session.id().short(),
                workspace = %entry.workspace,
                action = %action,
                kind = ?e.kind(),
                "Operation failed"
            ),
        }
        result
    }

    /// Validate session and name, run `op`, audit the attempt.
    async fn with_secret<T, F, Fut>(
        &self,
        session: &Session,
        action: AuditAction,
        name: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(WorkspaceName, SecretName) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = SecretName::new(name);
        let audited = name.as_ref().ok().cloned();
        let result = async {
            let workspace = self.check_session(session).await?;
            op(workspace, name?).await
        }
        .await;
        self.finish(session, action, audited, result).await
    }

    /// Store a secret in the session's workspace.
    ///
    /// Storing over an existing name is a destructive overwrite: version
    /// resets to 1 and labels are replaced. Use [`VaultEngine::rotate`] for
    /// a versioned update.
    pub async fn store(
        &self,
        session: &Session,
        name: &str,
        value: impl Into<SensitiveBytes>,
        labels: Labels,
    ) -> Result<u64> {
        let value = value.into();
        self.with_secret(session, AuditAction::Store, name, |workspace, name| async move {
            self.backend.put(&workspace, &name, value, labels).await
        })
        .await
    }

    /// Fetch a secret from the session's workspace.
    ///
    /// # Errors
    /// - `NotFound` if absent from this workspace, even if another
    ///   workspace has the name
    /// - `SessionExpired` for an expired, closed or unknown session
    pub async fn retrieve(&self, session: &Session, name: &str) -> Result<Secret> {
        self.with_secret(session, AuditAction::Retrieve, name, |workspace, name| async move {
            self.backend.get(&workspace, &name).await
        })
        .await
    }

    /// Remove a secret. Returns whether one was removed.
    pub async fn delete(&self, session: &Session, name: &str) -> Result<bool> {
        self.with_secret(session, AuditAction::Delete, name, |workspace, name| async move {
            self.backend.delete(&workspace, &name).await
        })
        .await
    }

    /// Replace a secret's value and increment its version. The previous
    /// value is not retained.
    ///
    /// # Errors
    /// - `NotFound` if absent from this workspace
    pub async fn rotate(
        &self,
        session: &Session,
        name: &str,
        value: impl Into<SensitiveBytes>,
    ) -> Result<u64> {
        let value = value.into();
        self.with_secret(session, AuditAction::Rotate, name, |workspace, name| async move {
            self.backend.rotate(&workspace, &name, value).await
        })
        .await
    }

    /// Secret names in the session's workspace, in backend order.
    pub async fn list(&self, session: &Session) -> Result<Vec<SecretName>> {
        let result = async {
            let workspace = self.check_session(session).await?;
            self.backend.list(&workspace).await
        }
        .await;
        self.finish(session, AuditAction::List, None, result).await
    }

    /// Close a session. Idempotent; returns whether this call closed it.
    pub async fn close(&self, session: &Session) -> bool {
        let closed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&session.id()) {
                Some(record) if !record.closed => {
                    record.closed = true;
                    true
                }
                _ => false,
            }
        };
        if closed {
            self.record_closed(session).await;
        }
        closed
    }

    /// The session is closed either way; a lost entry is only logged.
    async fn record_closed(&self, session: &Session) {
        let recorded = self
            .audit
            .record(AuditEvent {
                workspace: session.workspace().clone(),
                action: AuditAction::SessionClosed,
                secret_name: None,
                session_id: Some(session.id()),
                outcome: AuditOutcome::Success,
            })
            .await;
        match recorded {
            Ok(_) => debug!(session = %session.id().short(), "Session closed"),
            Err(e) => warn!(
                session = %session.id().short(),
                error = %e,
                "Session closed without an audit entry"
            ),
        }
    }

    /// Close every open session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let closed: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .values_mut()
                .filter(|record| !record.closed)
                .map(|record| {
                    record.closed = true;
                    record.session.clone()
                })
                .collect()
        };
        for session in &closed {
            self.record_closed(session).await;
        }
        closed.len()
    }

    /// Current state of a session. Sessions unknown to this engine (or
    /// already purged) report `Closed`.
    pub async fn session_state(&self, session: &Session) -> SessionState {
        self.sessions
            .read()
            .await
            .get(&session.id())
            .map(SessionRecord::state)
            .unwrap_or(SessionState::Closed)
    }

    /// Forget expired and closed sessions. Returns how many were removed.
    pub async fn purge_expired_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| record.state() == SessionState::Authenticated);
        before - sessions.len()
    }

    /// Snapshot of the audit trail in insertion order. Non-destructive.
    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.entries().await
    }

    /// Close all sessions and release the backend.
    pub async fn disconnect(&self) -> Result<()> {
        let closed = self.close_all().await;
        self.authenticator.disconnect().await?;
        info!(closed_sessions = closed, "Vault engine disconnected");
        Ok(())
    }
}

//! Workspace-scoped sessions.
//!
//! A session is issued by the engine after a successful authentication and
//! is bound to exactly one workspace. Callers hold a copy as an opaque
//! handle; the engine's own table is authoritative for state and workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use agentvault_common::WorkspaceName;

/// Deadline used when `issued + ttl` does not fit the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Opaque session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex digits, for logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an issued session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Valid for operations until its deadline.
    Authenticated,
    /// Past `expires_at`. Re-authenticate.
    Expired,
    /// Closed explicitly, or unknown to the engine.
    Closed,
}

/// Time-bounded handle scoped to one workspace.
///
/// Cannot be constructed outside this crate, so a caller cannot forge one
/// for a workspace it never authenticated to.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    workspace: WorkspaceName,
    issued_at: DateTime<Utc>,
    ttl: Duration,
    expires_at: DateTime<Utc>,
    deadline: Instant,
}

impl Session {
    pub(crate) fn issue(workspace: WorkspaceName, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id: SessionId::generate(),
            workspace,
            issued_at,
            ttl,
            expires_at,
            deadline: Instant::now()
                .checked_add(ttl)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The workspace this session is bound to.
    pub fn workspace(&self) -> &WorkspaceName {
        &self.workspace
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the deadline has passed. Measured on the monotonic clock.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> WorkspaceName {
        WorkspaceName::new("researcher").unwrap()
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Session::issue(ws(), Duration::from_secs(60));
        let b = Session::issue(ws(), Duration::from_secs(60));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().short().len(), 8);
    }

    #[test]
    fn test_expires_at_matches_ttl() {
        let session = Session::issue(ws(), Duration::from_secs(3600));
        assert_eq!(
            (session.expires_at() - session.issued_at()).num_seconds(),
            3600
        );
        assert!(!session.is_expired());
        assert_eq!(session.workspace().as_str(), "researcher");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_uses_deadline() {
        let session = Session::issue(ws(), Duration::from_secs(1));
        assert!(!session.is_expired());
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!session.is_expired());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(session.is_expired());
        assert_eq!(session.remaining(), Duration::ZERO);
    }
}

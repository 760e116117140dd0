//! Session authenticator.
//!
//! Drives the backend through `DISCONNECTED -> CONNECTED` and issues
//! sessions on successful authentication. The engine owns the issued
//! sessions; the authenticator keeps none.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::Session;
use agentvault_common::{Result, WorkspaceName};
use agentvault_storage::{Credential, SecretBackend};

/// Backend link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Verifies master credentials and issues workspace sessions.
pub struct Authenticator {
    backend: Arc<dyn SecretBackend>,
    ttl: Duration,
    link: Mutex<LinkState>,
}

impl Authenticator {
    pub fn new(backend: Arc<dyn SecretBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            link: Mutex::new(LinkState::Disconnected),
        }
    }

    pub async fn link_state(&self) -> LinkState {
        *self.link.lock().await
    }

    /// Establish the backend link. Idempotent.
    ///
    /// # Errors
    /// - `Connection` if the backend resource is unavailable
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if *link == LinkState::Connected {
            return Ok(());
        }
        self.backend.connect().await?;
        *link = LinkState::Connected;
        info!(backend = %self.backend.kind(), "Backend connected");
        Ok(())
    }

    /// One-time backend initialization with a master credential.
    pub async fn provision(&self, credential: &Credential) -> Result<()> {
        self.connect().await?;
        self.backend.provision(credential).await?;
        info!(backend = %self.backend.kind(), "Backend provisioned");
        Ok(())
    }

    /// Verify `credential` against the backend and issue a session bound
    /// to `workspace`. Connects first if needed.
    ///
    /// Every call verifies the credential again; sessions for different
    /// workspaces are independent.
    ///
    /// # Errors
    /// - `Connection` if the backend cannot be reached
    /// - `Authentication`, `Integrity` or `DeviceWiped` from the backend
    pub async fn authenticate(
        &self,
        credential: &Credential,
        workspace: &WorkspaceName,
    ) -> Result<Session> {
        self.connect().await?;
        self.backend.authenticate(credential).await?;

        let session = Session::issue(workspace.clone(), self.ttl);
        debug!(
            session = %session.id().short(),
            workspace = %workspace,
            ttl_secs = self.ttl.as_secs(),
            "Session issued"
        );
        Ok(session)
    }

    /// Drop the backend link and any unlocked key material.
    pub async fn disconnect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        self.backend.disconnect().await?;
        *link = LinkState::Disconnected;
        Ok(())
    }
}

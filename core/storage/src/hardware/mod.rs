//! Hardware secure-element backend.
//!
//! Workspaces are flattened onto device slots named `{workspace}/{name}`;
//! workspace names cannot contain `/`.

mod device;
mod touch;

pub use device::{
    DevicePolicy, DeviceStatus, HardwareInfo, SecureElement, SlotEntry, MIN_PIN_LEN,
};
pub use touch::{
    touch_channel, SimulatedTouch, TouchButton, TouchChannel, TouchDecision, TouchOperation,
    TouchSensor,
};

use async_trait::async_trait;
use std::sync::Arc;

use crate::backend::{wrong_credential, BackendInfo, Credential, CredentialKind, SecretBackend};
use crate::model::{Labels, Secret};
use agentvault_common::{
    BackendKind, Error, Result, SecretName, SensitiveBytes, WorkspaceName,
};

/// Device id reported by the simulated element.
pub const SIMULATED_DEVICE_ID: &str = "AVP-SIM-0001";

/// Secret backend over a [`SecureElement`].
pub struct HardwareBackend {
    device: Arc<SecureElement>,
}

impl HardwareBackend {
    pub fn new(device: Arc<SecureElement>) -> Self {
        Self { device }
    }

    /// Simulated device that confirms touches automatically.
    pub fn simulated(policy: DevicePolicy, touch: Arc<dyn TouchSensor>) -> Self {
        Self::new(Arc::new(SecureElement::new(SIMULATED_DEVICE_ID, policy, touch)))
    }

    /// The underlying device, e.g. to cancel a pending touch.
    pub fn device(&self) -> &Arc<SecureElement> {
        &self.device
    }
}

fn slot_name(workspace: &WorkspaceName, name: &SecretName) -> String {
    format!("{}/{}", workspace, name)
}

fn pin_of(credential: &Credential) -> Result<&SensitiveBytes> {
    match credential {
        Credential::Pin(pin) => Ok(pin),
        _ => Err(wrong_credential(BackendKind::Hardware, CredentialKind::Pin)),
    }
}

/// Map a slot miss onto the secret's own name.
fn secret_not_found(workspace: &WorkspaceName, name: &SecretName) -> impl FnOnce(Error) -> Error {
    let message = format!("Secret '{}' not found in workspace '{}'", name, workspace);
    move |e| match e {
        Error::NotFound(_) => Error::NotFound(message),
        other => other,
    }
}

#[async_trait]
impl SecretBackend for HardwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hardware
    }

    async fn info(&self) -> BackendInfo {
        let hardware = self.device.info().await;
        BackendInfo {
            kind: BackendKind::Hardware,
            security_level: BackendKind::Hardware.security_level(),
            credential: CredentialKind::Pin,
            persistent: true,
            requires_touch: true,
            connected: hardware.status != DeviceStatus::Disconnected,
            hardware: Some(hardware),
        }
    }

    async fn connect(&self) -> Result<()> {
        self.device.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await;
        Ok(())
    }

    async fn provision(&self, credential: &Credential) -> Result<()> {
        self.device.setup(pin_of(credential)?.as_bytes()).await
    }

    async fn authenticate(&self, credential: &Credential) -> Result<()> {
        self.device.authenticate(pin_of(credential)?.as_bytes()).await
    }

    async fn put(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
        labels: Labels,
    ) -> Result<u64> {
        self.device
            .store(&slot_name(workspace, name), &value, labels)
            .await
    }

    async fn get(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<Secret> {
        let entry = self
            .device
            .retrieve(&slot_name(workspace, name))
            .await
            .map_err(secret_not_found(workspace, name))?;
        Ok(Secret {
            name: name.clone(),
            value: entry.value,
            version: entry.version,
            labels: entry.labels,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    async fn delete(&self, workspace: &WorkspaceName, name: &SecretName) -> Result<bool> {
        self.device.delete(&slot_name(workspace, name)).await
    }

    async fn list(&self, workspace: &WorkspaceName) -> Result<Vec<SecretName>> {
        let prefix = format!("{}/", workspace);
        self.device
            .list_slots()
            .await?
            .into_iter()
            .filter_map(|slot| slot.strip_prefix(&prefix).map(str::to_string))
            .map(SecretName::new)
            .collect()
    }

    async fn rotate(
        &self,
        workspace: &WorkspaceName,
        name: &SecretName,
        value: SensitiveBytes,
    ) -> Result<u64> {
        self.device
            .rotate(&slot_name(workspace, name), &value)
            .await
            .map_err(secret_not_found(workspace, name))
    }
}

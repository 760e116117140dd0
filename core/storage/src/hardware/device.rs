//! Simulated secure element.
//!
//! ```text
//! DISCONNECTED -> connect -> UNCONFIGURED -> setup -> LOCKED -> authenticate -> UNLOCKED
//!                                 ^                                  |
//!                                 +------ third bad PIN (wipe) ------+
//! ```
//!
//! Slot values are encrypted under a device key generated at setup; the PIN
//! is kept only as a salted digest. Every slot mutation and read waits for a
//! touch confirmation bounded by the policy's timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::touch::{TouchDecision, TouchOperation, TouchSensor};
use crate::model::Labels;
use agentvault_common::{Error, Result, SensitiveBytes};
use agentvault_crypto::{decrypt_with_aad, encrypt_with_aad, DataKey, KdfParams, PinDigest};
use zeroize::Zeroizing;

/// Minimum PIN length accepted by `setup`.
pub const MIN_PIN_LEN: usize = 4;

/// Device limits.
#[derive(Debug, Clone)]
pub struct DevicePolicy {
    /// Consecutive bad PINs before the device wipes itself.
    pub max_attempts: u32,
    /// Number of secret slots.
    pub max_slots: usize,
    /// Upper bound on a single touch wait.
    pub touch_timeout: Duration,
    /// Argon2id cost for the stored PIN digest.
    pub pin_kdf: KdfParams,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_slots: 32,
            touch_timeout: Duration::from_secs(30),
            pin_kdf: KdfParams::interactive(),
        }
    }
}

impl DevicePolicy {
    /// Replace the PIN digest cost.
    pub fn with_pin_kdf(mut self, params: KdfParams) -> Self {
        self.pin_kdf = params;
        self
    }
}

/// Run a PIN KDF step off the async runtime.
async fn stretch_pin<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::InvalidState(format!("PIN derivation task failed: {}", e)))
}

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Unconfigured,
    Locked,
    Unlocked,
}

/// Device description, available without a PIN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub device_id: String,
    pub firmware_version: String,
    pub secure_element: String,
    pub slots_used: usize,
    pub slots_total: usize,
    pub tamper_detected: bool,
    pub status: DeviceStatus,
    pub failed_attempts: u32,
}

/// Decrypted slot contents.
#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub name: String,
    pub value: SensitiveBytes,
    pub version: u64,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Slot {
    name: String,
    ciphertext: Vec<u8>,
    version: u64,
    labels: Labels,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct DeviceState {
    connected: bool,
    pin: Option<PinDigest>,
    slot_key: Option<DataKey>,
    slots: Vec<Slot>,
    unlocked: bool,
    failed_attempts: u32,
    wiped: bool,
}

impl DeviceState {
    fn status(&self) -> DeviceStatus {
        if !self.connected {
            DeviceStatus::Disconnected
        } else if self.pin.is_none() {
            DeviceStatus::Unconfigured
        } else if self.unlocked {
            DeviceStatus::Unlocked
        } else {
            DeviceStatus::Locked
        }
    }

    fn wipe(&mut self) {
        self.slots.clear();
        self.pin = None;
        self.slot_key = None;
        self.unlocked = false;
        self.wiped = true;
    }

    /// Slot key of an unlocked device.
    fn unlocked_key(&self) -> Result<DataKey> {
        if self.wiped {
            return Err(wiped_error());
        }
        match (self.status(), &self.slot_key) {
            (DeviceStatus::Unlocked, Some(key)) => Ok(key.clone()),
            (DeviceStatus::Disconnected, _) => Err(disconnected_error()),
            (status, _) => Err(Error::InvalidState(format!(
                "Device is {:?}; authenticate with the PIN first",
                status
            ))),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }
}

fn wiped_error() -> Error {
    Error::DeviceWiped("Device was wiped after too many failed PIN attempts; run setup again".to_string())
}

fn disconnected_error() -> Error {
    Error::Connection("Device is not connected".to_string())
}

fn slot_not_found(name: &str) -> Error {
    Error::NotFound(format!("Slot '{}' not found", name))
}

/// A PIN-gated, slot-based secure element.
///
/// All state lives behind one async mutex that is held across the touch
/// wait: the device serves one operation at a time. A timed-out or cancelled
/// wait returns and drops the guard, so the device is never left held.
pub struct SecureElement {
    device_id: String,
    firmware_version: String,
    secure_element: String,
    policy: DevicePolicy,
    touch: Arc<dyn TouchSensor>,
    state: Mutex<DeviceState>,
    pending: std::sync::Mutex<CancellationToken>,
}

impl SecureElement {
    /// Create a simulated device.
    pub fn new(device_id: impl Into<String>, policy: DevicePolicy, touch: Arc<dyn TouchSensor>) -> Self {
        Self {
            device_id: device_id.into(),
            firmware_version: "1.0.0-sim".to_string(),
            secure_element: "TROPIC01-SIM".to_string(),
            policy,
            touch,
            state: Mutex::new(DeviceState::default()),
            pending: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn policy(&self) -> &DevicePolicy {
        &self.policy
    }

    pub async fn status(&self) -> DeviceStatus {
        self.state.lock().await.status()
    }

    pub async fn info(&self) -> HardwareInfo {
        let state = self.state.lock().await;
        HardwareInfo {
            device_id: self.device_id.clone(),
            firmware_version: self.firmware_version.clone(),
            secure_element: self.secure_element.clone(),
            slots_used: state.slots.len(),
            slots_total: self.policy.max_slots,
            tamper_detected: false,
            status: state.status(),
            failed_attempts: state.failed_attempts,
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.state.lock().await.connected = true;
        debug!(device_id = %self.device_id, "Device connected");
        Ok(())
    }

    /// Disconnect and relock.
    pub async fn disconnect(&self) {
        self.cancel_pending_touch();
        let mut state = self.state.lock().await;
        state.connected = false;
        state.unlocked = false;
    }

    /// Relock without disconnecting.
    pub async fn lock(&self) {
        self.state.lock().await.unlocked = false;
    }

    /// Configure the PIN. Only allowed on an unconfigured (new or wiped)
    /// device. The device stays locked until `authenticate`.
    ///
    /// # Errors
    /// - `InvalidInput` for a PIN shorter than 4 characters
    /// - `AlreadyExists` if a PIN is already configured
    pub async fn setup(&self, pin: &[u8]) -> Result<()> {
        if pin.len() < MIN_PIN_LEN {
            return Err(Error::InvalidInput(format!(
                "PIN must be at least {} characters",
                MIN_PIN_LEN
            )));
        }

        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(disconnected_error());
        }
        if state.pin.is_some() {
            return Err(Error::AlreadyExists("Device PIN is already configured".to_string()));
        }

        let params = self.policy.pin_kdf;
        let owned = Zeroizing::new(pin.to_vec());
        let digest = stretch_pin(move || PinDigest::new(&owned, &params)).await??;

        state.pin = Some(digest);
        state.slot_key = Some(DataKey::generate());
        state.slots.clear();
        state.failed_attempts = 0;
        state.unlocked = false;
        state.wiped = false;
        info!(device_id = %self.device_id, "Device PIN configured");
        Ok(())
    }

    /// Check the PIN and unlock.
    ///
    /// # Errors
    /// - `Authentication` for a wrong PIN while attempts remain
    /// - `DeviceWiped` when this failure exhausts the attempts, and for every
    ///   call after that until `setup` is run again
    pub async fn authenticate(&self, pin: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(disconnected_error());
        }
        if state.wiped {
            return Err(wiped_error());
        }
        let Some(digest) = state.pin.clone() else {
            return Err(Error::InvalidState("Device has no PIN configured".to_string()));
        };

        let owned = Zeroizing::new(pin.to_vec());
        if stretch_pin(move || digest.verify(&owned)).await? {
            state.failed_attempts = 0;
            state.unlocked = true;
            debug!(device_id = %self.device_id, "Device unlocked");
            return Ok(());
        }

        // A bad PIN only counts; sessions already unlocked keep working.
        state.failed_attempts += 1;
        if state.failed_attempts >= self.policy.max_attempts {
            state.wipe();
            warn!(
                device_id = %self.device_id,
                attempts = state.failed_attempts,
                "Maximum PIN attempts reached; device wiped"
            );
            return Err(wiped_error());
        }

        let remaining = self.policy.max_attempts - state.failed_attempts;
        warn!(device_id = %self.device_id, remaining, "Invalid PIN");
        Err(Error::Authentication(format!(
            "Invalid PIN ({} attempts remaining)",
            remaining
        )))
    }

    /// Abort any touch wait in progress with `Cancelled`.
    pub fn cancel_pending_touch(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.cancel();
        *pending = CancellationToken::new();
    }

    fn pending_token(&self) -> CancellationToken {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn require_touch(&self, operation: TouchOperation, slot: &str) -> Result<()> {
        let token = self.pending_token();
        let wait = tokio::time::timeout(self.policy.touch_timeout, self.touch.confirm(operation, slot));

        tokio::select! {
            _ = token.cancelled() => {
                debug!(?operation, slot, "Touch wait cancelled");
                Err(Error::Cancelled("Touch confirmation was cancelled".to_string()))
            }
            outcome = wait => match outcome {
                Err(_) => {
                    warn!(?operation, slot, "Touch confirmation timed out");
                    Err(Error::Timeout(format!(
                        "No touch confirmation within {}s",
                        self.policy.touch_timeout.as_secs()
                    )))
                }
                Ok(Ok(TouchDecision::Confirmed)) => Ok(()),
                Ok(Ok(TouchDecision::Denied)) => Err(Error::Authentication(
                    "Touch confirmation denied".to_string(),
                )),
                Ok(Err(e)) => Err(e),
            },
        }
    }

    /// Write a slot, destructively replacing an existing one. Returns the
    /// version (1).
    ///
    /// # Errors
    /// - `Capacity` when all slots are used and `name` is new
    pub async fn store(&self, name: &str, value: &SensitiveBytes, labels: Labels) -> Result<u64> {
        let mut state = self.state.lock().await;
        let key = state.unlocked_key()?;
        let existing = state.position(name);
        if existing.is_none() && state.slots.len() >= self.policy.max_slots {
            return Err(Error::Capacity(format!(
                "All {} slots are in use",
                self.policy.max_slots
            )));
        }

        self.require_touch(TouchOperation::Store, name).await?;

        let now = Utc::now();
        let slot = Slot {
            name: name.to_string(),
            ciphertext: encrypt_with_aad(key.as_bytes(), value.as_bytes(), name.as_bytes())?,
            version: 1,
            labels,
            created_at: now,
            updated_at: now,
        };
        match existing {
            Some(index) => state.slots[index] = slot,
            None => state.slots.push(slot),
        }
        Ok(1)
    }

    /// Read and decrypt a slot.
    pub async fn retrieve(&self, name: &str) -> Result<SlotEntry> {
        let state = self.state.lock().await;
        let key = state.unlocked_key()?;
        let index = state.position(name).ok_or_else(|| slot_not_found(name))?;

        self.require_touch(TouchOperation::Retrieve, name).await?;

        let slot = &state.slots[index];
        let value = decrypt_with_aad(key.as_bytes(), &slot.ciphertext, name.as_bytes())?;
        Ok(SlotEntry {
            name: slot.name.clone(),
            value: SensitiveBytes::new(value),
            version: slot.version,
            labels: slot.labels.clone(),
            created_at: slot.created_at,
            updated_at: slot.updated_at,
        })
    }

    /// Replace a slot value and bump its version.
    pub async fn rotate(&self, name: &str, value: &SensitiveBytes) -> Result<u64> {
        let mut state = self.state.lock().await;
        let key = state.unlocked_key()?;
        let index = state.position(name).ok_or_else(|| slot_not_found(name))?;

        self.require_touch(TouchOperation::Rotate, name).await?;

        let ciphertext = encrypt_with_aad(key.as_bytes(), value.as_bytes(), name.as_bytes())?;
        let slot = &mut state.slots[index];
        slot.ciphertext = ciphertext;
        slot.version += 1;
        slot.updated_at = Utc::now();
        Ok(slot.version)
    }

    /// Erase a slot. A missing slot needs no touch and returns `false`.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.unlocked_key()?;
        let Some(index) = state.position(name) else {
            return Ok(false);
        };

        self.require_touch(TouchOperation::Delete, name).await?;

        state.slots.remove(index);
        Ok(true)
    }

    /// Names of used slots in write order. No touch needed.
    pub async fn list_slots(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        state.unlocked_key()?;
        Ok(state.slots.iter().map(|s| s.name.clone()).collect())
    }
}

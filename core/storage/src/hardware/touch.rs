//! Physical-presence confirmation sources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use agentvault_common::{Error, Result};

/// Operation a touch confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchOperation {
    Store,
    Retrieve,
    Rotate,
    Delete,
}

/// What the user did at the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchDecision {
    Confirmed,
    Denied,
}

/// Source of touch confirmations.
///
/// `confirm` may take arbitrarily long; the device bounds it with its touch
/// timeout and may cancel it at any await point.
#[async_trait]
pub trait TouchSensor: Send + Sync {
    /// Wait for the user to confirm or deny `operation` on `slot`.
    async fn confirm(&self, operation: TouchOperation, slot: &str) -> Result<TouchDecision>;
}

/// Confirms every request after a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedTouch {
    delay: Duration,
}

impl SimulatedTouch {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Confirm immediately.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for SimulatedTouch {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl TouchSensor for SimulatedTouch {
    async fn confirm(&self, operation: TouchOperation, slot: &str) -> Result<TouchDecision> {
        debug!(?operation, slot, "Waiting for simulated touch");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(TouchDecision::Confirmed)
    }
}

/// Touch sensor driven by a [`TouchButton`] held elsewhere.
///
/// Presses made before a request arrives are queued and consumed in order.
pub struct TouchChannel {
    presses: Mutex<mpsc::Receiver<TouchDecision>>,
}

/// Handle that presses the device button.
#[derive(Debug, Clone)]
pub struct TouchButton {
    presses: mpsc::Sender<TouchDecision>,
}

/// Create a connected sensor/button pair.
pub fn touch_channel() -> (TouchChannel, TouchButton) {
    let (tx, rx) = mpsc::channel(16);
    (
        TouchChannel {
            presses: Mutex::new(rx),
        },
        TouchButton { presses: tx },
    )
}

impl TouchButton {
    /// Approve the pending (or next) operation.
    pub async fn confirm(&self) -> Result<()> {
        self.press(TouchDecision::Confirmed).await
    }

    /// Reject the pending (or next) operation.
    pub async fn deny(&self) -> Result<()> {
        self.press(TouchDecision::Denied).await
    }

    async fn press(&self, decision: TouchDecision) -> Result<()> {
        self.presses
            .send(decision)
            .await
            .map_err(|_| Error::Connection("Touch sensor is gone".to_string()))
    }
}

#[async_trait]
impl TouchSensor for TouchChannel {
    async fn confirm(&self, operation: TouchOperation, slot: &str) -> Result<TouchDecision> {
        debug!(?operation, slot, "Waiting for touch");
        self.presses
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Connection("Touch button disconnected".to_string()))
    }
}

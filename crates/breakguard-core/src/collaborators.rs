//! Interfaces to the lock display, notifications and monitor power
//!
//! The core never renders or performs network I/O itself. It calls these
//! traits on phase transitions; every failure here is logged and
//! otherwise ignored by the lock/unlock flow.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CollaboratorError, PersistenceError};
use crate::gate::SessionView;
use crate::secret_store::{SecretRecord, SecretStore};

/// Error returned by a [`PowerSwitch`]
pub type PowerError = CollaboratorError;

/// Full-screen lock surface
pub trait LockDisplay: Send + Sync {
    /// Show the lock for a new session
    fn present_lock(&self, session: &SessionView) -> Result<(), CollaboratorError>;

    /// Refresh after a submission or lockout change
    fn update_lock(&self, _session: &SessionView) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn dismiss_lock(&self) -> Result<(), CollaboratorError>;
}

/// Desktop notifications
pub trait Notifier: Send + Sync {
    fn notify_warning(&self, remaining: Duration) -> Result<(), CollaboratorError>;
}

/// Opaque reference to a remote power switch
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Zeroize)]
pub struct DeviceRef(String);

impl DeviceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRef({})", self.0)
    }
}

/// Which power switch to drive and how to authenticate to it
///
/// Sealed in the secret store, never written to the config file.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PowerCredential {
    device: DeviceRef,
    token: Option<String>,
}

impl PowerCredential {
    pub fn new(device: DeviceRef, token: Option<String>) -> Self {
        Self { device, token }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// The stored credential, if one was set
    pub fn load(store: &SecretStore) -> Result<Option<Self>, PersistenceError> {
        store.unseal(SecretRecord::PowerCredential)
    }

    /// Replace the stored credential
    pub fn save(&self, store: &SecretStore) -> Result<(), PersistenceError> {
        store.seal(SecretRecord::PowerCredential, self)
    }

    pub fn clear(store: &SecretStore) -> Result<(), PersistenceError> {
        store.remove(SecretRecord::PowerCredential)
    }
}

impl fmt::Debug for PowerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerCredential")
            .field("device", &self.device)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Monitor power switch, e.g. a smart plug behind an HTTP API
///
/// Calls must be idempotent. Callers bound them with a timeout.
#[async_trait]
pub trait PowerSwitch: Send + Sync {
    async fn power_off(&self, device: &DeviceRef) -> Result<(), PowerError>;
    async fn power_on(&self, device: &DeviceRef) -> Result<(), PowerError>;
}

/// What to do with the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    Off,
    On,
}

impl PowerCommand {
    /// Run this command against `switch`
    pub async fn apply(self, switch: &dyn PowerSwitch, device: &DeviceRef) -> Result<(), PowerError> {
        match self {
            PowerCommand::Off => switch.power_off(device).await,
            PowerCommand::On => switch.power_on(device).await,
        }
    }
}

/// Fire-and-forget power requests
///
/// Implementations must return immediately. The outcome is reported back
/// through [`LockController::record_power_result`].
///
/// [`LockController::record_power_result`]: crate::controller::LockController::record_power_result
pub trait PowerDispatch: Send + Sync {
    fn dispatch(&self, command: PowerCommand);
}

/// Dispatch used when no power switch is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPowerSwitch;

impl PowerDispatch for NoPowerSwitch {
    fn dispatch(&self, command: PowerCommand) {
        tracing::debug!("No power switch configured, skipping {:?}", command);
    }
}

//! BreakGuard core - break enforcement state machine
//!
//! This crate provides:
//! - The work/break timer with crash- and reboot-resilient persisted state
//! - TOTP enrollment and verification
//! - Face template enrollment and matching
//! - The unlock gate (factors + attempt/lockout policy) for a lock session
//! - The lock session controller binding timer events to the gate and to
//!   the display, notification and monitor-power collaborators
//! - Sealed at-rest storage for the TOTP secret, face template and
//!   remote-device credential
//!
//! Nothing in this crate renders a screen or talks to the network; those
//! concerns sit behind the traits in [`collaborators`].

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod face;
pub mod gate;
pub mod secret_store;
pub mod timer;
pub mod totp;

pub(crate) mod fsutil;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborators::{
    DeviceRef, LockDisplay, NoPowerSwitch, Notifier, PowerCommand, PowerCredential, PowerDispatch,
    PowerError, PowerSwitch,
};
pub use config::{BreakGuardConfig, GateConfig, TimerConfig};
pub use controller::{ControllerStatus, LockController, PowerStatus};
pub use error::{AuthError, CollaboratorError, ConfigError, CoreError, PersistenceError, Result};
pub use face::{
    CroppedFaceDetector, FaceDetector, FaceOutcome, FaceRegion, FaceTemplate, FaceVerifier,
    FaceVerifierConfig, Frame, FrameSource,
};
pub use gate::{
    AttemptBudget, AttemptPolicy, BudgetFile, Enrollment, FaceFactor, Factors, GateState,
    LockSession, SessionId, SessionKind, SessionView, UnlockGate,
};
pub use secret_store::{SecretRecord, SecretStore};
pub use timer::{Phase, StateFile, TimerEngine, TimerEvent, TimerState};
pub use totp::{AuthSecret, HashAlgorithm, Provisioning, TotpEngine, TotpParams};

//! Lock session records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one lock session; results tagged with an old id are stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a session was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Timer-driven break with the full-screen lock
    Break,
    /// User-requested timer reset, authenticated but without the lock screen
    Override,
}

/// Where a session is in the unlock sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    AwaitingTotp,
    AwaitingFace,
    /// Terminal
    Granted,
    /// Attempt budget exhausted until `until`
    Lockout { until: DateTime<Utc> },
}

/// The ephemeral record of one unlock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub attempts_remaining: u32,
    pub totp_passed: bool,
    /// `None` when the face factor is not active for this session
    pub face_passed: Option<bool>,
    pub opened_at: DateTime<Utc>,
}

impl LockSession {
    /// Both required factors are satisfied
    pub fn factors_satisfied(&self) -> bool {
        self.totp_passed && self.face_passed.unwrap_or(true)
    }
}

/// Snapshot handed to the lock display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: GateState,
    pub attempts_remaining: u32,
    pub totp_required: bool,
    pub face_required: bool,
    /// Seconds left in a lockout
    pub lockout_remaining_secs: Option<u64>,
    /// Status line for the display
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_factors_satisfied() {
        let mut session = LockSession {
            id: SessionId::new(),
            kind: SessionKind::Break,
            attempts_remaining: 5,
            totp_passed: true,
            face_passed: None,
            opened_at: Utc::now(),
        };
        assert!(session.factors_satisfied());

        session.face_passed = Some(false);
        assert!(!session.factors_satisfied());

        session.face_passed = Some(true);
        session.totp_passed = false;
        assert!(!session.factors_satisfied());
    }
}

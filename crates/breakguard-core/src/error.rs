//! Error types for the BreakGuard core

use thiserror::Error;

use crate::timer::Phase;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Invalid configuration, rejected when it is supplied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field is out of range or inconsistent with another field
    #[error("Invalid config: {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Verification failures during enrollment or unlock
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid code ({attempts_remaining} attempts remaining)")]
    InvalidCode { attempts_remaining: u32 },

    #[error("Face does not match ({attempts_remaining} attempts remaining)")]
    NoMatch { attempts_remaining: u32 },

    #[error("No face detected - try again")]
    NoFaceDetected,

    #[error("Lock session is closed")]
    SessionClosed,

    #[error("Too many failed attempts - locked out for {remaining_secs} seconds")]
    Lockout { remaining_secs: u64 },

    #[error("Unexpected submission - waiting for {expected}")]
    UnexpectedSubmission { expected: &'static str },

    #[error("No lock session is active")]
    NoActiveSession,

    #[error("Submission belongs to a lock session that is no longer active")]
    StaleSession,

    #[error("{0} is not enrolled")]
    NotEnrolled(&'static str),

    #[error("Enrollment needs {required} usable samples, only {accepted} accepted")]
    EnrollmentInsufficientSamples { accepted: usize, required: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// State or secret files that could not be read or written
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// Display, notification or power collaborator failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Collaborator timed out")]
    Timeout,

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator failed: {0}")]
    Failed(String),
}

/// Umbrella error for core operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Cannot {action} while {phase:?}")]
    InvalidTransition { phase: Phase, action: &'static str },
}

impl CoreError {
    /// The auth error inside, if this is one
    pub fn as_auth(&self) -> Option<&AuthError> {
        match self {
            CoreError::Auth(e) => Some(e),
            _ => None,
        }
    }
}

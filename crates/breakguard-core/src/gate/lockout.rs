//! Attempt budget and lockout cooldown
//!
//! TOTP and face failures draw from one budget per lock session. When it
//! runs out the session is locked out for the cooldown, after which the
//! budget is refilled. A session that is abandoned hands its budget to the
//! next one as an [`AttemptBudget`], so reopening never buys new attempts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{add, elapsed_between};
use crate::config::GateConfig;
use crate::error::PersistenceError;
use crate::fsutil::{remove_if_exists, write_atomic};

const BUDGET_FILE_NAME: &str = "attempt_budget.json";

/// Attempt budget and cooldown for a lock session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptPolicy {
    /// Failures allowed before a lockout
    pub max_attempts: u32,
    /// How long a lockout lasts
    pub cooldown: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&GateConfig> for AttemptPolicy {
    fn from(config: &GateConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            cooldown: config.lockout_cooldown,
        }
    }
}

impl AttemptPolicy {
    /// When a lockout starting at `now` ends
    pub fn lockout_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        add(now, self.cooldown)
    }

    /// Whole seconds left in a lockout, rounded up so a live lockout never
    /// reports zero
    pub fn remaining_secs(&self, until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        let left = elapsed_between(now, until);
        left.as_secs() + u64::from(left.subsec_nanos() > 0)
    }

    /// Human-readable description of the budget or lockout
    pub fn describe_lockout(&self, attempts_remaining: u32, locked_for: Option<u64>) -> String {
        match locked_for {
            Some(secs) if secs < 60 => format!("Locked for {} seconds", secs),
            Some(secs) if secs < 3600 => format!("Locked for {} minutes", secs.div_ceil(60)),
            Some(secs) => format!("Locked for {} hours", secs.div_ceil(3600)),
            None => format!("{} attempts remaining", attempts_remaining),
        }
    }
}

/// What is left of an abandoned session's budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptBudget {
    pub attempts_remaining: u32,
    /// End of a running lockout
    pub lockout_until: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptBudget {
    /// A budget that is spent as of `now`
    pub fn exhausted(now: DateTime<Utc>) -> Self {
        Self {
            attempts_remaining: 0,
            lockout_until: None,
            recorded_at: now,
        }
    }

    /// Attempts and lockout a new session opened at `now` starts with
    ///
    /// A running lockout carries over unchanged. Failures without a
    /// lockout are forgiven once a full cooldown has passed since they
    /// were recorded; a spent budget with no deadline starts a lockout.
    pub fn resume(&self, policy: &AttemptPolicy, now: DateTime<Utc>) -> (u32, Option<DateTime<Utc>>) {
        if let Some(until) = self.lockout_until {
            return (0, Some(until));
        }
        if now >= policy.lockout_until(self.recorded_at) {
            return (policy.max_attempts, None);
        }
        match self.attempts_remaining.min(policy.max_attempts) {
            0 => (0, Some(policy.lockout_until(self.recorded_at))),
            left => (left, None),
        }
    }
}

/// [`AttemptBudget`] kept on disk between runs of one-shot commands
#[derive(Debug, Clone)]
pub struct BudgetFile {
    path: PathBuf,
}

impl BudgetFile {
    /// Budget file in `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(BUDGET_FILE_NAME),
        }
    }

    pub fn load(&self) -> Result<Option<AttemptBudget>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        let budget = serde_json::from_slice(&data).map_err(|e| PersistenceError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(budget))
    }

    pub fn save(&self, budget: &AttemptBudget) -> Result<(), PersistenceError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(budget)?, false)?;
        debug!("Saved attempt budget ({} left)", budget.attempts_remaining);
        Ok(())
    }

    /// Forget the budget after a successful verification
    pub fn clear(&self) -> Result<(), PersistenceError> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}

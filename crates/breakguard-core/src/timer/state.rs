//! Persisted timer record

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TimerConfig;

/// Where the work/break cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Working,
    Warned,
    Locked,
    Paused,
}

impl Phase {
    /// Phases in which work time accumulates
    pub fn is_counting(self) -> bool {
        matches!(self, Phase::Working | Phase::Warned)
    }
}

/// Events emitted by [`TimerEngine::tick`](super::TimerEngine::tick)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The warning threshold was crossed; `remaining` is the time left
    /// until the lock
    Warning { remaining: Duration },
    /// The lock deadline was crossed and the timer is now `Locked`
    LockDue,
}

/// The timer record written to the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub work_interval: Duration,
    pub warning_lead: Duration,
    /// Work time accumulated since the last reset
    pub elapsed: Duration,
    pub phase: Phase,
    /// Phase to return to on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<Phase>,
    /// Snoozes taken this cycle
    #[serde(default)]
    pub snoozes_used: u32,
    /// How far snoozes have pushed the lock deadline this cycle
    #[serde(default)]
    pub snooze_extension: Duration,
    pub last_persisted_at: DateTime<Utc>,
}

impl TimerState {
    /// A fresh cycle
    pub fn working(config: &TimerConfig, now: DateTime<Utc>) -> Self {
        Self {
            work_interval: config.work_interval,
            warning_lead: config.warning_lead,
            elapsed: Duration::ZERO,
            phase: Phase::Working,
            paused_from: None,
            snoozes_used: 0,
            snooze_extension: Duration::ZERO,
            last_persisted_at: now,
        }
    }

    /// A cycle whose lock is already due
    pub fn locked(config: &TimerConfig, now: DateTime<Utc>) -> Self {
        Self {
            elapsed: config.work_interval,
            phase: Phase::Locked,
            ..Self::working(config, now)
        }
    }

    /// Elapsed time at which the warning fires
    pub fn warning_at(&self) -> Duration {
        self.work_interval.saturating_sub(self.warning_lead)
    }

    /// Elapsed time at which the lock fires
    pub fn lock_at(&self) -> Duration {
        self.work_interval.saturating_add(self.snooze_extension)
    }

    /// Upper bound on `elapsed` at any checkpoint
    pub fn elapsed_bound(&self) -> Duration {
        self.lock_at().saturating_add(self.warning_lead)
    }

    /// Check the invariants a loaded record must satisfy
    pub fn validate(&self) -> Result<(), String> {
        TimerConfig::check(self.work_interval, self.warning_lead).map_err(|e| e.to_string())?;

        if self.elapsed > self.elapsed_bound() {
            return Err(format!(
                "elapsed {}s exceeds bound {}s",
                self.elapsed.as_secs(),
                self.elapsed_bound().as_secs()
            ));
        }
        match (self.phase, self.paused_from) {
            (Phase::Paused, Some(from)) if from.is_counting() => {}
            (Phase::Paused, _) => return Err("paused without a resumable phase".to_string()),
            (_, Some(_)) => return Err("resume phase set while not paused".to_string()),
            (_, None) => {}
        }
        if self.snoozes_used == 0 && !self.snooze_extension.is_zero() {
            return Err("snooze extension without a snooze".to_string());
        }
        Ok(())
    }
}

//! Enforcement configuration
//!
//! [`BreakGuardConfig`] is the user-facing settings record. It is validated
//! once and then split into the typed configs each component is built
//! from, so nothing reads settings from shared mutable state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::face::FaceVerifierConfig;

/// Shortest allowed work interval
pub const MIN_WORK_INTERVAL: Duration = Duration::from_secs(60);
/// Longest allowed work interval
pub const MAX_WORK_INTERVAL: Duration = Duration::from_secs(240 * 60);
/// Upper bound for a single monitor-power call
pub const MAX_POWER_TIMEOUT_SECS: u64 = 5;

/// User settings consumed by the enforcement core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakGuardConfig {
    /// Minutes of work before a break is enforced (1-240)
    pub work_interval_minutes: u64,

    /// Minutes of notice before the lock
    pub warning_before_minutes: u64,

    /// Require a TOTP code to unlock
    pub totp_enabled: bool,

    /// Require a face match after the TOTP code
    pub face_verification_enabled: bool,

    /// How many times a break may be postponed per cycle
    pub max_snooze_count: u32,

    /// How long one snooze postpones the break
    pub snooze_minutes: u64,

    /// Failed verifications allowed before a lockout
    pub max_attempts: u32,

    /// Length of a lockout
    pub lockout_cooldown_seconds: u64,

    /// Face similarity needed for a match (0-1)
    pub face_match_threshold: f32,

    /// How often timer progress is checkpointed to disk
    pub checkpoint_interval_seconds: u64,

    /// Per-call timeout for the monitor power switch (at most 5)
    pub power_timeout_seconds: u64,

    /// Program run as `<program> off|on <device>` to switch the monitor;
    /// the device itself is sealed in the secret store
    pub power_command: Option<PathBuf>,

    /// Program that writes one PNG or binary PGM camera frame to stdout
    pub camera_command: Option<PathBuf>,

    /// Where state and sealed secrets live
    pub data_dir: Option<PathBuf>,
}

impl Default for BreakGuardConfig {
    fn default() -> Self {
        Self {
            work_interval_minutes: 60,
            warning_before_minutes: 5,
            totp_enabled: true,
            face_verification_enabled: true,
            max_snooze_count: 1,
            snooze_minutes: 5,
            max_attempts: 5,
            lockout_cooldown_seconds: 60,
            face_match_threshold: 0.6,
            checkpoint_interval_seconds: 60,
            power_timeout_seconds: MAX_POWER_TIMEOUT_SECS,
            power_command: None,
            camera_command: None,
            data_dir: None,
        }
    }
}

impl BreakGuardConfig {
    /// Check every field; nothing is clamped
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timer_config()?;
        self.gate_config()?;
        self.face_verifier_config()?;

        if self.power_timeout_seconds == 0 || self.power_timeout_seconds > MAX_POWER_TIMEOUT_SECS {
            return Err(ConfigError::invalid(
                "power_timeout_seconds",
                format!("must be 1-{MAX_POWER_TIMEOUT_SECS}"),
            ));
        }
        Ok(())
    }

    /// Timer settings derived from this config
    pub fn timer_config(&self) -> Result<TimerConfig, ConfigError> {
        let mut timer = TimerConfig::new(
            Duration::from_secs(self.work_interval_minutes.saturating_mul(60)),
            Duration::from_secs(self.warning_before_minutes.saturating_mul(60)),
        )?;
        timer.max_snoozes = self.max_snooze_count;
        timer.snooze_duration = Duration::from_secs(self.snooze_minutes.saturating_mul(60));
        if self.checkpoint_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "checkpoint_interval_seconds",
                "must be at least 1",
            ));
        }
        timer.checkpoint_interval = Duration::from_secs(self.checkpoint_interval_seconds);
        Ok(timer)
    }

    /// Unlock gate settings derived from this config
    pub fn gate_config(&self) -> Result<GateConfig, ConfigError> {
        GateConfig::new(
            self.max_attempts,
            Duration::from_secs(self.lockout_cooldown_seconds),
            self.totp_enabled,
            self.face_verification_enabled,
        )
    }

    /// Face verifier settings derived from this config
    pub fn face_verifier_config(&self) -> Result<FaceVerifierConfig, ConfigError> {
        if !(self.face_match_threshold > 0.0 && self.face_match_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "face_match_threshold",
                format!("{} is not in (0, 1]", self.face_match_threshold),
            ));
        }
        Ok(FaceVerifierConfig {
            threshold: self.face_match_threshold,
            ..FaceVerifierConfig::default()
        })
    }

    pub fn power_timeout(&self) -> Duration {
        Duration::from_secs(self.power_timeout_seconds)
    }
}

/// Timer thresholds and checkpoint cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub work_interval: Duration,
    pub warning_lead: Duration,
    pub max_snoozes: u32,
    pub snooze_duration: Duration,
    pub checkpoint_interval: Duration,
}

impl TimerConfig {
    /// Build a config, rejecting an interval outside 1-240 minutes or a
    /// warning lead that is not strictly shorter than the interval
    pub fn new(work_interval: Duration, warning_lead: Duration) -> Result<Self, ConfigError> {
        Self::check(work_interval, warning_lead)?;
        Ok(Self {
            work_interval,
            warning_lead,
            max_snoozes: 1,
            snooze_duration: Duration::from_secs(5 * 60),
            checkpoint_interval: Duration::from_secs(60),
        })
    }

    pub(crate) fn check(work_interval: Duration, warning_lead: Duration) -> Result<(), ConfigError> {
        if work_interval < MIN_WORK_INTERVAL || work_interval > MAX_WORK_INTERVAL {
            return Err(ConfigError::invalid(
                "work_interval",
                format!("{}s is not within 1-240 minutes", work_interval.as_secs()),
            ));
        }
        if warning_lead >= work_interval {
            return Err(ConfigError::invalid(
                "warning_lead",
                format!(
                    "{}s must be shorter than the work interval ({}s)",
                    warning_lead.as_secs(),
                    work_interval.as_secs()
                ),
            ));
        }
        Ok(())
    }
}

/// Unlock gate policy and capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    pub max_attempts: u32,
    pub lockout_cooldown: Duration,
    pub totp_enabled: bool,
    pub face_enabled: bool,
}

impl GateConfig {
    pub fn new(
        max_attempts: u32,
        lockout_cooldown: Duration,
        totp_enabled: bool,
        face_enabled: bool,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        Ok(Self {
            max_attempts,
            lockout_cooldown,
            totp_enabled,
            face_enabled,
        })
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_cooldown: Duration::from_secs(60),
            totp_enabled: true,
            face_enabled: true,
        }
    }
}

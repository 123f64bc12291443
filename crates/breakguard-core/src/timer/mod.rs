//! Work/break timer
//!
//! [`TimerEngine`] owns the [`TimerState`]. Elapsed work time is advanced
//! from wall-clock deltas between ticks, so time spent asleep, hibernated
//! or powered off while working still counts. The state is saved on every
//! phase change and at the checkpoint interval.

mod state;
mod store;

pub use state::{Phase, TimerEvent, TimerState};
pub use store::StateFile;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::elapsed_between;
use crate::config::TimerConfig;
use crate::error::{ConfigError, CoreError, PersistenceError, Result};

/// Work/break countdown with persisted state
#[derive(Debug)]
pub struct TimerEngine {
    config: TimerConfig,
    state: TimerState,
    last_tick_at: DateTime<Utc>,
    last_checkpoint_at: DateTime<Utc>,
    store: StateFile,
}

impl TimerEngine {
    /// Restore the timer from `store`, or start a fresh cycle
    ///
    /// A saved `Working`/`Warned` cycle resumes from its last checkpoint:
    /// the first tick adds the whole gap since then. A saved `Locked`
    /// cycle stays locked. An unreadable state file recovers as `Locked`
    /// if the lock marker is present and as a fresh cycle otherwise.
    pub fn recover(config: TimerConfig, store: StateFile, now: DateTime<Utc>) -> Self {
        let (mut state, last_tick_at) = match store.load() {
            Ok(Some(state)) => {
                let resume_from = if state.phase.is_counting() {
                    state.last_persisted_at
                } else {
                    now
                };
                info!(
                    "Restored timer state: {:?}, {}s elapsed",
                    state.phase,
                    state.elapsed.as_secs()
                );
                (state, resume_from)
            }
            Ok(None) if store.has_lock_marker() => {
                warn!("Timer state missing but lock marker present, staying locked");
                (TimerState::locked(&config, now), now)
            }
            Ok(None) => {
                info!("No saved timer state, starting a new cycle");
                (TimerState::working(&config, now), now)
            }
            Err(e) if store.has_lock_marker() => {
                warn!("Timer state unreadable ({}), lock marker present, staying locked", e);
                (TimerState::locked(&config, now), now)
            }
            Err(e) => {
                warn!("Timer state unreadable ({}), starting a new cycle", e);
                (TimerState::working(&config, now), now)
            }
        };

        state.work_interval = config.work_interval;
        state.warning_lead = config.warning_lead;
        state.elapsed = state.elapsed.min(state.lock_at());

        let mut engine = Self {
            config,
            state,
            last_tick_at,
            last_checkpoint_at: now,
            store,
        };
        // Counting phases are saved by the first tick, after the gap is added
        if !engine.state.phase.is_counting() {
            engine.persist(now);
        }
        engine
    }

    /// Advance elapsed time to `now` and report threshold crossings
    ///
    /// Delivering the same `now` twice adds nothing and emits nothing. A
    /// clock that moved backwards adds nothing.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let before = self.state.phase;
        self.accumulate(now);

        let mut events = Vec::new();
        if self.state.phase == Phase::Working && self.state.elapsed >= self.state.warning_at() {
            self.state.phase = Phase::Warned;
            let remaining = self.remaining();
            info!("Break warning: {}s until lock", remaining.as_secs());
            events.push(TimerEvent::Warning { remaining });
        }
        if self.state.phase == Phase::Warned && self.state.elapsed >= self.state.lock_at() {
            self.state.phase = Phase::Locked;
            self.state.elapsed = self.state.lock_at();
            info!("Break due after {}s of work", self.state.elapsed.as_secs());
            events.push(TimerEvent::LockDue);
        }

        if self.state.phase != before
            || elapsed_between(self.last_checkpoint_at, now) >= self.config.checkpoint_interval
        {
            self.persist(now);
        }
        events
    }

    /// Freeze elapsed time; allowed in `Working` and `Warned`
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.state.phase.is_counting() {
            return Err(self.invalid("pause"));
        }
        self.accumulate(now);
        self.state.paused_from = Some(self.state.phase);
        self.state.phase = Phase::Paused;
        info!("Timer paused at {}s", self.state.elapsed.as_secs());
        self.persist(now);
        Ok(())
    }

    /// Continue from where [`pause`](Self::pause) left off
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(from) = self.state.paused_from.filter(|_| self.state.phase == Phase::Paused) else {
            return Err(self.invalid("resume"));
        };
        self.state.phase = from;
        self.state.paused_from = None;
        self.last_tick_at = now;
        info!("Timer resumed");
        self.persist(now);
        Ok(())
    }

    /// Postpone the lock by the snooze duration; allowed in `Warned`
    /// while snoozes remain this cycle
    pub fn snooze(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state.phase != Phase::Warned {
            return Err(self.invalid("snooze"));
        }
        if self.snoozes_left() == 0 {
            return Err(self.invalid("snooze again"));
        }
        self.accumulate(now);
        self.state.snoozes_used += 1;
        self.state.snooze_extension = self
            .state
            .snooze_extension
            .saturating_add(self.config.snooze_duration);
        info!(
            "Break snoozed for {}s ({} left)",
            self.config.snooze_duration.as_secs(),
            self.snoozes_left()
        );
        self.persist(now);
        Ok(())
    }

    /// Start a new cycle
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.state = TimerState::working(&self.config, now);
        self.last_tick_at = now;
        info!("Timer reset");
        self.persist(now);
    }

    /// Change the interval and warning lead
    ///
    /// Takes effect immediately; a locked timer stays locked until reset.
    pub fn configure(
        &mut self,
        work_interval: Duration,
        warning_lead: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ConfigError> {
        TimerConfig::check(work_interval, warning_lead)?;
        self.config.work_interval = work_interval;
        self.config.warning_lead = warning_lead;
        self.state.work_interval = work_interval;
        self.state.warning_lead = warning_lead;
        self.state.elapsed = self.state.elapsed.min(self.state.lock_at());
        info!(
            "Timer configured: interval {}s, warning {}s",
            work_interval.as_secs(),
            warning_lead.as_secs()
        );
        self.persist(now);
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn elapsed(&self) -> Duration {
        self.state.elapsed
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn snoozes_left(&self) -> u32 {
        self.config.max_snoozes.saturating_sub(self.state.snoozes_used)
    }

    /// Work time left before the lock
    pub fn remaining(&self) -> Duration {
        self.state.lock_at().saturating_sub(self.state.elapsed)
    }

    /// `MM:SS`, or `HH:MM:SS` from one hour up
    pub fn remaining_formatted(&self) -> String {
        format_duration(self.remaining())
    }

    /// Share of the cycle worked, 0-100
    pub fn progress_percent(&self) -> f32 {
        let total = self.state.lock_at().as_secs_f32();
        if total <= 0.0 {
            return 100.0;
        }
        (self.state.elapsed.as_secs_f32() / total * 100.0).min(100.0)
    }

    fn accumulate(&mut self, now: DateTime<Utc>) {
        let delta = elapsed_between(self.last_tick_at, now);
        if now < self.last_tick_at {
            debug!("Wall clock moved backwards, no time added");
        }
        self.last_tick_at = now;

        if self.state.phase.is_counting() {
            self.state.elapsed = self
                .state
                .elapsed
                .saturating_add(delta)
                .min(self.state.elapsed_bound());
        }
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        self.state.last_persisted_at = now;
        self.last_checkpoint_at = now;
        if let Err(e) = self.store.save(&self.state) {
            log_save_failure(&e);
        }
    }

    fn invalid(&self, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            phase: self.state.phase,
            action,
        }
    }
}

fn log_save_failure(e: &PersistenceError) {
    warn!("Failed to save timer state: {}", e);
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

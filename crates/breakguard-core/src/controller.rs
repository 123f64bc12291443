//! Lock session controller
//!
//! [`LockController`] is the single owner of the timer and the active lock
//! session. Timer events open break sessions, unlock submissions are
//! routed to the session's [`UnlockGate`], and a granted session restores
//! the monitor, dismisses the display and resets the timer.
//!
//! Every method takes `&mut self`; the daemon serializes all calls through
//! one task so ticks and submissions never race.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::collaborators::{LockDisplay, Notifier, PowerCommand, PowerDispatch, PowerError};
use crate::config::GateConfig;
use crate::error::{AuthError, ConfigError, CoreError, Result};
use crate::face::Frame;
use crate::gate::{AttemptBudget, Factors, GateState, SessionId, SessionKind, SessionView, UnlockGate};
use crate::timer::{Phase, TimerEngine, TimerEvent};

/// Health of the monitor power collaborator
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PowerStatus {
    #[default]
    Ok,
    /// The last power call failed even after a retry
    Degraded { reason: String },
}

/// Read-only snapshot for status displays
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub phase: Phase,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub remaining_formatted: String,
    pub progress_percent: f32,
    pub snoozes_left: u32,
    pub session: Option<SessionView>,
    pub power: PowerStatus,
}

/// Top-level enforcement state machine
pub struct LockController {
    timer: TimerEngine,
    factors: Arc<Factors>,
    gate_config: GateConfig,
    session: Option<UnlockGate>,
    /// Left behind by the last abandoned override
    carried_budget: Option<AttemptBudget>,
    display: Arc<dyn LockDisplay>,
    notifier: Arc<dyn Notifier>,
    power: Arc<dyn PowerDispatch>,
    power_status: PowerStatus,
}

impl LockController {
    /// Take ownership of a recovered timer; a timer recovered as `Locked`
    /// re-enters the lock immediately
    pub fn start(
        timer: TimerEngine,
        factors: Arc<Factors>,
        gate_config: GateConfig,
        display: Arc<dyn LockDisplay>,
        notifier: Arc<dyn Notifier>,
        power: Arc<dyn PowerDispatch>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut controller = Self {
            timer,
            factors,
            gate_config,
            session: None,
            carried_budget: None,
            display,
            notifier,
            power,
            power_status: PowerStatus::Ok,
        };
        if controller.timer.phase() == Phase::Locked {
            info!("Timer was locked at shutdown, re-entering lock");
            controller.enter_lock(now);
        }
        controller
    }

    /// Advance the timer and react to its events
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        self.poll(now);

        let events = self.timer.tick(now);
        for event in &events {
            match *event {
                TimerEvent::Warning { remaining } => {
                    if let Err(e) = self.notifier.notify_warning(remaining) {
                        warn!("Break warning notification failed: {}", e);
                    }
                }
                TimerEvent::LockDue => self.enter_lock(now),
            }
        }
        events
    }

    /// Submit a TOTP code to the active session
    pub fn submit_code(&mut self, code: &str, now: DateTime<Utc>) -> Result<GateState> {
        let gate = self.session.as_mut().ok_or(AuthError::NoActiveSession)?;
        let result = gate.submit_code(code, now);
        self.after_submission(now);
        Ok(result?)
    }

    /// Submit a captured frame to the session it was captured for
    pub fn submit_face(&mut self, session_id: SessionId, frame: &Frame, now: DateTime<Utc>) -> Result<GateState> {
        let gate = self.session.as_mut().ok_or(AuthError::NoActiveSession)?;
        if gate.id() != session_id {
            debug!("Dropping frame for stale session {}", session_id);
            return Err(AuthError::StaleSession.into());
        }
        let result = gate.submit_face(frame, now);
        self.after_submission(now);
        Ok(result?)
    }

    /// Open an authenticated timer reset (the "skip break" path)
    ///
    /// Never presents the lock screen; a granted override resets the timer.
    pub fn begin_override(&mut self, now: DateTime<Utc>) -> Result<SessionView> {
        match &self.session {
            Some(gate) if gate.kind() == SessionKind::Break => {
                return Err(CoreError::InvalidTransition {
                    phase: self.timer.phase(),
                    action: "override",
                })
            }
            Some(gate) => return Ok(gate.view(now)),
            None => {}
        }
        let gate = self.open_gate(SessionKind::Override, now);
        let view = gate.view(now);
        self.session = Some(gate);
        Ok(view)
    }

    /// Abandon an override session; break sessions cannot be cancelled
    ///
    /// The remaining attempts and any running lockout pass to the next
    /// session.
    pub fn cancel_override(&mut self, now: DateTime<Utc>) -> bool {
        match self.session.take() {
            Some(gate) if gate.kind() == SessionKind::Override => {
                self.carried_budget = Some(gate.budget(now));
                info!("Override cancelled");
                true
            }
            other => {
                self.session = other;
                false
            }
        }
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.tick(now);
        self.ensure_unlocked("pause")?;
        self.cancel_override(now);
        self.timer.pause(now)
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_unlocked("resume")?;
        self.timer.resume(now)
    }

    pub fn snooze(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.tick(now);
        self.ensure_unlocked("snooze")?;
        self.timer.snooze(now)
    }

    /// Change the timer thresholds
    pub fn configure_timer(
        &mut self,
        work_interval: Duration,
        warning_lead: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ConfigError> {
        self.timer.configure(work_interval, warning_lead, now)
    }

    /// Replace the enrolled factors; applies from the next session
    pub fn set_factors(&mut self, factors: Arc<Factors>) {
        self.factors = factors;
    }

    /// End an expired lockout and refresh the display
    pub fn poll(&mut self, now: DateTime<Utc>) {
        let Some(gate) = self.session.as_mut() else {
            return;
        };
        let before = gate.state();
        if gate.poll(now) != before && gate.kind() == SessionKind::Break {
            if let Err(e) = self.display.update_lock(&gate.view(now)) {
                warn!("Lock display update failed: {}", e);
            }
        }
    }

    /// Record the outcome of a dispatched power command
    pub fn record_power_result(&mut self, command: PowerCommand, result: std::result::Result<(), PowerError>) {
        match result {
            Ok(()) => {
                debug!("Power {:?} succeeded", command);
                self.power_status = PowerStatus::Ok;
            }
            Err(e) => {
                warn!("Power {:?} failed: {}", command, e);
                self.power_status = PowerStatus::Degraded { reason: e.to_string() };
            }
        }
    }

    /// The session waiting for a face frame, if any
    pub fn face_capture_wanted(&self) -> Option<SessionId> {
        self.session
            .as_ref()
            .filter(|gate| gate.state() == GateState::AwaitingFace)
            .map(|gate| gate.id())
    }

    pub fn phase(&self) -> Phase {
        self.timer.phase()
    }

    pub fn timer(&self) -> &TimerEngine {
        &self.timer
    }

    pub fn status(&self, now: DateTime<Utc>) -> ControllerStatus {
        ControllerStatus {
            phase: self.timer.phase(),
            elapsed: self.timer.elapsed(),
            remaining: self.timer.remaining(),
            remaining_formatted: self.timer.remaining_formatted(),
            progress_percent: self.timer.progress_percent(),
            snoozes_left: self.timer.snoozes_left(),
            session: self.session.as_ref().map(|gate| gate.view(now)),
            power: self.power_status.clone(),
        }
    }

    fn enter_lock(&mut self, now: DateTime<Utc>) {
        if self.session.as_ref().is_some_and(|g| g.kind() == SessionKind::Break) {
            return;
        }
        if self.cancel_override(now) {
            info!("Override replaced by break session");
        }

        let gate = self.open_gate(SessionKind::Break, now);
        if let Err(e) = self.display.present_lock(&gate.view(now)) {
            warn!("Lock display failed to present: {}", e);
        }
        self.power.dispatch(PowerCommand::Off);
        info!("Break started, session {}", gate.id());
        self.session = Some(gate);
    }

    fn open_gate(&mut self, kind: SessionKind, now: DateTime<Utc>) -> UnlockGate {
        UnlockGate::open_with_budget(
            &self.gate_config,
            Arc::clone(&self.factors),
            kind,
            self.carried_budget.take(),
            now,
        )
    }

    fn after_submission(&mut self, now: DateTime<Utc>) {
        let Some(gate) = self.session.as_ref() else {
            return;
        };
        if gate.is_granted() {
            self.finish(now);
        } else if gate.kind() == SessionKind::Break {
            if let Err(e) = self.display.update_lock(&gate.view(now)) {
                warn!("Lock display update failed: {}", e);
            }
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let Some(gate) = self.session.take() else {
            return;
        };
        if gate.kind() == SessionKind::Break {
            self.power.dispatch(PowerCommand::On);
            if let Err(e) = self.display.dismiss_lock() {
                warn!("Lock display failed to dismiss: {}", e);
            }
        }
        self.timer.reset(now);
        info!("Session {} granted, {:?} complete", gate.id(), gate.kind());
    }

    fn ensure_unlocked(&self, action: &'static str) -> Result<()> {
        if self.session.as_ref().is_some_and(|g| g.kind() == SessionKind::Break) {
            return Err(CoreError::InvalidTransition {
                phase: self.timer.phase(),
                action,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for LockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockController")
            .field("timer", &self.timer)
            .field("session", &self.session)
            .field("power_status", &self.power_status)
            .finish_non_exhaustive()
    }
}

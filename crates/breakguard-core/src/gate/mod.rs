//! Unlock gate
//!
//! One [`UnlockGate`] guards one [`LockSession`]: the TOTP code first, then
//! a face match, drawing failures from a shared attempt budget.
//!
//! ```text
//! AwaitingTotp --code ok--> AwaitingFace --match--> Granted
//!      |                         |
//!      +---- budget spent -------+--> Lockout --cooldown--> AwaitingTotp
//! ```
//!
//! Which factors are required is decided once, when the session opens,
//! from the gate config and what is enrolled.

mod lockout;
mod session;

pub use lockout::{AttemptBudget, AttemptPolicy, BudgetFile};
pub use session::{GateState, LockSession, SessionId, SessionKind, SessionView};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::error::AuthError;
use crate::face::{FaceOutcome, FaceTemplate, FaceVerifier, Frame};
use crate::secret_store::{SecretRecord, SecretStore};
use crate::totp::{AuthSecret, TotpEngine};

/// Enrollment status of one factor
#[derive(Debug, Clone)]
pub enum Enrollment<T> {
    /// Never enrolled
    Missing,
    Ready(T),
    /// Enrolled, but the record could not be read
    Unreadable,
}

impl<T> Enrollment<T> {
    pub fn is_enrolled(&self) -> bool {
        !matches!(self, Enrollment::Missing)
    }

    fn ready(&self) -> Option<&T> {
        match self {
            Enrollment::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Face verifier plus the enrolled template
#[derive(Debug, Clone)]
pub struct FaceFactor {
    pub verifier: FaceVerifier,
    pub template: Enrollment<FaceTemplate>,
}

/// Verification inputs shared by every session
#[derive(Debug, Clone)]
pub struct Factors {
    pub totp: TotpEngine,
    pub secret: Enrollment<AuthSecret>,
    /// `None` when no camera is available
    pub face: Option<FaceFactor>,
}

impl Factors {
    /// Load enrolled factors from the secret store
    ///
    /// A record that exists but cannot be unsealed stays enrolled as
    /// [`Enrollment::Unreadable`] so it can never be satisfied.
    pub fn load(store: &SecretStore, totp: TotpEngine, verifier: Option<FaceVerifier>) -> Self {
        let secret = load_record(store, SecretRecord::TotpSecret);
        let face = verifier.map(|verifier| FaceFactor {
            verifier,
            template: load_record(store, SecretRecord::FaceTemplate),
        });
        Self { totp, secret, face }
    }

    fn totp_active(&self, config: &GateConfig) -> bool {
        config.totp_enabled && self.secret.is_enrolled()
    }

    fn face_active(&self, config: &GateConfig) -> bool {
        config.face_enabled
            && self
                .face
                .as_ref()
                .is_some_and(|face| face.template.is_enrolled())
    }
}

fn load_record<T: serde::de::DeserializeOwned>(store: &SecretStore, record: SecretRecord) -> Enrollment<T> {
    match store.unseal(record) {
        Ok(Some(value)) => Enrollment::Ready(value),
        Ok(None) => Enrollment::Missing,
        Err(e) => {
            warn!("{:?} is enrolled but unreadable: {}", record, e);
            Enrollment::Unreadable
        }
    }
}

/// Verification state machine for one lock session
#[derive(Debug)]
pub struct UnlockGate {
    policy: AttemptPolicy,
    factors: Arc<Factors>,
    session: LockSession,
    state: GateState,
    totp_required: bool,
    face_required: bool,
}

impl UnlockGate {
    /// Open a session, resolving which factors it requires
    ///
    /// If no factor is active the session still starts in `AwaitingTotp`
    /// and any submitted code acknowledges the lock.
    pub fn open(config: &GateConfig, factors: Arc<Factors>, kind: SessionKind, now: DateTime<Utc>) -> Self {
        Self::open_with_budget(config, factors, kind, None, now)
    }

    /// Open a session that inherits what an abandoned one left behind
    pub fn open_with_budget(
        config: &GateConfig,
        factors: Arc<Factors>,
        kind: SessionKind,
        carried: Option<AttemptBudget>,
        now: DateTime<Utc>,
    ) -> Self {
        let policy = AttemptPolicy::from(config);
        let (attempts_remaining, lockout_until) = match carried {
            Some(budget) => budget.resume(&policy, now),
            None => (policy.max_attempts, None),
        };

        let totp_required = factors.totp_active(config);
        let face_required = factors.face_active(config);

        if !totp_required {
            warn!("TOTP factor inactive for this session (enabled: {})", config.totp_enabled);
        }
        if config.face_enabled && !face_required {
            warn!("Face factor inactive for this session (no camera or no enrollment)");
        }

        let session = LockSession {
            id: SessionId::new(),
            kind,
            attempts_remaining,
            totp_passed: !totp_required,
            face_passed: face_required.then_some(false),
            opened_at: now,
        };
        info!("Opened {:?} lock session {}", kind, session.id);

        let mut gate = Self {
            policy,
            factors,
            session,
            state: GateState::AwaitingTotp,
            totp_required,
            face_required,
        };
        gate.state = match lockout_until {
            Some(until) => {
                info!("Session {} inherits a lockout", gate.session.id);
                GateState::Lockout { until }
            }
            None => gate.initial_state(),
        };
        gate.poll(now);
        gate
    }

    /// Attempts and lockout to hand to the next session if this one is
    /// abandoned at `now`
    pub fn budget(&self, now: DateTime<Utc>) -> AttemptBudget {
        AttemptBudget {
            attempts_remaining: self.session.attempts_remaining,
            lockout_until: match self.state {
                GateState::Lockout { until } => Some(until),
                _ => None,
            },
            recorded_at: now,
        }
    }

    /// Submit a TOTP code
    pub fn submit_code(&mut self, code: &str, now: DateTime<Utc>) -> Result<GateState, AuthError> {
        self.poll(now);
        match self.state {
            GateState::AwaitingTotp => {}
            GateState::AwaitingFace => {
                return Err(AuthError::UnexpectedSubmission { expected: "face" })
            }
            other => return Err(self.closed_or_locked(other, now)),
        }

        if !self.totp_required {
            info!("Lock acknowledged for session {} (no factor enrolled)", self.session.id);
            self.session.totp_passed = true;
            self.state = self.after_totp();
            return Ok(self.state);
        }

        let verified = match self.factors.secret.ready() {
            Some(secret) => self.factors.totp.verify(secret, code, now),
            None => Err(AuthError::InvalidCode { attempts_remaining: 0 }),
        };

        match verified {
            Ok(()) => {
                info!("TOTP accepted for session {}", self.session.id);
                self.session.totp_passed = true;
                self.state = self.after_totp();
                Ok(self.state)
            }
            Err(e) => {
                debug!("TOTP rejected: {}", e);
                let attempts_remaining = self.record_failure(now);
                Err(AuthError::InvalidCode { attempts_remaining })
            }
        }
    }

    /// Submit a camera frame for the face factor
    pub fn submit_face(&mut self, frame: &Frame, now: DateTime<Utc>) -> Result<GateState, AuthError> {
        self.poll(now);
        match self.state {
            GateState::AwaitingFace => {}
            GateState::AwaitingTotp => {
                return Err(AuthError::UnexpectedSubmission { expected: "TOTP code" })
            }
            other => return Err(self.closed_or_locked(other, now)),
        }

        let outcome = match &self.factors.face {
            Some(FaceFactor {
                verifier,
                template: Enrollment::Ready(template),
            }) => verifier.verify(frame, template),
            _ => FaceOutcome::NoMatch { score: 0.0 },
        };

        match outcome {
            FaceOutcome::Match { score } => {
                info!("Face matched (score {:.3}) for session {}", score, self.session.id);
                self.session.face_passed = Some(true);
                self.state = GateState::Granted;
                Ok(self.state)
            }
            FaceOutcome::NoFaceDetected => Err(AuthError::NoFaceDetected),
            FaceOutcome::NoMatch { score } => {
                debug!("Face rejected (score {:.3})", score);
                let attempts_remaining = self.record_failure(now);
                Err(AuthError::NoMatch { attempts_remaining })
            }
        }
    }

    /// End an expired lockout; returns the current state
    pub fn poll(&mut self, now: DateTime<Utc>) -> GateState {
        if let GateState::Lockout { until } = self.state {
            if now >= until {
                self.session.attempts_remaining = self.policy.max_attempts;
                self.session.totp_passed = !self.totp_required;
                if self.face_required {
                    self.session.face_passed = Some(false);
                }
                self.state = self.initial_state();
                info!("Lockout ended for session {}", self.session.id);
            }
        }
        self.state
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn session(&self) -> &LockSession {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn kind(&self) -> SessionKind {
        self.session.kind
    }

    pub fn is_granted(&self) -> bool {
        self.state == GateState::Granted && self.session.factors_satisfied()
    }

    /// Display snapshot of the session
    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        let lockout_remaining_secs = match self.state {
            GateState::Lockout { until } => Some(self.policy.remaining_secs(until, now)),
            _ => None,
        };
        let message = match self.state {
            GateState::Granted => "Unlocked".to_string(),
            GateState::AwaitingFace => "Look at the camera".to_string(),
            _ => self
                .policy
                .describe_lockout(self.session.attempts_remaining, lockout_remaining_secs),
        };
        SessionView {
            id: self.session.id,
            kind: self.session.kind,
            state: self.state,
            attempts_remaining: self.session.attempts_remaining,
            totp_required: self.totp_required,
            face_required: self.face_required,
            lockout_remaining_secs,
            message,
        }
    }

    fn initial_state(&self) -> GateState {
        if self.totp_required || !self.face_required {
            GateState::AwaitingTotp
        } else {
            GateState::AwaitingFace
        }
    }

    fn after_totp(&self) -> GateState {
        if self.face_required {
            GateState::AwaitingFace
        } else {
            GateState::Granted
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>) -> u32 {
        self.session.attempts_remaining = self.session.attempts_remaining.saturating_sub(1);
        if self.session.attempts_remaining == 0 {
            let until = self.policy.lockout_until(now);
            warn!(
                "Attempt budget exhausted for session {}, locked out for {}s",
                self.session.id,
                self.policy.cooldown.as_secs()
            );
            self.state = GateState::Lockout { until };
        }
        self.session.attempts_remaining
    }

    fn closed_or_locked(&self, state: GateState, now: DateTime<Utc>) -> AuthError {
        match state {
            GateState::Lockout { until } => AuthError::Lockout {
                remaining_secs: self.policy.remaining_secs(until, now),
            },
            _ => AuthError::SessionClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::{FaceDetector, FaceRegion, FaceVerifierConfig};
    use crate::totp::TotpParams;
    use rstest::rstest;
    use std::time::Duration;

    const SIZE: u32 = 120;

    struct WholeFrame;

    impl FaceDetector for WholeFrame {
        fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
            if frame.width() == 1 {
                return vec![];
            }
            vec![FaceRegion {
                x: 0,
                y: 0,
                width: frame.width(),
                height: frame.height(),
            }]
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn gradient(horizontal: bool) -> Frame {
        let pixels = (0..SIZE * SIZE)
            .map(|i| (if horizontal { i % SIZE } else { i / SIZE }) as u8)
            .collect();
        Frame::new(SIZE, SIZE, pixels).unwrap()
    }

    fn blank() -> Frame {
        Frame::new(1, 1, vec![0]).unwrap()
    }

    fn secret() -> AuthSecret {
        AuthSecret::from_bytes(b"12345678901234567890".as_slice(), TotpParams::default()).unwrap()
    }

    fn factors(with_secret: bool, face: Option<Enrollment<FaceTemplate>>) -> Arc<Factors> {
        let verifier = FaceVerifier::new(Arc::new(WholeFrame), FaceVerifierConfig::default());
        Arc::new(Factors {
            totp: TotpEngine::default(),
            secret: if with_secret {
                Enrollment::Ready(secret())
            } else {
                Enrollment::Missing
            },
            face: face.map(|template| FaceFactor { verifier, template }),
        })
    }

    fn enrolled_face() -> Enrollment<FaceTemplate> {
        let verifier = FaceVerifier::new(Arc::new(WholeFrame), FaceVerifierConfig::default());
        Enrollment::Ready(verifier.enroll(std::iter::repeat(gradient(true)).take(5)).unwrap())
    }

    fn config() -> GateConfig {
        GateConfig::new(3, Duration::from_secs(60), true, true).unwrap()
    }

    fn code(now: DateTime<Utc>) -> String {
        TotpEngine::default().current_code(&secret(), now).unwrap()
    }

    #[test]
    fn test_totp_then_face_grants() {
        let mut gate = UnlockGate::open(&config(), factors(true, Some(enrolled_face())), SessionKind::Break, at(0));
        assert_eq!(gate.state(), GateState::AwaitingTotp);

        assert_eq!(gate.submit_code(&code(at(1)), at(1)), Ok(GateState::AwaitingFace));
        assert_eq!(gate.submit_face(&gradient(true), at(2)), Ok(GateState::Granted));
        assert!(gate.is_granted());

        assert_eq!(gate.submit_code("000000", at(3)), Err(AuthError::SessionClosed));
        assert_eq!(gate.submit_face(&gradient(true), at(3)), Err(AuthError::SessionClosed));
    }

    #[test]
    fn test_face_disabled_grants_after_totp() {
        let config = GateConfig::new(3, Duration::from_secs(60), true, false).unwrap();
        let mut gate = UnlockGate::open(&config, factors(true, Some(enrolled_face())), SessionKind::Break, at(0));

        assert_eq!(gate.submit_code(&code(at(1)), at(1)), Ok(GateState::Granted));
        assert_eq!(gate.session().face_passed, None);
    }

    #[test]
    fn test_no_camera_makes_face_vacuous() {
        let mut gate = UnlockGate::open(&config(), factors(true, None), SessionKind::Break, at(0));
        assert!(!gate.view(at(0)).face_required);
        assert_eq!(gate.submit_code(&code(at(1)), at(1)), Ok(GateState::Granted));
    }

    #[test]
    fn test_lockout_after_budget_and_cooldown_refills() {
        let mut gate = UnlockGate::open(&config(), factors(true, None), SessionKind::Break, at(0));

        assert_eq!(
            gate.submit_code("000000", at(1)),
            Err(AuthError::InvalidCode { attempts_remaining: 2 })
        );
        assert_eq!(
            gate.submit_code("000000", at(2)),
            Err(AuthError::InvalidCode { attempts_remaining: 1 })
        );
        assert_eq!(
            gate.submit_code("000000", at(3)),
            Err(AuthError::InvalidCode { attempts_remaining: 0 })
        );
        assert!(matches!(gate.state(), GateState::Lockout { .. }));

        // Even the right code is refused during a lockout
        assert_eq!(
            gate.submit_code(&code(at(10)), at(10)),
            Err(AuthError::Lockout { remaining_secs: 53 })
        );

        assert_eq!(gate.poll(at(63)), GateState::AwaitingTotp);
        assert_eq!(gate.session().attempts_remaining, 3);
        assert_eq!(gate.submit_code(&code(at(64)), at(64)), Ok(GateState::Granted));
    }

    #[test]
    fn test_reopened_session_inherits_budget() {
        let factors = factors(true, None);
        let mut gate = UnlockGate::open(&config(), factors.clone(), SessionKind::Override, at(0));
        gate.submit_code("000000", at(1)).unwrap_err();
        gate.submit_code("000000", at(2)).unwrap_err();

        let mut reopened =
            UnlockGate::open_with_budget(&config(), factors.clone(), SessionKind::Override, Some(gate.budget(at(3))), at(3));
        assert_eq!(reopened.session().attempts_remaining, 1);
        assert_eq!(
            reopened.submit_code("000000", at(4)),
            Err(AuthError::InvalidCode { attempts_remaining: 0 })
        );

        let mut again =
            UnlockGate::open_with_budget(&config(), factors, SessionKind::Override, Some(reopened.budget(at(5))), at(5));
        assert_eq!(again.state(), GateState::Lockout { until: at(64) });
        assert_eq!(
            again.submit_code(&code(at(6)), at(6)),
            Err(AuthError::Lockout { remaining_secs: 58 })
        );
        assert_eq!(again.poll(at(64)), GateState::AwaitingTotp);
        assert_eq!(again.session().attempts_remaining, 3);
    }

    #[test]
    fn test_no_face_detected_costs_nothing() {
        let mut gate = UnlockGate::open(&config(), factors(true, Some(enrolled_face())), SessionKind::Break, at(0));
        gate.submit_code(&code(at(1)), at(1)).unwrap();

        assert_eq!(gate.submit_face(&blank(), at(2)), Err(AuthError::NoFaceDetected));
        assert_eq!(gate.session().attempts_remaining, 3);

        assert_eq!(
            gate.submit_face(&gradient(false), at(3)),
            Err(AuthError::NoMatch { attempts_remaining: 2 })
        );
    }

    #[test]
    fn test_face_lockout_requires_totp_again() {
        let mut gate = UnlockGate::open(&config(), factors(true, Some(enrolled_face())), SessionKind::Break, at(0));
        gate.submit_code("000000", at(1)).unwrap_err();
        gate.submit_code(&code(at(2)), at(2)).unwrap();

        gate.submit_face(&gradient(false), at(3)).unwrap_err();
        gate.submit_face(&gradient(false), at(4)).unwrap_err();
        assert!(matches!(gate.state(), GateState::Lockout { .. }));

        assert_eq!(gate.poll(at(64)), GateState::AwaitingTotp);
        assert!(!gate.session().totp_passed);
    }

    #[test]
    fn test_unreadable_template_never_matches() {
        let mut gate = UnlockGate::open(
            &config(),
            factors(true, Some(Enrollment::Unreadable)),
            SessionKind::Break,
            at(0),
        );
        gate.submit_code(&code(at(1)), at(1)).unwrap();
        assert!(matches!(
            gate.submit_face(&gradient(true), at(2)),
            Err(AuthError::NoMatch { .. })
        ));
    }

    #[rstest]
    #[case(false, GateState::AwaitingFace)]
    #[case(true, GateState::AwaitingTotp)]
    fn test_initial_state(#[case] with_secret: bool, #[case] expected: GateState) {
        let gate = UnlockGate::open(
            &config(),
            factors(with_secret, Some(enrolled_face())),
            SessionKind::Override,
            at(0),
        );
        assert_eq!(gate.state(), expected);
    }

    #[test]
    fn test_out_of_order_submissions() {
        let mut gate = UnlockGate::open(&config(), factors(true, Some(enrolled_face())), SessionKind::Break, at(0));
        assert_eq!(
            gate.submit_face(&gradient(true), at(1)),
            Err(AuthError::UnexpectedSubmission { expected: "TOTP code" })
        );
        gate.submit_code(&code(at(1)), at(1)).unwrap();
        assert_eq!(
            gate.submit_code(&code(at(2)), at(2)),
            Err(AuthError::UnexpectedSubmission { expected: "face" })
        );
    }

    #[test]
    fn test_nothing_enrolled_needs_acknowledgement() {
        let mut gate = UnlockGate::open(&config(), factors(false, None), SessionKind::Break, at(0));
        assert_eq!(gate.state(), GateState::AwaitingTotp);
        assert_eq!(gate.submit_code("", at(1)), Ok(GateState::Granted));
    }
}

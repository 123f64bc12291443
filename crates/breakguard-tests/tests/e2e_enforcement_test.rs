//! End-to-end enforcement tests for BreakGuard
//!
//! These tests drive the whole core (timer, gate, controller, secret store)
//! headlessly with a manual clock, and the daemon's enforcer task with a
//! fake camera.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use breakguard_core::{
    AuthError, AuthSecret, Clock, CollaboratorError, CoreError, FaceDetector, FaceRegion,
    FaceVerifier, FaceVerifierConfig, Factors, Frame, FrameSource, GateConfig, GateState,
    LockController, LockDisplay, ManualClock, NoPowerSwitch, Notifier, Phase, SecretRecord,
    SecretStore, SessionView, StateFile, TimerConfig, TimerEngine, TimerEvent, TotpEngine,
};
use breakguard_daemon::Enforcer;
use tempfile::{tempdir, TempDir};

// ==========================================
// Fixtures
// ==========================================

const FRAME_SIZE: u32 = 160;

/// Treats every non-blank frame as one full-frame face
struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&self, frame: &Frame) -> Vec<FaceRegion> {
        if frame.width() < FRAME_SIZE {
            return Vec::new();
        }
        vec![FaceRegion {
            x: 0,
            y: 0,
            width: frame.width(),
            height: frame.height(),
        }]
    }
}

fn user_face() -> Frame {
    let pixels = (0..FRAME_SIZE * FRAME_SIZE)
        .map(|i| ((i % FRAME_SIZE) + (i / FRAME_SIZE) / 4) as u8)
        .collect();
    Frame::new(FRAME_SIZE, FRAME_SIZE, pixels).unwrap()
}

fn stranger_face() -> Frame {
    let pixels = (0..FRAME_SIZE * FRAME_SIZE)
        .map(|i| (i / FRAME_SIZE) as u8)
        .collect();
    Frame::new(FRAME_SIZE, FRAME_SIZE, pixels).unwrap()
}

fn empty_room() -> Frame {
    Frame::new(8, 8, vec![0; 64]).unwrap()
}

#[derive(Default)]
struct Surfaces {
    log: Mutex<Vec<String>>,
}

impl Surfaces {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl LockDisplay for Surfaces {
    fn present_lock(&self, session: &SessionView) -> Result<(), CollaboratorError> {
        self.log.lock().unwrap().push(format!("present {:?}", session.state));
        Ok(())
    }

    fn dismiss_lock(&self) -> Result<(), CollaboratorError> {
        self.log.lock().unwrap().push("dismiss".to_string());
        Ok(())
    }
}

impl Notifier for Surfaces {
    fn notify_warning(&self, remaining: Duration) -> Result<(), CollaboratorError> {
        self.log.lock().unwrap().push(format!("warning {}s", remaining.as_secs()));
        Ok(())
    }
}

/// A workstation with TOTP and a face enrolled
struct Workstation {
    dir: TempDir,
    store: SecretStore,
    secret: AuthSecret,
    verifier: FaceVerifier,
}

impl Workstation {
    fn enrolled() -> Self {
        let dir = tempdir().unwrap();
        let store = SecretStore::open(dir.path().join("secrets")).unwrap();

        TotpEngine::default().enroll(&store).unwrap();
        let secret: AuthSecret = store.unseal(SecretRecord::TotpSecret).unwrap().unwrap();

        let verifier = FaceVerifier::new(Arc::new(FullFrameDetector), FaceVerifierConfig::default());
        let captures = (0..12).map(|i| if i % 2 == 0 { user_face() } else { empty_room() });
        let template = verifier.enroll(captures).unwrap();
        store.seal(SecretRecord::FaceTemplate, &template).unwrap();

        Self {
            dir,
            store,
            secret,
            verifier,
        }
    }

    fn factors(&self) -> Arc<Factors> {
        Arc::new(Factors::load(&self.store, TotpEngine::default(), Some(self.verifier.clone())))
    }

    fn timer(&self, config: TimerConfig, clock: &ManualClock) -> TimerEngine {
        TimerEngine::recover(config, StateFile::new(self.dir.path()), clock.now())
    }

    fn code(&self, clock: &ManualClock) -> String {
        TotpEngine::default().current_code(&self.secret, clock.now()).unwrap()
    }

    fn controller(&self, config: TimerConfig, clock: &ManualClock, surfaces: &Arc<Surfaces>) -> LockController {
        LockController::start(
            self.timer(config, clock),
            self.factors(),
            GateConfig::default(),
            surfaces.clone(),
            surfaces.clone(),
            Arc::new(NoPowerSwitch),
            clock.now(),
        )
    }
}

fn one_minute_cycle() -> TimerConfig {
    TimerConfig::new(Duration::from_secs(60), Duration::from_secs(10)).unwrap()
}

fn auth_error(err: CoreError) -> AuthError {
    err.as_auth().cloned().expect("auth error")
}

// ==========================================
// Scenarios
// ==========================================

#[test]
fn test_full_break_cycle() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    // ==========================================
    // STEP 1: Work until the warning
    // ==========================================
    clock.advance(Duration::from_secs(50));
    let events = controller.tick(clock.now());
    assert_eq!(
        events,
        vec![TimerEvent::Warning {
            remaining: Duration::from_secs(10)
        }]
    );
    assert_eq!(controller.phase(), Phase::Warned);

    // ==========================================
    // STEP 2: The break is enforced
    // ==========================================
    clock.advance(Duration::from_secs(11));
    assert_eq!(controller.tick(clock.now()), vec![TimerEvent::LockDue]);
    assert_eq!(controller.phase(), Phase::Locked);
    assert_eq!(surfaces.log(), vec!["warning 10s", "present AwaitingTotp"]);

    // ==========================================
    // STEP 3: TOTP, then face
    // ==========================================
    clock.advance(Duration::from_secs(120));
    let code = station.code(&clock);
    assert_eq!(controller.submit_code(&code, clock.now()).unwrap(), GateState::AwaitingFace);

    let session = controller.face_capture_wanted().expect("face capture wanted");
    assert_eq!(
        controller.submit_face(session, &user_face(), clock.now()).unwrap(),
        GateState::Granted
    );

    // ==========================================
    // STEP 4: A fresh cycle
    // ==========================================
    assert_eq!(controller.phase(), Phase::Working);
    assert_eq!(controller.timer().elapsed(), Duration::ZERO);
    assert!(controller.face_capture_wanted().is_none());
    assert_eq!(surfaces.log().last().map(String::as_str), Some("dismiss"));
}

#[test]
fn test_failed_attempts_lock_out_then_recover() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    clock.advance(Duration::from_secs(61));
    controller.tick(clock.now());

    for remaining in (0..5).rev() {
        let err = controller.submit_code("000000", clock.now()).unwrap_err();
        assert_eq!(auth_error(err), AuthError::InvalidCode { attempts_remaining: remaining });
    }

    // The correct code is refused while locked out
    let code = station.code(&clock);
    let err = controller.submit_code(&code, clock.now()).unwrap_err();
    assert!(matches!(auth_error(err), AuthError::Lockout { .. }));

    clock.advance(Duration::from_secs(60));
    controller.tick(clock.now());
    let view = controller.status(clock.now()).session.unwrap();
    assert_eq!(view.state, GateState::AwaitingTotp);
    assert_eq!(view.attempts_remaining, 5);

    let code = station.code(&clock);
    assert_eq!(controller.submit_code(&code, clock.now()).unwrap(), GateState::AwaitingFace);
}

#[test]
fn test_face_failures_share_the_budget() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    clock.advance(Duration::from_secs(61));
    controller.tick(clock.now());
    controller.submit_code("000000", clock.now()).unwrap_err();
    controller.submit_code(&station.code(&clock), clock.now()).unwrap();
    let session = controller.face_capture_wanted().unwrap();

    // No face in view is free
    let err = controller.submit_face(session, &empty_room(), clock.now()).unwrap_err();
    assert_eq!(auth_error(err), AuthError::NoFaceDetected);

    let err = controller.submit_face(session, &stranger_face(), clock.now()).unwrap_err();
    assert_eq!(auth_error(err), AuthError::NoMatch { attempts_remaining: 3 });
    assert_eq!(controller.phase(), Phase::Locked);
}

#[test]
fn test_stale_frames_are_rejected() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    // First break, fully unlocked
    clock.advance(Duration::from_secs(61));
    controller.tick(clock.now());
    controller.submit_code(&station.code(&clock), clock.now()).unwrap();
    let old_session = controller.face_capture_wanted().unwrap();
    controller.submit_face(old_session, &user_face(), clock.now()).unwrap();

    // Second break; a frame captured for the first one arrives late
    clock.advance(Duration::from_secs(61));
    controller.tick(clock.now());
    let err = controller.submit_face(old_session, &user_face(), clock.now()).unwrap_err();
    assert_eq!(auth_error(err), AuthError::StaleSession);
    assert_eq!(controller.phase(), Phase::Locked);
}

#[test]
fn test_reboot_mid_work_counts_downtime() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let config = TimerConfig::new(Duration::from_secs(3600), Duration::from_secs(300)).unwrap();
    {
        let mut timer = station.timer(config, &clock);
        clock.advance(Duration::from_secs(120));
        timer.tick(clock.now());
    }

    // Ten minutes powered off
    clock.advance(Duration::from_secs(600));
    let mut timer = station.timer(config, &clock);
    timer.tick(clock.now());
    assert_eq!(timer.elapsed(), Duration::from_secs(720));
    assert_eq!(timer.phase(), Phase::Working);
}

#[test]
fn test_reboot_during_break_stays_locked() {
    let station = Workstation::enrolled();
    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    {
        let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);
        clock.advance(Duration::from_secs(61));
        controller.tick(clock.now());
    }

    clock.advance(Duration::from_secs(3600));
    let restarted = Arc::new(Surfaces::default());
    let controller = station.controller(one_minute_cycle(), &clock, &restarted);
    assert_eq!(controller.phase(), Phase::Locked);
    assert_eq!(restarted.log(), vec!["present AwaitingTotp"]);
}

#[test]
fn test_corrupt_face_template_never_matches() {
    let station = Workstation::enrolled();
    std::fs::write(station.dir.path().join("secrets").join("face.enc"), b"tampered").unwrap();

    let clock = ManualClock::at_unix(1_700_000_000);
    let surfaces = Arc::new(Surfaces::default());
    let mut controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    clock.advance(Duration::from_secs(61));
    controller.tick(clock.now());
    controller.submit_code(&station.code(&clock), clock.now()).unwrap();
    let session = controller.face_capture_wanted().expect("face factor stays active");

    let err = controller.submit_face(session, &user_face(), clock.now()).unwrap_err();
    assert!(matches!(auth_error(err), AuthError::NoMatch { .. }));
}

// ==========================================
// Enforcer task
// ==========================================

struct FakeCamera;

#[async_trait]
impl FrameSource for FakeCamera {
    async fn capture(&self) -> Result<Frame, CollaboratorError> {
        Ok(user_face())
    }
}

#[tokio::test]
async fn test_enforcer_unlocks_with_camera_capture() {
    let station = Workstation::enrolled();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let surfaces = Arc::new(Surfaces::default());
    let controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    let (sender, commands) = breakguard_daemon::service::channel();
    let enforcer = Enforcer::new(controller, clock.clone(), Some(Arc::new(FakeCamera)), sender, commands)
        .with_tick_interval(Duration::from_millis(10));
    let handle = enforcer.handle();
    let task = tokio::spawn(enforcer.run());

    clock.advance(Duration::from_secs(61));
    let locked = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.status().await.unwrap().phase == Phase::Locked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(locked.is_ok(), "break was never enforced");

    let code = station.code(&clock);
    assert_eq!(handle.submit_code(code).await.unwrap(), GateState::AwaitingFace);

    // The capture task supplies the face
    let unlocked = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.status().await.unwrap().phase == Phase::Working {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(unlocked.is_ok(), "camera capture never unlocked the session");

    handle.shutdown().await.unwrap();
    let controller = task.await.unwrap();
    assert_eq!(controller.timer().elapsed(), Duration::ZERO);
    assert_eq!(surfaces.log().last().map(String::as_str), Some("dismiss"));
}

#[tokio::test]
async fn test_enforcer_rejects_pause_during_break() {
    let station = Workstation::enrolled();
    let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
    let surfaces = Arc::new(Surfaces::default());
    let controller = station.controller(one_minute_cycle(), &clock, &surfaces);

    let (sender, commands) = breakguard_daemon::service::channel();
    let enforcer = Enforcer::new(controller, clock.clone(), None, sender, commands);
    let handle = enforcer.handle();
    let task = tokio::spawn(enforcer.run());

    handle.pause().await.unwrap();
    handle.resume().await.unwrap();

    clock.advance(Duration::from_secs(61));
    assert!(handle.pause().await.is_err());
    assert_eq!(handle.status().await.unwrap().phase, Phase::Locked);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

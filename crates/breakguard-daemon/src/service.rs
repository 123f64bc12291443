//! Enforcement loop
//!
//! The [`Enforcer`] task owns the [`LockController`]. Every mutation
//! arrives as a [`Command`] on one channel or as a timer tick, so state
//! changes are serialized. Camera capture and power calls run on their own
//! tasks and report back through the same channel.

use std::sync::Arc;
use std::time::Duration;

use breakguard_core::{
    Clock, ControllerStatus, CoreError, FrameSource, Frame, GateState, LockController, PowerCommand,
    PowerError, SessionId, SessionView,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// Default tick cadence
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between frames while a session waits for a face
pub const CAPTURE_INTERVAL: Duration = Duration::from_secs(1);

const CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<std::result::Result<T, CoreError>>;

/// Messages handled by the enforcer task
#[derive(Debug)]
pub enum Command {
    SubmitCode {
        code: String,
        reply: Reply<GateState>,
    },
    SubmitFace {
        session: SessionId,
        frame: Frame,
        reply: Option<Reply<GateState>>,
    },
    BeginOverride {
        reply: Reply<SessionView>,
    },
    CancelOverride {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Snooze {
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    PowerResult {
        command: PowerCommand,
        result: std::result::Result<(), PowerError>,
    },
    Shutdown,
}

/// Create the command channel shared by the enforcer and its workers
pub fn channel() -> (mpsc::Sender<Command>, mpsc::Receiver<Command>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Owner of the controller and its background work
pub struct Enforcer {
    controller: LockController,
    clock: Arc<dyn Clock>,
    camera: Option<Arc<dyn FrameSource>>,
    tick_interval: Duration,
    sender: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    capture: Option<(SessionId, JoinHandle<()>)>,
}

impl Enforcer {
    pub fn new(
        controller: LockController,
        clock: Arc<dyn Clock>,
        camera: Option<Arc<dyn FrameSource>>,
        sender: mpsc::Sender<Command>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            controller,
            clock,
            camera,
            tick_interval: TICK_INTERVAL,
            sender,
            commands,
            capture: None,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Handle for submitting commands
    pub fn handle(&self) -> EnforcerHandle {
        EnforcerHandle {
            sender: self.sender.clone(),
        }
    }

    /// Run until shutdown; returns the controller for inspection
    pub async fn run(mut self) -> LockController {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Enforcer running (tick every {:?})", self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    self.controller.tick(now);
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle_command(command),
                },
            }
            self.sync_capture();
        }

        self.stop_capture();
        info!("Enforcer stopped");
        self.controller
    }

    fn handle_command(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::SubmitCode { code, reply } => {
                let _ = reply.send(self.controller.submit_code(&code, now));
            }
            Command::SubmitFace { session, frame, reply } => {
                let result = self.controller.submit_face(session, &frame, now);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!("Captured frame rejected: {}", e);
                        }
                    }
                }
            }
            Command::BeginOverride { reply } => {
                let _ = reply.send(self.controller.begin_override(now));
            }
            Command::CancelOverride { reply } => {
                let _ = reply.send(self.controller.cancel_override(now));
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.controller.pause(now));
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.controller.resume(now));
            }
            Command::Snooze { reply } => {
                let _ = reply.send(self.controller.snooze(now));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.controller.status(now));
            }
            Command::PowerResult { command, result } => {
                self.controller.record_power_result(command, result);
            }
            Command::Shutdown => {}
        }
    }

    /// Keep exactly one capture task alive for the session awaiting a face
    fn sync_capture(&mut self) {
        let wanted = self.controller.face_capture_wanted();
        let current = self.capture.as_ref().map(|(id, _)| *id);
        if wanted == current {
            return;
        }

        self.stop_capture();
        let (Some(session), Some(camera)) = (wanted, self.camera.clone()) else {
            return;
        };

        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            loop {
                match camera.capture().await {
                    Ok(frame) => {
                        let command = Command::SubmitFace {
                            session,
                            frame,
                            reply: None,
                        };
                        if sender.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Camera capture failed: {}", e),
                }
                tokio::time::sleep(CAPTURE_INTERVAL).await;
            }
        });
        debug!("Started face capture for session {}", session);
        self.capture = Some((session, task));
    }

    fn stop_capture(&mut self) {
        if let Some((session, task)) = self.capture.take() {
            task.abort();
            debug!("Stopped face capture for session {}", session);
        }
    }
}

/// Cloneable client of a running [`Enforcer`]
#[derive(Debug, Clone)]
pub struct EnforcerHandle {
    sender: mpsc::Sender<Command>,
}

impl EnforcerHandle {
    pub async fn submit_code(&self, code: impl Into<String>) -> Result<GateState> {
        let code = code.into();
        self.request(|reply| Command::SubmitCode { code, reply }).await?.map_err(Into::into)
    }

    pub async fn submit_face(&self, session: SessionId, frame: Frame) -> Result<GateState> {
        self.request(|reply| Command::SubmitFace {
            session,
            frame,
            reply: Some(reply),
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn begin_override(&self) -> Result<SessionView> {
        self.request(|reply| Command::BeginOverride { reply }).await?.map_err(Into::into)
    }

    pub async fn cancel_override(&self) -> Result<bool> {
        self.request(|reply| Command::CancelOverride { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await?.map_err(Into::into)
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await?.map_err(Into::into)
    }

    pub async fn snooze(&self) -> Result<()> {
        self.request(|reply| Command::Snooze { reply }).await?.map_err(Into::into)
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(Command::Shutdown)
            .await
            .map_err(|_| DaemonError::EnforcerStopped)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| DaemonError::EnforcerStopped)?;
        response.await.map_err(|_| DaemonError::EnforcerStopped)
    }
}

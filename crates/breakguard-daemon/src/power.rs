//! Monitor power dispatch
//!
//! Power commands run on a worker task, one at a time and in order, each
//! bounded by the configured timeout and retried once. Outcomes go back to
//! the enforcer as [`Command::PowerResult`] so only the status indicator
//! changes; locking never waits on the monitor.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use breakguard_core::{CollaboratorError, DeviceRef, PowerCommand, PowerDispatch, PowerError, PowerSwitch};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::service::Command;

/// Environment variable carrying the switch's access token
pub const POWER_TOKEN_ENV: &str = "BREAKGUARD_POWER_TOKEN";

/// Switch driven by an external program: `<program> off|on <device>`
///
/// A token, if set, is passed in [`POWER_TOKEN_ENV`] so it never shows up
/// in the process list.
#[derive(Clone)]
pub struct CommandSwitch {
    program: PathBuf,
    token: Option<Zeroizing<String>>,
}

impl CommandSwitch {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(|token| Zeroizing::new(token.to_string()));
        self
    }

    async fn run(&self, action: &str, device: &DeviceRef) -> Result<(), PowerError> {
        let mut command = tokio::process::Command::new(&self.program);
        command.arg(action).arg(device.as_str()).kill_on_drop(true);
        match &self.token {
            Some(token) => command.env(POWER_TOKEN_ENV, token.as_str()),
            None => command.env_remove(POWER_TOKEN_ENV),
        };

        let status = command
            .status()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::Failed(format!("{:?} {} exited with {}", self.program, action, status)))
        }
    }
}

impl fmt::Debug for CommandSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSwitch")
            .field("program", &self.program)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl PowerSwitch for CommandSwitch {
    async fn power_off(&self, device: &DeviceRef) -> Result<(), PowerError> {
        self.run("off", device).await
    }

    async fn power_on(&self, device: &DeviceRef) -> Result<(), PowerError> {
        self.run("on", device).await
    }
}

/// Run `command` with a timeout, retrying once on failure
pub async fn call_with_retry(
    switch: &dyn PowerSwitch,
    device: &DeviceRef,
    command: PowerCommand,
    timeout: Duration,
) -> Result<(), PowerError> {
    match attempt(switch, device, command, timeout).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Power {:?} failed ({}), retrying once", command, e);
            attempt(switch, device, command, timeout).await
        }
    }
}

async fn attempt(
    switch: &dyn PowerSwitch,
    device: &DeviceRef,
    command: PowerCommand,
    timeout: Duration,
) -> Result<(), PowerError> {
    tokio::time::timeout(timeout, command.apply(switch, device))
        .await
        .map_err(|_| CollaboratorError::Timeout)?
}

/// [`PowerDispatch`] backed by a tokio worker task
#[derive(Debug, Clone)]
pub struct TokioPowerDispatch {
    queue: mpsc::UnboundedSender<PowerCommand>,
}

impl TokioPowerDispatch {
    /// Start the worker; must be called inside a tokio runtime
    pub fn spawn(
        switch: Arc<dyn PowerSwitch>,
        device: DeviceRef,
        timeout: Duration,
        results: mpsc::Sender<Command>,
    ) -> Self {
        let (queue, mut commands) = mpsc::unbounded_channel::<PowerCommand>();

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let result = call_with_retry(switch.as_ref(), &device, command, timeout).await;
                if results.send(Command::PowerResult { command, result }).await.is_err() {
                    debug!("Enforcer gone, stopping power worker");
                    break;
                }
            }
        });

        Self { queue }
    }
}

impl PowerDispatch for TokioPowerDispatch {
    fn dispatch(&self, command: PowerCommand) {
        if self.queue.send(command).is_err() {
            warn!("Power worker stopped, dropping {:?}", command);
        }
    }
}

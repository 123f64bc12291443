//! Line-oriented control console on stdin

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use breakguard_core::{ControllerStatus, GateState, PowerStatus};

use crate::error::{DaemonError, Result};
use crate::service::EnforcerHandle;

const HELP: &str = "commands: code <digits> | override | cancel | pause | resume | snooze | status | help";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Code(String),
    Override,
    Cancel,
    Pause,
    Resume,
    Snooze,
    Status,
    Help,
}

/// Parse one input line; `None` for anything unrecognized
pub fn parse(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let command = match word.to_ascii_lowercase().as_str() {
        "code" | "c" => ConsoleCommand::Code(rest.trim().to_string()),
        "override" | "skip" => ConsoleCommand::Override,
        "cancel" => ConsoleCommand::Cancel,
        "pause" => ConsoleCommand::Pause,
        "resume" => ConsoleCommand::Resume,
        "snooze" => ConsoleCommand::Snooze,
        "status" | "s" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        _ => return None,
    };
    Some(command)
}

/// Read commands from stdin until EOF or the enforcer stops
pub async fn run(handle: EnforcerHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = parse(&line) else {
            println!("Unknown command. {}", HELP);
            continue;
        };
        match execute(&handle, command).await {
            Ok(output) => println!("{}", output),
            Err(DaemonError::EnforcerStopped) => break,
            Err(e) => println!("{}", e),
        }
    }
    debug!("Console closed");
    Ok(())
}

async fn execute(handle: &EnforcerHandle, command: ConsoleCommand) -> Result<String> {
    let output = match command {
        ConsoleCommand::Code(code) => match handle.submit_code(code).await? {
            GateState::Granted => "Unlocked.".to_string(),
            GateState::AwaitingFace => "Code accepted. Look at the camera.".to_string(),
            other => format!("{:?}", other),
        },
        ConsoleCommand::Override => {
            let view = handle.begin_override().await?;
            format!("Override started: {}. Enter `code <digits>` to reset the timer.", view.message)
        }
        ConsoleCommand::Cancel => {
            if handle.cancel_override().await? {
                "Override cancelled.".to_string()
            } else {
                "No override to cancel.".to_string()
            }
        }
        ConsoleCommand::Pause => {
            handle.pause().await?;
            "Timer paused.".to_string()
        }
        ConsoleCommand::Resume => {
            handle.resume().await?;
            "Timer resumed.".to_string()
        }
        ConsoleCommand::Snooze => {
            handle.snooze().await?;
            "Break snoozed.".to_string()
        }
        ConsoleCommand::Status => format_status(&handle.status().await?),
        ConsoleCommand::Help => HELP.to_string(),
    };
    Ok(output)
}

/// One-line status summary
pub fn format_status(status: &ControllerStatus) -> String {
    let mut line = format!(
        "{:?}: {} left ({:.0}% of cycle), {} snooze(s) left",
        status.phase, status.remaining_formatted, status.progress_percent, status.snoozes_left
    );
    if let Some(session) = &status.session {
        line.push_str(&format!(", {:?} session {:?}: {}", session.kind, session.state, session.message));
    }
    if let PowerStatus::Degraded { reason } = &status.power {
        line.push_str(&format!(", monitor power degraded: {}", reason));
    }
    line
}

//! Terminal stand-ins for the lock screen and notifications

use std::time::Duration;

use breakguard_core::{CollaboratorError, GateState, LockDisplay, Notifier, SessionView};
use tracing::info;

/// Lock "screen" rendered as log lines and console prompts
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleDisplay;

impl ConsoleDisplay {
    fn prompt(session: &SessionView) -> String {
        match session.state {
            GateState::AwaitingTotp if session.totp_required => {
                format!("Enter your authenticator code: code <digits> ({})", session.message)
            }
            GateState::AwaitingTotp => "Break time. Type `code` to acknowledge.".to_string(),
            GateState::AwaitingFace => "Look at the camera to finish unlocking.".to_string(),
            GateState::Lockout { .. } => session.message.clone(),
            GateState::Granted => "Unlocked.".to_string(),
        }
    }
}

impl LockDisplay for ConsoleDisplay {
    fn present_lock(&self, session: &SessionView) -> Result<(), CollaboratorError> {
        info!("Screen locked for break (session {})", session.id);
        println!("=== BREAK TIME ===");
        println!("{}", Self::prompt(session));
        Ok(())
    }

    fn update_lock(&self, session: &SessionView) -> Result<(), CollaboratorError> {
        println!("{}", Self::prompt(session));
        Ok(())
    }

    fn dismiss_lock(&self) -> Result<(), CollaboratorError> {
        info!("Lock dismissed");
        println!("=== Welcome back ===");
        Ok(())
    }
}

/// Break warnings written to the console
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify_warning(&self, remaining: Duration) -> Result<(), CollaboratorError> {
        let secs = remaining.as_secs();
        println!("Break in {}:{:02} - save your work", secs / 60, secs % 60);
        Ok(())
    }
}

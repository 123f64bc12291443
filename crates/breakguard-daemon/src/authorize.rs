//! Code check for one-shot maintenance commands
//!
//! Each command run is a fresh process, so the attempt budget lives in a
//! [`BudgetFile`] and rerunning the command resumes it instead of starting
//! over.

use std::sync::Arc;

use breakguard_core::{
    AttemptBudget, AuthError, BudgetFile, Clock, Factors, GateConfig, SessionKind, UnlockGate,
};
use tracing::{info, warn};

use crate::error::Result;

/// Prompt for codes until the gate grants or locks out
///
/// `read_code` receives the rejection of the previous code, if any. An
/// unreadable budget file counts as a spent budget.
pub fn authorize(
    gate_config: &GateConfig,
    factors: Arc<Factors>,
    budget: &BudgetFile,
    clock: &dyn Clock,
    mut read_code: impl FnMut(Option<&AuthError>) -> Result<String>,
) -> Result<()> {
    let carried = match budget.load() {
        Ok(carried) => carried,
        Err(e) => {
            warn!("Attempt budget unreadable, treating it as spent: {}", e);
            Some(AttemptBudget::exhausted(clock.now()))
        }
    };
    let mut gate = UnlockGate::open_with_budget(gate_config, factors, SessionKind::Override, carried, clock.now());

    let mut rejected = None;
    while !gate.is_granted() {
        let now = clock.now();
        if let Some(remaining_secs) = gate.view(now).lockout_remaining_secs {
            budget.save(&gate.budget(now))?;
            return Err(AuthError::Lockout { remaining_secs }.into());
        }

        let code = read_code(rejected.as_ref())?;
        let now = clock.now();
        match gate.submit_code(&code, now) {
            Ok(_) => rejected = None,
            Err(e) => {
                budget.save(&gate.budget(now))?;
                rejected = Some(e);
            }
        }
    }

    budget.clear()?;
    info!("Maintenance command authorized");
    Ok(())
}

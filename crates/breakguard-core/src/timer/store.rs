//! Timer state file and lock marker

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::state::{Phase, TimerState};
use crate::error::PersistenceError;
use crate::fsutil::{remove_if_exists, write_atomic};

const STATE_FILE_NAME: &str = "timer_state.json";
const LOCK_MARKER_NAME: &str = "locked.marker";

/// The persisted [`TimerState`] plus a marker that outlives it
///
/// The marker is written before any `Locked` state and removed only after
/// a non-locked state has been saved, so a lost or damaged state file can
/// still tell whether the last known phase was `Locked`.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    marker: PathBuf,
}

impl StateFile {
    /// State file in `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(STATE_FILE_NAME),
            marker: dir.join(LOCK_MARKER_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state; `Ok(None)` when nothing was ever saved
    pub fn load(&self) -> Result<Option<TimerState>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path)?;
        let state: TimerState = serde_json::from_slice(&data).map_err(|e| self.corrupt(e.to_string()))?;
        state.validate().map_err(|reason| self.corrupt(reason))?;
        Ok(Some(state))
    }

    /// Atomically replace the saved state
    pub fn save(&self, state: &TimerState) -> Result<(), PersistenceError> {
        let locked = state.phase == Phase::Locked;
        if locked {
            write_atomic(&self.marker, b"locked\n", false)?;
        }

        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &json, false)?;

        if !locked {
            remove_if_exists(&self.marker)?;
        }
        debug!("Saved timer state ({:?}, {}s elapsed)", state.phase, state.elapsed.as_secs());
        Ok(())
    }

    /// Whether the last known phase was `Locked`
    pub fn has_lock_marker(&self) -> bool {
        self.marker.exists()
    }

    fn corrupt(&self, reason: String) -> PersistenceError {
        PersistenceError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

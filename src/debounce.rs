use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};

/// Trailing-edge debounce for one memo.
///
/// Holds at most one armed deadline. A new edit replaces it instead of queueing
/// a second save, and while a save is in flight the next deadline is parked in
/// `Saving` until [Debouncer::complete] is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    PendingSave { deadline: Instant },
    Saving { rearm_at: Option<Instant> },
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    quiet: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            state: DebounceState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &DebounceState {
        &self.state
    }

    pub fn is_saving(&self) -> bool {
        matches!(self.state, DebounceState::Saving { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, DebounceState::PendingSave { .. })
    }

    /// An edit arrived while the current save was in flight.
    pub fn has_parked_rearm(&self) -> bool {
        matches!(self.state, DebounceState::Saving { rearm_at: Some(_) })
    }

    /// When the loop has to wake up next, if a save is armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::PendingSave { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// An edit happened at `now`: (re-)arm the quiet window.
    pub fn touch(&mut self, now: Instant) {
        let deadline = now + self.quiet;
        self.state = match self.state {
            DebounceState::Idle | DebounceState::PendingSave { .. } => {
                DebounceState::PendingSave { deadline }
            }
            // Picked up once the in-flight save returns.
            DebounceState::Saving { .. } => DebounceState::Saving {
                rearm_at: Some(deadline),
            },
        };
        trace!("debounce re-armed: {:?}", self.state);
    }

    /// Moves to `Saving` and returns true if the armed deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::PendingSave { deadline } if deadline <= now => {
                self.state = DebounceState::Saving { rearm_at: None };
                true
            }
            _ => false,
        }
    }

    /// Skips the quiet window. Does nothing while a save is in flight.
    pub fn fire_now(&mut self) -> bool {
        match self.state {
            DebounceState::Saving { .. } => false,
            DebounceState::Idle | DebounceState::PendingSave { .. } => {
                self.state = DebounceState::Saving { rearm_at: None };
                true
            }
        }
    }

    /// Drops the armed timer. An in-flight save keeps running but will not re-arm.
    pub fn cancel(&mut self) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::PendingSave { .. } => DebounceState::Idle,
            DebounceState::Saving { .. } => DebounceState::Saving { rearm_at: None },
        };
    }

    /// Forgets everything, including an in-flight save whose result no longer applies.
    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
    }

    /// The in-flight save finished, successfully or not.
    pub fn complete(&mut self) {
        self.state = match self.state {
            DebounceState::Saving {
                rearm_at: Some(deadline),
            } => DebounceState::PendingSave { deadline },
            DebounceState::Saving { rearm_at: None } => DebounceState::Idle,
            ref other => {
                warn!("Debouncer completed a save while in state {other:?} - This shouldn't happen");
                other.clone()
            }
        };
    }
}

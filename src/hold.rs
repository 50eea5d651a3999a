//! Commit-hold gate: the back-pressure point between the memory guard and
//! writer threads.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{
    error::ResourceError,
    observability::log_debug,
    time::Clock,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct HoldState {
    held: bool,
    held_since_ms: u64,
}

/// Gate that pauses writer commits while aggregate memory usage is above the
/// ceiling. Only the memory guard drives transitions.
pub(crate) struct CommitHold {
    state: Mutex<HoldState>,
    released: Condvar,
    clock: Clock,
}

impl CommitHold {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            state: Mutex::new(HoldState {
                held: false,
                held_since_ms: 0,
            }),
            released: Condvar::new(),
            clock,
        }
    }

    /// Engage or release the hold. No-op when the state already matches.
    pub(crate) fn set(&self, hold: bool) {
        let mut state = self.state.lock();
        if state.held == hold {
            return;
        }
        state.held = hold;
        if hold {
            state.held_since_ms = self.clock.now_millis();
        } else {
            let held_secs =
                (self.clock.now_millis() - state.held_since_ms) as f64 / 1000.0;
            log_debug!(
                component = "hold",
                event = "commits_released",
                held_secs,
            );
            self.released.notify_all();
        }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().held
    }

    /// Block the calling writer until commits are enabled, failing once
    /// `rpc_timeout` has elapsed with the hold still engaged.
    pub(crate) fn wait_until_commits_enabled(
        &self,
        rpc_timeout: Duration,
    ) -> Result<(), ResourceError> {
        let start = self.clock.now_millis();
        let deadline = start + rpc_timeout.as_millis() as u64;
        let mut state = self.state.lock();
        while state.held {
            if self.clock.now_millis() > deadline {
                return Err(ResourceError::HoldTimeout {
                    held_ms: self.clock.now_millis() - start,
                });
            }
            // Spurious wakeups re-check the condition above.
            let _ = self.released.wait_for(&mut state, POLL_INTERVAL);
        }
        Ok(())
    }

    /// How long commits have currently been held; zero when not held.
    pub(crate) fn hold_time(&self) -> Duration {
        let state = self.state.lock();
        if !state.held {
            return Duration::ZERO;
        }
        Duration::from_millis(self.clock.now_millis() - state.held_since_ms)
    }
}

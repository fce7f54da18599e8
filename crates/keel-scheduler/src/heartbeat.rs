//! Liveness tracking of the offer-source session.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use keel_core::SessionId;

/// Observes heartbeats of the active driver session.
pub trait HeartbeatMonitor: Send + Sync {
    /// Starts monitoring `session`, replacing any previous session.
    fn activate(&self, session: &SessionId);

    /// Stops monitoring `session`. A session that is no longer active is
    /// ignored.
    fn deactivate(&self, session: &SessionId);
}

/// Liveness of the monitored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No session is monitored.
    Inactive,
    /// The last heartbeat is recent enough.
    Alive {
        /// Time of the last heartbeat (or activation).
        last_seen: DateTime<Utc>,
    },
    /// Too many heartbeat intervals elapsed without a heartbeat.
    Missed {
        /// Number of whole intervals missed.
        missed: u32,
    },
}

#[derive(Debug)]
struct ActiveSession {
    session: SessionId,
    last_seen: DateTime<Utc>,
}

/// [`HeartbeatMonitor`] that evaluates liveness on demand.
#[derive(Debug)]
pub struct SessionHeartbeatMonitor {
    interval: Duration,
    missed_threshold: u32,
    active: Mutex<Option<ActiveSession>>,
}

impl Default for SessionHeartbeatMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(15), 5)
    }
}

impl SessionHeartbeatMonitor {
    /// Creates a monitor expecting a heartbeat every `interval`, reporting
    /// [`Liveness::Missed`] after `missed_threshold` silent intervals.
    #[must_use]
    pub const fn new(interval: Duration, missed_threshold: u32) -> Self {
        Self {
            interval,
            missed_threshold,
            active: Mutex::new(None),
        }
    }

    /// Records a heartbeat. Heartbeats of other sessions are ignored.
    pub fn heartbeat(&self, session: &SessionId, at: DateTime<Utc>) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_mut() {
            Some(current) if &current.session == session => current.last_seen = at,
            _ => tracing::debug!(session = %session, "heartbeat for inactive session"),
        }
    }

    /// Returns the monitored session, if any.
    #[must_use]
    pub fn active_session(&self) -> Option<SessionId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|current| current.session.clone())
    }

    /// Evaluates liveness at `now`.
    #[must_use]
    pub fn liveness(&self, now: DateTime<Utc>) -> Liveness {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = active.as_ref() else {
            return Liveness::Inactive;
        };
        let silent = (now - current.last_seen).to_std().unwrap_or_default();
        let interval_ms = self.interval.as_millis().max(1);
        let missed = u32::try_from(silent.as_millis() / interval_ms).unwrap_or(u32::MAX);
        if missed >= self.missed_threshold {
            Liveness::Missed { missed }
        } else {
            Liveness::Alive {
                last_seen: current.last_seen,
            }
        }
    }
}

impl HeartbeatMonitor for SessionHeartbeatMonitor {
    fn activate(&self, session: &SessionId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = active.as_ref() {
            tracing::info!(previous = %previous.session, "replacing monitored session");
        }
        *active = Some(ActiveSession {
            session: session.clone(),
            last_seen: Utc::now(),
        });
        tracing::info!(session = %session, "heartbeat monitor activated");
    }

    fn deactivate(&self, session: &SessionId) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|current| &current.session == session) {
            *active = None;
            tracing::info!(session = %session, "heartbeat monitor deactivated");
        } else {
            tracing::debug!(session = %session, "ignoring deactivation of stale session");
        }
    }
}

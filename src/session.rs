//! Test-session lifecycle.
//!
//! ```text
//! NotStarted ──start──> Running ──pause──> Paused
//!                          ^  <──resume/start──  │
//!                          │                     │
//!                          └──stop──> Stopped <──stop
//! ```
//!
//! `Stopped` is terminal. Starting a session without a name names it
//! `Test_YYYYMMDD_HHMMSS` after the start time.

use crate::bus::{EventBus, StationEvent};
use crate::fsm::{StateMachine, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Lifecycle state of a test session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, not yet started.
    #[default]
    NotStarted,
    /// Test running.
    Running,
    /// Test paused.
    Paused,
    /// Test finished.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not_started",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct SessionTimes {
    name: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// A test session.
pub struct TestSession {
    fsm: StateMachine<SessionState>,
    times: Arc<RwLock<SessionTimes>>,
    _bus_link: Option<Subscription<SessionState>>,
}

impl fmt::Debug for TestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let times = self.times.read();
        f.debug_struct("TestSession")
            .field("name", &times.name)
            .field("state", &self.state())
            .field("started_at", &times.started_at)
            .field("ended_at", &times.ended_at)
            .finish()
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TestSession {
    /// New session. An empty or missing name is generated on start.
    pub fn new(name: Option<String>) -> Self {
        let times = Arc::new(RwLock::new(SessionTimes {
            name: name.unwrap_or_default(),
            ..SessionTimes::default()
        }));
        let fsm = StateMachine::named("session", SessionState::NotStarted);

        let t = Arc::clone(&times);
        fsm.add_transition_with(SessionState::NotStarted, SessionState::Running, move |_, _| {
            let now = Utc::now();
            let mut times = t.write();
            times.started_at = Some(now);
            if times.name.trim().is_empty() {
                times.name = now.format("Test_%Y%m%d_%H%M%S").to_string();
            }
        });
        fsm.add_transition(SessionState::Running, SessionState::Paused);
        fsm.add_transition(SessionState::Paused, SessionState::Running);
        for from in [SessionState::Running, SessionState::Paused] {
            let t = Arc::clone(&times);
            fsm.add_transition_with(from, SessionState::Stopped, move |_, _| {
                t.write().ended_at = Some(Utc::now());
            });
        }

        Self {
            fsm,
            times,
            _bus_link: None,
        }
    }

    /// Same session publishing every transition on `bus`.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        let times = Arc::clone(&self.times);
        let link = self.fsm.subscribe(move |change| {
            let session = times.read().name.clone();
            info!(session = %session, from = %change.from, to = %change.to, "Session state changed");
            bus.publish(StationEvent::SessionStateChanged {
                session,
                from: change.from,
                to: change.to,
                timestamp: Utc::now(),
            });
        });
        self._bus_link = Some(link);
        self
    }

    /// Starts a new session or continues a paused one.
    pub fn start(&self) -> bool {
        self.fsm.try_transition(SessionState::Running)
    }

    /// Pauses a running session.
    pub fn pause(&self) -> bool {
        self.fsm.try_transition(SessionState::Paused)
    }

    /// Continues a paused session.
    pub fn resume(&self) -> bool {
        if self.state() != SessionState::Paused {
            return false;
        }
        self.fsm.try_transition(SessionState::Running)
    }

    /// Ends the session.
    pub fn stop(&self) -> bool {
        self.fsm.try_transition(SessionState::Stopped)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    /// Session name (empty until started when none was given).
    pub fn name(&self) -> String {
        self.times.read().name.clone()
    }

    /// When the session first started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.times.read().started_at
    }

    /// When the session stopped.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.times.read().ended_at
    }

    /// The underlying state machine, for observers.
    pub fn state_machine(&self) -> &StateMachine<SessionState> {
        &self.fsm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_generates_name() {
        let session = TestSession::new(None);
        assert_eq!(session.name(), "");
        assert!(session.start());
        let name = session.name();
        assert!(name.starts_with("Test_"));
        assert_eq!(name.len(), "Test_20240101_120000".len());
        assert!(session.started_at().is_some());
    }

    #[test]
    fn test_given_name_kept() {
        let session = TestSession::new(Some("tensile-42".into()));
        session.start();
        assert_eq!(session.name(), "tensile-42");
    }

    #[test]
    fn test_pause_resume_stop() {
        let session = TestSession::default();
        assert!(!session.pause());
        assert!(!session.resume());
        assert!(session.start());
        let started = session.started_at();
        assert!(session.pause());
        assert_eq!(session.state(), SessionState::Paused);
        assert!(session.resume());
        assert_eq!(session.started_at(), started);
        assert!(session.stop());
        assert!(session.ended_at().is_some());
    }

    #[test]
    fn test_start_continues_paused_session() {
        let session = TestSession::default();
        session.start();
        session.pause();
        assert!(session.start());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let session = TestSession::default();
        assert!(!session.stop());
        session.start();
        session.stop();
        assert!(!session.start());
        assert!(!session.resume());
        assert!(!session.pause());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_transitions_published() {
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe().unwrap();
        let session = TestSession::new(Some("s1".into())).with_bus(Arc::clone(&bus));
        session.start();
        session.stop();

        let mut seen = Vec::new();
        while let Some(StationEvent::SessionStateChanged { from, to, session, .. }) = events.try_recv() {
            assert_eq!(session, "s1");
            seen.push((from, to));
        }
        assert_eq!(
            seen,
            vec![
                (SessionState::NotStarted, SessionState::Running),
                (SessionState::Running, SessionState::Stopped),
            ]
        );
    }
}

//! RAII guard for the terminal event of a session.
//!
//! A runner that returns normally reports its terminal state through
//! [`SessionGuard::finish`]. If the runner unwinds or its future is dropped
//! first, the guard reports the session as aborted in the last phase it was
//! told about, so subscribers never wait on a session that is gone.

use membreak_core::{AgentSession, SessionPhase};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::reporter::SessionReporter;

pub struct SessionGuard {
    reporter: SessionReporter,
    phase: SessionPhase,
    completed: bool,
}

impl SessionGuard {
    pub fn new(reporter: SessionReporter) -> Self {
        debug!(
            session_id = %reporter.session_ref().session_id,
            agent = %reporter.session_ref().agent,
            "Session guard created"
        );

        Self {
            reporter,
            phase: SessionPhase::Init,
            completed: false,
        }
    }

    /// Records the phase reported if the guard is dropped unfinished.
    pub fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    /// Emits the terminal event for `session` and disarms the guard.
    pub fn finish(&mut self, session: &AgentSession) {
        debug!(
            session_id = %session.id,
            phase = %session.phase,
            "Session finished"
        );
        self.reporter.finished(session);
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn session_id(&self) -> Uuid {
        self.reporter.session_ref().session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                session_id = %self.session_id(),
                phase = %self.phase,
                "Session guard dropped without completion - emitting failure"
            );
            self.reporter
                .aborted(self.phase, "session terminated unexpectedly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::{Event, EventBus};
    use membreak_core::AgentKind;

    fn setup() -> (EventBus, AgentSession) {
        (EventBus::new(), AgentSession::new(Uuid::new_v4(), AgentKind::Claude))
    }

    #[test]
    fn test_guard_initial_state() {
        let (bus, session) = setup();
        let guard = SessionGuard::new(SessionReporter::new(bus, &session));
        assert!(!guard.is_completed());
        assert_eq!(guard.session_id(), session.id);
    }

    #[test]
    fn test_finish_emits_once() {
        let (bus, mut session) = setup();
        let mut rx = bus.subscribe();
        session.complete().unwrap();

        let mut guard = SessionGuard::new(SessionReporter::new(bus.clone(), &session));
        guard.finish(&session);
        drop(guard);

        assert!(matches!(
            rx.try_recv().unwrap().event,
            Event::SessionFinished { ref outcome, .. } if outcome == "done"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_without_finish_reports_abort() {
        let (bus, session) = setup();
        let mut rx = bus.subscribe();

        let mut guard = SessionGuard::new(SessionReporter::new(bus.clone(), &session));
        guard.set_phase(SessionPhase::DeepDive);
        drop(guard);

        match rx.try_recv().unwrap().event {
            Event::SessionFinished {
                outcome,
                phase,
                failure_kind,
                ..
            } => {
                assert_eq!(outcome, "failed");
                assert_eq!(phase, "deep_dive");
                assert_eq!(failure_kind.as_deref(), Some("adapter_error"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

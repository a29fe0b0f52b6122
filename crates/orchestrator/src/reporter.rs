//! Session-scoped event reporting.
//!
//! Every event a runner or the judge dispatcher publishes about a session
//! goes through a [`SessionReporter`] bound to that session, so the
//! identifying fields are filled in one place. Sequence numbers are stamped
//! by the bus.

use events::{Event, EventBus, SessionRef};
use membreak_core::{AgentSession, CompressionSignal, CompressionVerdict, FailureKind, SessionPhase};

#[derive(Debug, Clone)]
pub struct SessionReporter {
    bus: EventBus,
    session: SessionRef,
}

impl SessionReporter {
    pub fn new(bus: EventBus, session: &AgentSession) -> Self {
        Self {
            bus,
            session: session_ref(session),
        }
    }

    pub fn session_ref(&self) -> &SessionRef {
        &self.session
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    pub fn started(&self) {
        self.emit(Event::SessionStarted {
            session: self.session.clone(),
        });
    }

    pub fn phase_changed(&self, from: SessionPhase, to: SessionPhase) {
        self.emit(Event::SessionPhaseChanged {
            session: self.session.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    pub fn signal_observed(&self, signal: &CompressionSignal) {
        self.emit(Event::SignalObserved {
            session: self.session.clone(),
            iteration: signal.iteration,
            remaining: signal.remaining,
            raw: signal.raw.clone(),
        });
    }

    pub fn compression_detected(&self, verdict: &CompressionVerdict) {
        self.emit(Event::CompressionDetected {
            session: self.session.clone(),
            method: verdict.method.as_str().to_string(),
            iteration: verdict.iteration,
            before: verdict.before,
            after: verdict.after,
            availability: verdict.availability.as_str().to_string(),
        });
    }

    pub fn question_answered(&self, index: u32, response: &str) {
        self.emit(Event::QuestionAnswered {
            session: self.session.clone(),
            index,
            response_chars: response.chars().count(),
        });
    }

    pub fn retrying(&self, kind: FailureKind, next_attempt: u32) {
        self.emit(Event::SessionRetrying {
            session: self.session.clone(),
            failure_kind: kind.as_str().to_string(),
            next_attempt,
        });
    }

    /// Terminal event for a session that reached a terminal phase.
    pub fn finished(&self, session: &AgentSession) {
        let outcome = session.outcome.as_ref();
        self.emit(Event::SessionFinished {
            session: self.session.clone(),
            outcome: session.phase.as_str().to_string(),
            phase: outcome
                .and_then(|o| o.failed_phase())
                .unwrap_or(session.phase)
                .as_str()
                .to_string(),
            failure_kind: outcome
                .and_then(|o| o.failure_kind())
                .map(|k| k.as_str().to_string()),
            message: outcome.and_then(|o| o.message()).map(str::to_string),
        });
    }

    /// Terminal event for a runner that went away without finishing.
    pub fn aborted(&self, phase: SessionPhase, message: &str) {
        self.emit(Event::SessionFinished {
            session: self.session.clone(),
            outcome: SessionPhase::Failed.as_str().to_string(),
            phase: phase.as_str().to_string(),
            failure_kind: Some(FailureKind::AdapterError.as_str().to_string()),
            message: Some(message.to_string()),
        });
    }

    pub fn judge_started(&self, strategy: &str) {
        self.emit(Event::JudgeStarted {
            session: self.session.clone(),
            strategy: strategy.to_string(),
        });
    }

    pub fn judge_scored(&self, strategy: &str, overall: f64, passed: bool) {
        self.emit(Event::JudgeScored {
            session: self.session.clone(),
            strategy: strategy.to_string(),
            overall,
            passed,
        });
    }

    pub fn judge_failed(&self, strategy: &str, error: &str) {
        self.emit(Event::JudgeFailed {
            session: self.session.clone(),
            strategy: strategy.to_string(),
            error: error.to_string(),
        });
    }
}

pub fn session_ref(session: &AgentSession) -> SessionRef {
    SessionRef {
        session_id: session.id,
        task_id: session.task_id,
        agent: session.agent.as_str().to_string(),
        attempt: session.attempt,
    }
}

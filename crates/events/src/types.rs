//! Event types reported while an evaluation task runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    /// Bus-wide sequence number. Zero until stamped by the bus.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Who a session event is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRef {
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub agent: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Task events
    #[serde(rename = "task.started")]
    TaskStarted {
        task_id: Uuid,
        target: String,
        agents: Vec<String>,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        status: String,
        scored: usize,
        unscored: usize,
    },

    // Session events
    #[serde(rename = "session.started")]
    SessionStarted {
        #[serde(flatten)]
        session: SessionRef,
    },

    #[serde(rename = "session.phase_changed")]
    SessionPhaseChanged {
        #[serde(flatten)]
        session: SessionRef,
        from: String,
        to: String,
    },

    /// Context-remaining reading taken before a deep-dive prompt
    #[serde(rename = "session.signal_observed")]
    SignalObserved {
        #[serde(flatten)]
        session: SessionRef,
        iteration: u32,
        remaining: Option<f64>,
        raw: String,
    },

    #[serde(rename = "session.compression_detected")]
    CompressionDetected {
        #[serde(flatten)]
        session: SessionRef,
        method: String,
        iteration: u32,
        before: Option<f64>,
        after: Option<f64>,
        availability: String,
    },

    #[serde(rename = "session.question_answered")]
    QuestionAnswered {
        #[serde(flatten)]
        session: SessionRef,
        index: u32,
        response_chars: usize,
    },

    /// The session will be restarted from scratch as a new attempt
    #[serde(rename = "session.retrying")]
    SessionRetrying {
        #[serde(flatten)]
        session: SessionRef,
        failure_kind: String,
        next_attempt: u32,
    },

    #[serde(rename = "session.finished")]
    SessionFinished {
        #[serde(flatten)]
        session: SessionRef,
        outcome: String,
        phase: String,
        failure_kind: Option<String>,
        message: Option<String>,
    },

    // Judge events
    #[serde(rename = "judge.started")]
    JudgeStarted {
        #[serde(flatten)]
        session: SessionRef,
        strategy: String,
    },

    #[serde(rename = "judge.scored")]
    JudgeScored {
        #[serde(flatten)]
        session: SessionRef,
        strategy: String,
        overall: f64,
        passed: bool,
    },

    #[serde(rename = "judge.failed")]
    JudgeFailed {
        #[serde(flatten)]
        session: SessionRef,
        strategy: String,
        error: String,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskStarted { task_id, .. } | Event::TaskCompleted { task_id, .. } => {
                Some(*task_id)
            }
            Event::Error { .. } => None,
            other => other.session().map(|s| s.task_id),
        }
    }

    pub fn session(&self) -> Option<&SessionRef> {
        match self {
            Event::SessionStarted { session }
            | Event::SessionPhaseChanged { session, .. }
            | Event::SignalObserved { session, .. }
            | Event::CompressionDetected { session, .. }
            | Event::QuestionAnswered { session, .. }
            | Event::SessionRetrying { session, .. }
            | Event::SessionFinished { session, .. }
            | Event::JudgeStarted { session, .. }
            | Event::JudgeScored { session, .. }
            | Event::JudgeFailed { session, .. } => Some(session),
            Event::TaskStarted { .. } | Event::TaskCompleted { .. } | Event::Error { .. } => None,
        }
    }

    /// Dotted event name, identical to the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskStarted { .. } => "task.started",
            Event::TaskCompleted { .. } => "task.completed",
            Event::SessionStarted { .. } => "session.started",
            Event::SessionPhaseChanged { .. } => "session.phase_changed",
            Event::SignalObserved { .. } => "session.signal_observed",
            Event::CompressionDetected { .. } => "session.compression_detected",
            Event::QuestionAnswered { .. } => "session.question_answered",
            Event::SessionRetrying { .. } => "session.retrying",
            Event::SessionFinished { .. } => "session.finished",
            Event::JudgeStarted { .. } => "judge.started",
            Event::JudgeScored { .. } => "judge.scored",
            Event::JudgeFailed { .. } => "judge.failed",
            Event::Error { .. } => "error",
        }
    }
}

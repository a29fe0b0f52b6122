use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::AgentKind;
use super::signal::{CompressionRecord, CompressionSignal, CompressionVerdict};
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Init,
    PreCompression,
    DeepDive,
    MemoryOnly,
    Evaluation,
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::PreCompression => "pre_compression",
            Self::DeepDive => "deep_dive",
            Self::MemoryOnly => "memory_only",
            Self::Evaluation => "evaluation",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "pre_compression" => Some(Self::PreCompression),
            "deep_dive" => Some(Self::DeepDive),
            "memory_only" => Some(Self::MemoryOnly),
            "evaluation" => Some(Self::Evaluation),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SetupError,
    AdapterError,
    ProtocolError,
    Timeout,
    JudgeError,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupError => "setup_error",
            Self::AdapterError => "adapter_error",
            Self::ProtocolError => "protocol_error",
            Self::Timeout => "timeout",
            Self::JudgeError => "judge_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "setup_error" => Some(Self::SetupError),
            "adapter_error" => Some(Self::AdapterError),
            "protocol_error" => Some(Self::ProtocolError),
            "timeout" => Some(Self::Timeout),
            "judge_error" => Some(Self::JudgeError),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended. Exactly one per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    Failure {
        kind: FailureKind,
        phase: SessionPhase,
        message: String,
    },
    TimedOut {
        phase: SessionPhase,
    },
    Cancelled {
        phase: SessionPhase,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::Failure { kind, .. } => Some(*kind),
            Self::TimedOut { .. } => Some(FailureKind::Timeout),
            Self::Cancelled { .. } => Some(FailureKind::Cancelled),
        }
    }

    /// Phase the session was in when it stopped making progress.
    pub fn failed_phase(&self) -> Option<SessionPhase> {
        match self {
            Self::Success => None,
            Self::Failure { phase, .. } | Self::TimedOut { phase } | Self::Cancelled { phase } => {
                Some(*phase)
            }
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failure { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub phase: SessionPhase,
    pub reached_at: DateTime<Utc>,
}

/// One prompt/response pair in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    pub phase: SessionPhase,
    pub index: u32,
    pub prompt: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCounters {
    pub deep_dive_iterations: u32,
    pub prompts_sent: u32,
    pub tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent: AgentKind,
    pub attempt: u32,
    pub phase: SessionPhase,
    pub milestones: Vec<Milestone>,
    pub counters: SessionCounters,
    pub last_signal: Option<CompressionSignal>,
    pub transcript: Vec<Exchange>,
    pub compression: CompressionRecord,
    pub outcome: Option<SessionOutcome>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(task_id: Uuid, agent: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            agent,
            attempt: 1,
            phase: SessionPhase::Init,
            milestones: vec![Milestone {
                phase: SessionPhase::Init,
                reached_at: now,
            }],
            counters: SessionCounters::default(),
            last_signal: None,
            transcript: Vec::new(),
            compression: CompressionRecord::default(),
            outcome: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.as_ref().is_some_and(SessionOutcome::is_success)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(CoreError::SessionTerminal(self.id));
        }
        Ok(())
    }

    /// Moves to a non-terminal phase and appends its milestone. Table
    /// validation lives with the caller; this only guards terminal sessions
    /// and direct jumps into terminal phases.
    pub fn enter_phase(&mut self, phase: SessionPhase) -> Result<()> {
        self.ensure_open()?;
        if phase.is_terminal() {
            return Err(CoreError::InvalidPhaseTransition {
                from: self.phase.as_str().to_string(),
                to: phase.as_str().to_string(),
            });
        }
        self.push_milestone(phase);
        Ok(())
    }

    fn push_milestone(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.milestones.push(Milestone {
            phase,
            reached_at: Utc::now(),
        });
    }

    fn finish(&mut self, phase: SessionPhase, outcome: SessionOutcome) -> Result<()> {
        self.ensure_open()?;
        self.push_milestone(phase);
        self.outcome = Some(outcome);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.finish(SessionPhase::Done, SessionOutcome::Success)
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<()> {
        let phase = self.phase;
        self.finish(
            SessionPhase::Failed,
            SessionOutcome::Failure {
                kind,
                phase,
                message: message.into(),
            },
        )
    }

    pub fn time_out(&mut self) -> Result<()> {
        let phase = self.phase;
        self.finish(SessionPhase::TimedOut, SessionOutcome::TimedOut { phase })
    }

    pub fn cancel(&mut self) -> Result<()> {
        let phase = self.phase;
        self.finish(SessionPhase::Cancelled, SessionOutcome::Cancelled { phase })
    }

    pub fn record_exchange(
        &mut self,
        index: u32,
        prompt: impl Into<String>,
        response: impl Into<String>,
        reference: Option<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.transcript.push(Exchange {
            phase: self.phase,
            index,
            prompt: prompt.into(),
            response: response.into(),
            reference,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn add_usage(&mut self, tokens: u64) {
        self.counters.prompts_sent += 1;
        self.counters.tokens += tokens;
    }

    pub fn observe_signal(&mut self, signal: CompressionSignal) {
        self.last_signal = Some(signal);
    }

    pub fn record_compression(
        &mut self,
        verdict: &CompressionVerdict,
        trigger: Option<CompressionSignal>,
        predecessor: Option<CompressionSignal>,
    ) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.compression.record(verdict, trigger, predecessor))
    }

    pub fn exchanges_in(&self, phase: SessionPhase) -> impl Iterator<Item = &Exchange> {
        self.transcript.iter().filter(move |e| e.phase == phase)
    }

    pub fn evaluation_answers(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges_in(SessionPhase::Evaluation)
    }
}

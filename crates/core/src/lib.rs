//! Domain model for memory-break evaluations.
//!
//! Everything here is plain data plus the invariants that keep it honest:
//! sessions only move forward, transcripts only grow, and a compression
//! verdict is written at most once.

pub mod domain;
pub mod error;

pub use domain::agent::AgentKind;
pub use domain::score::{
    BreakingDimension, DimensionAssessment, JudgeInfo, JudgeStrategyKind, Rubric, RubricDimension,
    Score,
};
pub use domain::session::{
    AgentSession, Exchange, FailureKind, Milestone, SessionCounters, SessionOutcome, SessionPhase,
};
pub use domain::signal::{
    CompressionMethod, CompressionRecord, CompressionSignal, CompressionVerdict,
    SignalAvailability,
};
pub use domain::task::{ChangedFile, EvalQuestion, EvalTarget, EvalTask, TaskStatus};
pub use error::{CoreError, Result};

pub mod adapter;
pub mod aggregator;
pub mod collaborators;
pub mod config;
pub mod detector;
pub mod error;
pub mod judge;
pub mod llm;
pub mod pipeline;
pub mod reporter;
pub mod resources;
pub mod runner;
pub mod session_orchestrator;
pub mod state_machine;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use adapter::{AdapterFactory, AgentAdapter, AgentDescriptor, AgentRegistry};
pub use aggregator::{aggregate, Comparison, RankedEntry, UnscoredEntry};
pub use collaborators::{ChangeSource, GitChangeSource, PromptSet, PromptSource, TemplatePrompts};
pub use config::{EvalConfig, JudgeConfig};
pub use detector::CompressionDetector;
pub use error::{AdapterError, JudgeError, OrchestratorError, Result};
pub use judge::{JudgeDispatcher, JudgeFailure, JudgedSession, Verdict};
pub use pipeline::{EvaluationPipeline, TaskReport};
pub use runner::{PhaseRunner, SessionInputs};
pub use session_orchestrator::SessionOrchestrator;
pub use state_machine::PhaseStateMachine;

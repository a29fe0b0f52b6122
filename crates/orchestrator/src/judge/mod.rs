//! Scoring of finished sessions.
//!
//! A [`JudgeStrategy`] turns one successful session into a [`Score`]; the
//! [`JudgeDispatcher`] feeds finished sessions to it as they arrive, retries
//! once on a judge error and applies the configured fallback.

mod backend;
mod dispatcher;
mod heuristic;
mod llm;

pub use backend::HttpJudgeBackend;
pub use dispatcher::{JudgeDispatcher, JudgeFailure, JudgedSession, Verdict};
pub use heuristic::HeuristicJudge;
pub use llm::{build_judge_prompt, extract_json, LlmJudge};

use async_trait::async_trait;
use membreak_core::{AgentSession, JudgeStrategyKind, Rubric, Score};

use crate::error::{JudgeError, JudgeResult};

#[async_trait]
pub trait JudgeStrategy: Send + Sync {
    fn kind(&self) -> JudgeStrategyKind;

    async fn score(&self, session: &AgentSession, rubric: &Rubric) -> JudgeResult<Score>;
}

/// Text-completion service the LLM strategy talks to.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    fn model(&self) -> Option<&str> {
        None
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String>;
}

/// Only sessions that reached DONE are scored.
pub(crate) fn ensure_judgeable(session: &AgentSession) -> JudgeResult<()> {
    if session.is_success() {
        Ok(())
    } else {
        Err(JudgeError::NotApplicable(format!(
            "session {} ended in {}",
            session.id, session.phase
        )))
    }
}

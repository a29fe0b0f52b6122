//! External collaborators the pipeline consumes: where the changed files come
//! from and how prompts are worded. Both are traits so callers can swap in
//! their own; the defaults here read a local git repository and use fixed
//! templates.

mod git;
mod prompts;

pub use git::GitChangeSource;
pub use prompts::{prompt_hash, PromptSet, TemplatePrompts};

use async_trait::async_trait;
use membreak_core::{ChangedFile, EvalQuestion, EvalTarget, SessionPhase};

use crate::error::Result;

/// Produces the canonical changed-file set for a target.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changed_files(&self, target: &EvalTarget) -> Result<Vec<ChangedFile>>;
}

pub trait PromptSource: Send + Sync {
    /// Prompt for one of the scripted phases (init, pre-compression,
    /// deep-dive, memory-only).
    fn render(&self, phase: SessionPhase, files: &[ChangedFile]) -> String;

    fn evaluation_questions(&self, target: &EvalTarget) -> Vec<EvalQuestion>;
}

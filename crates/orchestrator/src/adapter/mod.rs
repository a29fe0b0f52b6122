//! Agent adapters: the per-turn request/response contract every agent kind
//! implements, plus the static registry that builds them.

mod chat;
mod cli;
mod registry;

pub use chat::ChatAdapter;
pub use cli::CliAdapter;
pub use registry::{AgentDescriptor, AgentRegistry};

use std::path::PathBuf;

use async_trait::async_trait;
use membreak_core::AgentKind;
use serde::Serialize;
use uuid::Uuid;

use crate::detector::StatusReport;
use crate::error::AdapterError;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Where and for whom an adapter is started.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    /// Tokens consumed by this turn, when the agent reports them.
    pub tokens: Option<u64>,
    pub status: Option<StatusReport>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentCapabilities {
    /// Reports remaining context as a number.
    pub native_status: bool,
    /// Has a status command whose output can be scraped.
    pub status_command: bool,
    pub token_usage: bool,
}

/// One agent conversation. Calls are strictly sequential per session.
#[async_trait]
pub trait AgentAdapter: Send {
    fn kind(&self) -> AgentKind;

    fn capabilities(&self) -> AgentCapabilities;

    async fn start(&mut self, ctx: &AgentContext) -> AdapterResult<()>;

    async fn send(&mut self, prompt: &str) -> AdapterResult<AgentReply>;

    async fn status(&mut self) -> AdapterResult<StatusReport>;

    /// Must be safe to call more than once and after a failed `start`.
    async fn stop(&mut self) -> AdapterResult<()>;
}

/// Builds a fresh adapter for each session attempt.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, kind: AgentKind) -> AdapterResult<Box<dyn AgentAdapter>>;
}

/// Rough token count for agents that do not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

use async_trait::async_trait;
use membreak_core::AgentKind;
use tracing::{debug, info};

use super::{
    estimate_tokens, AdapterResult, AgentAdapter, AgentCapabilities, AgentContext, AgentReply,
};
use crate::config::ChatAgentConfig;
use crate::detector::StatusReport;
use crate::error::AdapterError;
use crate::llm::{ChatClient, ChatMessage};

const SYSTEM_PROMPT: &str = "You are a senior engineer reviewing a code change. \
Answer precisely and only from what you have been shown in this conversation.";

/// Agent backed by a chat-completion API.
///
/// Keeps the whole conversation client-side and reports how much of its
/// configured context budget is left. When usage crosses the compaction
/// ratio the older turns are folded into a short note, which frees context
/// and shows up as a jump in the remaining percentage.
pub struct ChatAdapter {
    kind: AgentKind,
    client: ChatClient,
    config: ChatAgentConfig,
    history: Vec<ChatMessage>,
    context_tokens: u64,
    compactions: u32,
    started: bool,
}

impl ChatAdapter {
    pub fn new(kind: AgentKind, client: ChatClient, config: ChatAgentConfig) -> Self {
        Self {
            kind,
            client,
            config,
            history: Vec::new(),
            context_tokens: 0,
            compactions: 0,
            started: false,
        }
    }

    pub fn compactions(&self) -> u32 {
        self.compactions
    }

    fn remaining_pct(&self) -> f64 {
        let budget = self.config.context_budget_tokens.max(1) as f64;
        ((1.0 - self.context_tokens as f64 / budget) * 100.0).clamp(0.0, 100.0)
    }

    fn history_estimate(&self) -> u64 {
        self.history.iter().map(|m| estimate_tokens(&m.content)).sum()
    }

    fn should_compact(&self) -> bool {
        let limit = self.config.context_budget_tokens as f64 * self.config.compaction_ratio;
        self.context_tokens as f64 >= limit
    }

    /// Drops everything but the system prompt and the most recent turns.
    fn compact(&mut self) {
        let keep = self.config.keep_recent_messages;
        // history[0] is the system prompt
        let body = self.history.len().saturating_sub(1);
        if body <= keep {
            return;
        }
        let dropped = body - keep;
        let recent = self.history.split_off(1 + dropped);
        self.history.truncate(1);
        self.history.push(ChatMessage::system(format!(
            "[{dropped} earlier messages were removed to free context. \
             Rely on what you remember of them.]"
        )));
        self.history.extend(recent);
        self.context_tokens = self.history_estimate();
        self.compactions += 1;

        info!(
            agent = %self.kind,
            dropped,
            remaining_pct = self.remaining_pct(),
            "Compacted conversation history"
        );
    }
}

#[async_trait]
impl AgentAdapter for ChatAdapter {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            native_status: true,
            status_command: false,
            token_usage: true,
        }
    }

    async fn start(&mut self, ctx: &AgentContext) -> AdapterResult<()> {
        debug!(
            agent = %self.kind,
            session_id = %ctx.session_id,
            model = %self.config.model,
            "Starting chat agent"
        );
        self.history = vec![ChatMessage::system(SYSTEM_PROMPT)];
        self.context_tokens = self.history_estimate();
        self.compactions = 0;
        self.started = true;
        Ok(())
    }

    async fn send(&mut self, prompt: &str) -> AdapterResult<AgentReply> {
        if !self.started {
            return Err(AdapterError::NotStarted);
        }

        self.history.push(ChatMessage::user(prompt));
        let completion = match self
            .client
            .chat_completion(&self.history, &self.config.model, None, self.config.max_tokens)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                self.history.pop();
                return Err(e.into());
            }
        };

        if completion.content.trim().is_empty() {
            self.history.pop();
            return Err(AdapterError::protocol("agent returned an empty reply"));
        }

        let turn_tokens = match completion.usage {
            Some(usage) => {
                self.context_tokens = usage.total_tokens;
                usage.prompt_tokens + usage.completion_tokens
            }
            None => {
                let estimate = estimate_tokens(prompt) + estimate_tokens(&completion.content);
                self.context_tokens += estimate;
                estimate
            }
        };
        self.history.push(ChatMessage::assistant(&completion.content));

        if self.should_compact() {
            self.compact();
        }

        Ok(AgentReply {
            text: completion.content,
            tokens: Some(turn_tokens),
            status: Some(StatusReport::Native {
                remaining_pct: self.remaining_pct(),
            }),
        })
    }

    async fn status(&mut self) -> AdapterResult<StatusReport> {
        if !self.started {
            return Err(AdapterError::NotStarted);
        }
        Ok(StatusReport::Native {
            remaining_pct: self.remaining_pct(),
        })
    }

    async fn stop(&mut self) -> AdapterResult<()> {
        if self.started {
            debug!(agent = %self.kind, turns = self.history.len(), "Stopping chat agent");
        }
        self.started = false;
        self.history.clear();
        Ok(())
    }
}

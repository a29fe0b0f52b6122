use membreak_core::{AgentKind, JudgeStrategyKind, Rubric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Below the default deep-dive limit, so agents without a usable context
/// signal still end with a heuristic verdict.
pub const DEFAULT_ITERATION_CAP: u32 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub low_threshold: f64,
    pub jump_threshold: f64,
    /// Deep-dive step at which the heuristic rule declares compression.
    pub iteration_cap: Option<u32>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            low_threshold: 30.0,
            jump_threshold: 30.0,
            iteration_cap: Some(DEFAULT_ITERATION_CAP),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JudgeConfig {
    pub strategy: JudgeStrategyKind,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the judge API key.
    pub api_key_env: String,
    /// Fall back to the heuristic judge when the LLM judge keeps failing.
    pub fallback_to_heuristic: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Budget for one judging attempt.
    pub timeout_secs: u64,
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            strategy: JudgeStrategyKind::Heuristic,
            model: "openai/gpt-4o".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            fallback_to_heuristic: false,
            temperature: 0.1,
            max_tokens: 2000,
            timeout_secs: 120,
        }
    }
}

/// Settings for agents driven through a chat-completion API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatAgentConfig {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    /// Token budget the agent pretends to have; drives the reported context.
    pub context_budget_tokens: u64,
    /// Fraction of the budget at which history gets compacted.
    pub compaction_ratio: f64,
    /// Most recent messages kept verbatim when compacting.
    pub keep_recent_messages: usize,
    pub max_tokens: Option<u32>,
}

impl ChatAgentConfig {
    fn for_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            context_budget_tokens: 200_000,
            compaction_ratio: 0.9,
            keep_recent_messages: 4,
            max_tokens: None,
        }
    }
}

impl Default for ChatAgentConfig {
    fn default() -> Self {
        Self::for_model("anthropic/claude-sonnet-4.5")
    }
}

/// Settings for agents driven as a local command-line process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CliAgentConfig {
    pub binary: String,
    /// Arguments placed before the prompt on the first turn.
    pub args: Vec<String>,
    /// Arguments placed before the prompt on every later turn; they must
    /// resume the conversation held in the working copy. `None` makes
    /// every turn a fresh conversation.
    pub continue_args: Option<Vec<String>>,
    /// Command that prints context usage, scraped for a status signal.
    pub status_args: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self {
            binary: "iflow".to_string(),
            args: vec!["-p".to_string()],
            continue_args: Some(vec!["--continue".to_string(), "-p".to_string()]),
            status_args: Some(vec!["/stats".to_string(), "model".to_string()]),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub iflow: CliAgentConfig,
    pub claude: ChatAgentConfig,
    pub gemini: ChatAgentConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            iflow: CliAgentConfig::default(),
            claude: ChatAgentConfig::for_model("anthropic/claude-sonnet-4.5"),
            gemini: ChatAgentConfig::for_model("google/gemini-2.5-pro"),
        }
    }
}

/// Everything an evaluation run needs, passed explicitly to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvalConfig {
    pub detector: DetectorConfig,
    pub max_deep_dive_iterations: u32,
    pub session_timeout_secs: u64,
    pub max_session_retries: u32,
    pub run_root: PathBuf,
    pub max_files: usize,
    pub rubric: Rubric,
    pub judge: JudgeConfig,
    pub agents: AgentsConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            max_deep_dive_iterations: 100,
            session_timeout_secs: 3600,
            max_session_retries: 2,
            run_root: PathBuf::from("storage"),
            max_files: 50,
            rubric: Rubric::default(),
            judge: JudgeConfig::default(),
            agents: AgentsConfig::default(),
        }
    }
}

impl EvalConfig {
    pub fn new(run_root: impl Into<PathBuf>) -> Self {
        Self {
            run_root: run_root.into(),
            ..Default::default()
        }
    }

    pub fn with_thresholds(mut self, low: f64, jump: f64) -> Self {
        self.detector.low_threshold = low;
        self.detector.jump_threshold = jump;
        self
    }

    pub fn with_iteration_cap(mut self, cap: Option<u32>) -> Self {
        self.detector.iteration_cap = cap;
        self
    }

    pub fn with_max_deep_dive_iterations(mut self, max: u32) -> Self {
        self.max_deep_dive_iterations = max;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_session_retries(mut self, retries: u32) -> Self {
        self.max_session_retries = retries;
        self
    }

    pub fn with_rubric(mut self, rubric: Rubric) -> Self {
        self.rubric = rubric;
        self
    }

    pub fn with_judge(mut self, judge: JudgeConfig) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn chat_agent(&self, kind: AgentKind) -> Option<&ChatAgentConfig> {
        match kind {
            AgentKind::Claude => Some(&self.agents.claude),
            AgentKind::Gemini => Some(&self.agents.gemini),
            AgentKind::Iflow => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if !(0.0..=100.0).contains(&d.low_threshold) {
            return Err(OrchestratorError::Config(format!(
                "detector.low_threshold must be within 0-100, got {}",
                d.low_threshold
            )));
        }
        if d.jump_threshold <= 0.0 || d.jump_threshold > 100.0 {
            return Err(OrchestratorError::Config(format!(
                "detector.jump_threshold must be within (0, 100], got {}",
                d.jump_threshold
            )));
        }
        if d.iteration_cap == Some(0) {
            return Err(OrchestratorError::Config(
                "detector.iteration_cap must be at least 1".into(),
            ));
        }
        if self.max_deep_dive_iterations == 0 {
            return Err(OrchestratorError::Config(
                "max_deep_dive_iterations must be at least 1".into(),
            ));
        }
        if self.session_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "session_timeout_secs must be at least 1".into(),
            ));
        }
        if self.judge.timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "judge.timeout_secs must be at least 1".into(),
            ));
        }
        for chat in [&self.agents.claude, &self.agents.gemini] {
            if !(0.0..=1.0).contains(&chat.compaction_ratio) || chat.compaction_ratio == 0.0 {
                return Err(OrchestratorError::Config(format!(
                    "compaction_ratio for {} must be within (0, 1]",
                    chat.model
                )));
            }
        }
        self.rubric.validate()?;
        Ok(())
    }
}

use membreak_core::AgentKind;
use serde::Serialize;

use super::{AdapterFactory, AdapterResult, AgentAdapter, AgentCapabilities, ChatAdapter, CliAdapter};
use crate::config::AgentsConfig;
use crate::error::AdapterError;
use crate::llm::ChatClient;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentDescriptor {
    pub kind: AgentKind,
    pub display_name: &'static str,
    pub description: &'static str,
    pub capabilities: AgentCapabilities,
}

const CHAT_CAPABILITIES: AgentCapabilities = AgentCapabilities {
    native_status: true,
    status_command: false,
    token_usage: true,
};

static AGENTS: [AgentDescriptor; 3] = [
    AgentDescriptor {
        kind: AgentKind::Iflow,
        display_name: "iFlow CLI",
        description: "Command-line agent run once per turn inside the working copy; \
                      context usage is scraped from its status command",
        capabilities: AgentCapabilities {
            native_status: false,
            status_command: true,
            token_usage: false,
        },
    },
    AgentDescriptor {
        kind: AgentKind::Claude,
        display_name: "Anthropic Claude",
        description: "Chat-completion agent with token tracking and history compaction",
        capabilities: CHAT_CAPABILITIES,
    },
    AgentDescriptor {
        kind: AgentKind::Gemini,
        display_name: "Google Gemini",
        description: "Chat-completion agent with token tracking and history compaction",
        capabilities: CHAT_CAPABILITIES,
    },
];

/// Static table of supported agents and the factory that builds them from
/// configuration.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    config: AgentsConfig,
    http: reqwest::Client,
}

impl AgentRegistry {
    pub fn new(config: AgentsConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn descriptors() -> &'static [AgentDescriptor] {
        &AGENTS
    }

    pub fn describe(kind: AgentKind) -> &'static AgentDescriptor {
        // AGENTS lists every AgentKind in declaration order
        &AGENTS[kind as usize]
    }
}

impl AdapterFactory for AgentRegistry {
    fn create(&self, kind: AgentKind) -> AdapterResult<Box<dyn AgentAdapter>> {
        match kind {
            AgentKind::Iflow => Ok(Box::new(CliAdapter::new(kind, self.config.iflow.clone()))),
            AgentKind::Claude | AgentKind::Gemini => {
                let config = match kind {
                    AgentKind::Claude => &self.config.claude,
                    _ => &self.config.gemini,
                };
                let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                    AdapterError::NotConfigured(format!(
                        "{kind}: environment variable {} is not set",
                        config.api_key_env
                    ))
                })?;
                let client =
                    ChatClient::with_http_client(self.http.clone(), api_key, &config.base_url);
                Ok(Box::new(ChatAdapter::new(kind, client, config.clone())))
            }
        }
    }
}

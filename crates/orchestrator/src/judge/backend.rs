use async_trait::async_trait;
use tracing::debug;

use super::JudgeBackend;
use crate::config::JudgeConfig;
use crate::error::{JudgeError, JudgeResult, OrchestratorError, Result};
use crate::llm::{ChatClient, ChatMessage};

const SYSTEM_PROMPT: &str = "You are an expert evaluator of AI coding agents. \
You answer with a single JSON object and nothing else.";

/// Judge backend over an OpenAI-compatible chat-completion endpoint.
#[derive(Debug, Clone)]
pub struct HttpJudgeBackend {
    client: ChatClient,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpJudgeBackend {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 2000,
        }
    }

    /// Reads the API key from the environment variable named in `config`.
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            OrchestratorError::Config(format!(
                "judge API key variable {} is not set",
                config.api_key_env
            ))
        })?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OrchestratorError::Config(format!("judge HTTP client: {e}")))?;
        let client = ChatClient::with_http_client(http, api_key, &config.base_url);
        Ok(Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl JudgeBackend for HttpJudgeBackend {
    fn model(&self) -> Option<&str> {
        Some(&self.model)
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String> {
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
        let completion = self
            .client
            .chat_completion(
                &messages,
                &self.model,
                Some(self.temperature),
                Some(self.max_tokens),
            )
            .await?;
        debug!(model = %self.model, usage = ?completion.usage, "Judge completion received");

        if completion.content.trim().is_empty() {
            return Err(JudgeError::Parse("judge returned an empty completion".into()));
        }
        Ok(completion.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_complete_sends_model_and_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"model": "judge-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "x",
                "model": "judge-model",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"scores\": {}}"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new("k", server.uri()).with_retry_policy(0, Duration::from_millis(1));
        let backend = HttpJudgeBackend::new(client, "judge-model");
        assert_eq!(backend.complete("judge this").await.unwrap(), "{\"scores\": {}}");
    }

    #[tokio::test]
    async fn test_http_failure_maps_to_judge_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let client = ChatClient::new("k", server.uri()).with_retry_policy(0, Duration::from_millis(1));
        let err = HttpJudgeBackend::new(client, "m").complete("x").await.unwrap_err();
        assert!(matches!(err, JudgeError::Http { status: 400, .. }));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = JudgeConfig {
            api_key_env: "MEMBREAK_TEST_JUDGE_KEY_THAT_IS_NEVER_SET".to_string(),
            ..JudgeConfig::default()
        };
        assert!(matches!(
            HttpJudgeBackend::from_config(&config),
            Err(OrchestratorError::Config(_))
        ));
    }
}

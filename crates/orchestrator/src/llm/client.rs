use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::types::*;
use crate::error::{AdapterError, JudgeError};

const DEFAULT_MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60000;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimited { retry_after: Option<u64> },

    #[error("API error ({status_code:?}): {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<LlmError> for AdapterError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited { .. } => AdapterError::Http {
                status: 429,
                message: "rate limited".to_string(),
            },
            LlmError::Api {
                message,
                status_code: Some(status),
            } => AdapterError::Http { status, message },
            LlmError::Api {
                message,
                status_code: None,
            } => AdapterError::Protocol(message),
            LlmError::Http(e) => e.into(),
        }
    }
}

impl From<LlmError> for JudgeError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Api {
                message,
                status_code: Some(status),
            } => JudgeError::Http { status, message },
            other => JudgeError::Backend(other.to_string()),
        }
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    api_key: String,
    base_url: String,
    max_retries: u32,
    initial_backoff_ms: u64,
}

impl ChatClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_http_client(Client::new(), api_key, base_url)
    }

    pub fn with_http_client(
        client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff_ms = initial_backoff.as_millis() as u64;
        self
    }

    async fn with_retry<T, F, Fut>(&self, operation: F, operation_name: &str) -> Result<T, LlmError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let mut retries = 0;
        let mut backoff_ms = self.initial_backoff_ms;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(LlmError::RateLimited { retry_after }) => {
                    if retries >= self.max_retries {
                        error!(
                            "{} failed after {} retries due to rate limiting",
                            operation_name, retries
                        );
                        return Err(LlmError::RateLimited { retry_after });
                    }

                    let wait_ms = retry_after
                        .map(|s| s * 1000)
                        .unwrap_or(backoff_ms)
                        .min(MAX_BACKOFF_MS);

                    warn!(
                        "{} rate limited, retrying in {}ms (attempt {}/{})",
                        operation_name,
                        wait_ms,
                        retries + 1,
                        self.max_retries
                    );

                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    retries += 1;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(LlmError::Api {
                    ref message,
                    status_code: Some(code),
                }) if code >= 500 => {
                    if retries >= self.max_retries {
                        error!(
                            "{} failed after {} retries due to server error: {}",
                            operation_name, retries, message
                        );
                        return Err(LlmError::Api {
                            message: message.clone(),
                            status_code: Some(code),
                        });
                    }

                    warn!(
                        "{} server error ({}), retrying in {}ms (attempt {}/{})",
                        operation_name,
                        code,
                        backoff_ms,
                        retries + 1,
                        self.max_retries
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    retries += 1;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => {
                    if retries > 0 {
                        info!("{} failed after {} retries: {}", operation_name, retries, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatCompletion, LlmError> {
        self.with_retry(
            || self.chat_completion_inner(messages, model, temperature, max_tokens),
            "chat_completion",
        )
        .await
    }

    async fn chat_completion_inner(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<ChatCompletion, LlmError> {
        debug!(
            "Creating chat completion with {} messages, model {}",
            messages.len(),
            model
        );

        let request = ChatCompletionRequest {
            model,
            messages,
            temperature,
            max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                warn!("Rate limited by chat completion API");
                return Err(LlmError::RateLimited { retry_after: None });
            }

            let message = serde_json::from_str::<ApiErrorBody>(&error_text)
                .map(|body| body.error.message)
                .unwrap_or(error_text);
            error!("Chat completion API error ({}): {}", status.as_u16(), message);
            return Err(LlmError::Api {
                message,
                status_code: Some(status.as_u16()),
            });
        }

        let body: ChatCompletionResponse = response.json().await?;
        let usage = body.usage;

        body.choices
            .into_iter()
            .next()
            .map(|c| ChatCompletion {
                content: c.message.content,
                usage,
            })
            .ok_or_else(|| LlmError::Api {
                message: "No completion returned".to_string(),
                status_code: None,
            })
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

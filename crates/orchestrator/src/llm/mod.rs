//! Minimal OpenAI-compatible chat-completion client shared by the chat
//! agent adapter and the LLM judge backend.

mod client;
mod types;

pub use client::{ChatClient, LlmError};
pub use types::{ChatCompletion, ChatMessage, ChatUsage, Role};

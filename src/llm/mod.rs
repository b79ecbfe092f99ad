//! # Response Generation
//!
//! Turns a system prompt plus the conversation so far into the model's raw
//! reply text. Validation of that text lives in [`crate::reply`].

pub mod client;
pub mod prompt;

pub use client::ChatCompletionsClient;
pub use prompt::PromptBuilder;

use crate::conversation::models::{Message, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("language model API key not configured")]
    MissingApiKey,

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("language model API error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("language model returned no choices")]
    NoChoices,

    #[error("unreadable generation response: {0}")]
    InvalidResponse(String),

    #[error("generation timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl From<Sender> for ChatRole {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::User => ChatRole::User,
            Sender::Assistant => ChatRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce the model's raw reply for `history`, answering in `language`.
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[Message],
        language: &str,
    ) -> Result<String, GenerationError>;
}

/// Reply-language instruction appended to the system prompt.
pub fn language_directive(language: &str) -> String {
    let name = match language {
        "en" => "English",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        other => other,
    };
    format!("Always reply in {}.", name)
}

/// One system entry followed by one entry per history message, in order.
pub fn build_chat_messages(
    system_prompt: &str,
    history: &[Message],
    language: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage {
        role: ChatRole::System,
        content: format!("{}\n\n{}", system_prompt.trim_end(), language_directive(language)),
    });
    messages.extend(history.iter().map(|message| ChatMessage {
        role: message.sender.into(),
        content: message.content.clone(),
    }));
    messages
}

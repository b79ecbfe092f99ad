//! OpenAI-compatible chat completions client.

use crate::config::LlmServiceConfig;
use crate::conversation::models::Message;
use crate::llm::{build_chat_messages, ChatMessage, GenerationError, ResponseGenerator};
use crate::upstream;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionsClient {
    pub fn new(config: &LlmServiceConfig, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: upstream::build_client(timeout)?,
            endpoint: upstream::endpoint(&config.base_url, "chat/completions"),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsClient {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[Message],
        language: &str,
    ) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::MissingApiKey)?;
        let started = Instant::now();

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: build_chat_messages(system_prompt, history, language),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                body: upstream::error_message(&body),
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(GenerationError::NoChoices)?
            .message
            .content
            .unwrap_or_default();

        info!(
            model = %self.model,
            turns = history.len(),
            chars = content.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation completed"
        );
        debug!(reply = %content, "Raw model reply");

        Ok(content)
    }
}

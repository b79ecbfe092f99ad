//! OpenAI-compatible Whisper client (Groq by default).

use crate::config::TranscriptionServiceConfig;
use crate::transcription::{Transcriber, TranscriptionError};
use crate::upstream;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Clone)]
pub struct WhisperApiClient {
    client: Client,
    endpoint: String,
    model: String,
    response_format: String,
    api_key: Option<String>,
}

impl WhisperApiClient {
    pub fn new(config: &TranscriptionServiceConfig, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: upstream::build_client(timeout)?,
            endpoint: upstream::endpoint(&config.base_url, "audio/transcriptions"),
            model: config.model.clone(),
            response_format: config.response_format.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperApiClient {
    async fn transcribe(&self, wav: Vec<u8>, language: &str) -> Result<String, TranscriptionError> {
        let api_key = self.api_key.as_deref().ok_or(TranscriptionError::MissingApiKey)?;
        let started = Instant::now();
        let wav_len = wav.len();

        let file_part = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;

        let form = Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("temperature", "0")
            .text("response_format", self.response_format.clone())
            .text("language", language.to_string());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Upstream {
                status: status.as_u16(),
                message: upstream::error_message(&body),
            });
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::InvalidResponse(e.to_string()))?;

        info!(
            wav_bytes = wav_len,
            chars = parsed.text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcription completed"
        );
        debug!(transcript = %parsed.text, "Transcript");

        Ok(parsed.text.trim().to_string())
    }
}

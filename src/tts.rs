//! # Speech Synthesis
//!
//! Optional last stage of the pipeline: reply text in, audio bytes out.
//! A synthesis failure never discards the text reply.

use crate::audio::wav::{self, AudioFormat};
use crate::config::TtsServiceConfig;
use crate::upstream;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech synthesis API key not configured")]
    MissingApiKey,

    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("speech synthesis API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("speech synthesis returned no audio")]
    EmptyAudio,

    #[error("failed to package synthesized audio: {0}")]
    Encoding(#[from] std::io::Error),

    #[error("speech synthesis timed out after {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// ElevenLabs text-to-speech adapter.
#[derive(Debug, Clone)]
pub struct ElevenLabsClient {
    client: Client,
    endpoint: String,
    model_id: String,
    output_format: String,
    api_key: Option<String>,
    /// Set when raw PCM output should be wrapped before delivery.
    wrap_format: Option<AudioFormat>,
}

impl ElevenLabsClient {
    pub fn new(config: &TtsServiceConfig, timeout: Duration) -> reqwest::Result<Self> {
        let wrap_format = if config.wrap_wav {
            pcm_sample_rate(&config.output_format).map(|sample_rate| AudioFormat {
                sample_rate,
                ..AudioFormat::default()
            })
        } else {
            None
        };

        Ok(Self {
            client: upstream::build_client(timeout)?,
            endpoint: upstream::endpoint(
                &config.base_url,
                &format!("v1/text-to-speech/{}", config.voice_id),
            ),
            model_id: config.model_id.clone(),
            output_format: config.output_format.clone(),
            api_key: config.api_key.clone(),
            wrap_format,
        })
    }
}

/// Sample rate of a raw `pcm_<rate>` output format; `None` for encoded formats.
fn pcm_sample_rate(output_format: &str) -> Option<u32> {
    output_format.strip_prefix("pcm_")?.parse().ok()
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        let api_key = self.api_key.as_deref().ok_or(SynthesisError::MissingApiKey)?;
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("output_format", self.output_format.as_str())])
            .header("xi-api-key", api_key)
            .json(&SynthesisRequest {
                text,
                model_id: &self.model_id,
            })
            .send()
            .await
            .map_err(|e| SynthesisError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Upstream {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| SynthesisError::Request(e.to_string()))?;
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        info!(
            bytes = audio.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Speech synthesized"
        );

        match &self.wrap_format {
            Some(format) => Ok(wav::wrap_pcm(&audio, format)?),
            None => Ok(audio.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::WAV_HEADER_LEN;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, wrap_wav: bool) -> TtsServiceConfig {
        TtsServiceConfig {
            enabled: true,
            base_url: base_url.to_string(),
            voice_id: "voice-1".to_string(),
            model_id: "eleven_monolingual_v1".to_string(),
            output_format: "pcm_16000".to_string(),
            wrap_wav,
            api_key: Some("xi-key".to_string()),
        }
    }

    #[test]
    fn test_pcm_sample_rate() {
        assert_eq!(pcm_sample_rate("pcm_16000"), Some(16_000));
        assert_eq!(pcm_sample_rate("pcm_22050"), Some(22_050));
        assert_eq!(pcm_sample_rate("mp3_44100_128"), None);
    }

    /// Raw PCM comes back untouched unless wrapping is enabled.
    #[tokio::test]
    async fn test_synthesize_raw_and_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/voice-1"))
            .and(query_param("output_format", "pcm_16000"))
            .and(header("xi-api-key", "xi-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;

        let raw =
            ElevenLabsClient::new(&config(&server.uri(), false), Duration::from_secs(5)).unwrap();
        assert_eq!(raw.synthesize("Hello").await.unwrap(), vec![7u8; 64]);

        let wrapped =
            ElevenLabsClient::new(&config(&server.uri(), true), Duration::from_secs(5)).unwrap();
        let audio = wrapped.synthesize("Hello").await.unwrap();
        assert_eq!(audio.len(), WAV_HEADER_LEN + 64);
        assert_eq!(&audio[..4], b"RIFF");
    }

    #[tokio::test]
    async fn test_synthesize_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let client =
            ElevenLabsClient::new(&config(&server.uri(), false), Duration::from_secs(5)).unwrap();
        match client.synthesize("Hello").await {
            Err(SynthesisError::Upstream { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

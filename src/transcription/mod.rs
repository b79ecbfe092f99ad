//! # Transcription Module
//!
//! Speech-to-text for one utterance. Audio arrives as a complete WAV envelope
//! and leaves as plain text; the hosted Whisper endpoint does the work.
//!
//! ## Key Components:
//! - **Transcriber**: the seam the conversation pipeline depends on
//! - **WhisperApiClient**: OpenAI-compatible `/audio/transcriptions` adapter

pub mod client;

pub use client::WhisperApiClient;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Every way a transcription attempt can fail. All variants mean the
/// utterance produced no transcript.
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription API key not configured")]
    MissingApiKey,

    #[error("transcription request failed: {0}")]
    Request(String),

    #[error("transcription API error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("unreadable transcription response: {0}")]
    InvalidResponse(String),

    #[error("transcription timed out after {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV envelope spoken in `language` (ISO 639-1 code).
    async fn transcribe(&self, wav: Vec<u8>, language: &str) -> Result<String, TranscriptionError>;
}

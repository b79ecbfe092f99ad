//! # Conversation Pipeline
//!
//! One utterance end to end:
//!
//! 1. wrap the PCM in a WAV envelope
//! 2. transcribe it
//! 3. load the user's current conversation (or start a new one)
//! 4. ask the model for a reply, with a format reminder on the outgoing user turn
//! 5. validate the reply, falling back to a fixed one on failure
//! 6. append both turns and persist the log
//! 7. optionally synthesize speech for the reply
//!
//! Every remote call is bounded by the configured timeout. The pipeline keeps
//! no per-connection state, so one instance serves every connection.

use crate::audio::wav::{self, AudioFormat};
use crate::config::AppConfig;
use crate::conversation::models::{Message, MessageLog, Sender};
use crate::conversation::request::UtteranceRequest;
use crate::conversation::store::{ConversationStore, StoreError};
use crate::llm::{ChatCompletionsClient, GenerationError, PromptBuilder, ResponseGenerator};
use crate::reply::{BraceSpanParser, ReplyError, ReplyParser, StructuredReply};
use crate::transcription::{Transcriber, TranscriptionError, WhisperApiClient};
use crate::tts::{ElevenLabsClient, SpeechSynthesizer, SynthesisError};
use anyhow::Context;
use chrono::{Duration as TimeDelta, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to encode audio: {0}")]
    Encoding(#[from] std::io::Error),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Invalid user_id. User does not exist.")]
    UnknownUser,

    #[error("conversation {0} no longer exists")]
    ConversationMissing(i64),

    #[error("conversation storage failed: {0}")]
    Storage(StoreError),

    #[error("conversation history could not be encoded or decoded: {0}")]
    History(serde_json::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKeyViolation => PipelineError::UnknownUser,
            StoreError::NotFound(id) => PipelineError::ConversationMissing(id),
            other => PipelineError::Storage(other),
        }
    }
}

/// Per-call settings, snapshotted from the live configuration so runtime
/// config updates apply to the next utterance.
#[derive(Debug, Clone)]
pub struct ConversationPolicy {
    pub reuse_window: TimeDelta,
    pub format_reminder: String,
    pub audio_format: AudioFormat,
    pub synthesize: bool,
}

impl ConversationPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            reuse_window: TimeDelta::minutes(i64::from(config.conversation.reuse_window_minutes)),
            format_reminder: config.conversation.format_reminder.clone(),
            audio_format: config.audio.format(),
            synthesize: config.services.tts.enabled && config.reply_profile.send_audio,
        }
    }
}

/// Result of one successful cycle.
#[derive(Debug, Clone)]
pub struct UtteranceOutcome {
    pub transcript: String,
    pub reply: StructuredReply,
    /// Why the model output was replaced by the fallback reply, if it was.
    pub fallback_reason: Option<ReplyError>,
    pub conversation_id: Option<i64>,
    /// False when the reply is delivered but the history write failed.
    pub persisted: bool,
    pub audio: Option<Vec<u8>>,
}

impl UtteranceOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

pub struct ConversationPipeline {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    parser: Arc<dyn ReplyParser>,
    store: ConversationStore,
    prompts: PromptBuilder,
    call_timeout: Duration,
}

impl ConversationPipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        store: ConversationStore,
        prompts: PromptBuilder,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            parser: Arc::new(BraceSpanParser),
            store,
            prompts,
            call_timeout,
        }
    }

    /// Wire the hosted service adapters described by `config`.
    pub fn from_config(config: &AppConfig, store: ConversationStore) -> anyhow::Result<Self> {
        let call_timeout = config.services.request_timeout();

        let transcriber = WhisperApiClient::new(&config.services.transcription, call_timeout)
            .context("Failed to build transcription client")?;
        let generator = ChatCompletionsClient::new(&config.services.llm, call_timeout)
            .context("Failed to build language model client")?;
        let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = if config.services.tts.enabled {
            let client = ElevenLabsClient::new(&config.services.tts, call_timeout)
                .context("Failed to build speech synthesis client")?;
            Some(Arc::new(client))
        } else {
            None
        };

        Ok(Self::new(
            Arc::new(transcriber),
            Arc::new(generator),
            synthesizer,
            store,
            PromptBuilder::new(config.conversation.persona.clone()),
            call_timeout,
        ))
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn synthesis_enabled(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Run one utterance through every stage.
    pub async fn process(
        &self,
        request: UtteranceRequest,
        policy: &ConversationPolicy,
    ) -> Result<UtteranceOutcome, PipelineError> {
        let started = Instant::now();
        let user_id = request.user_id;

        let wav = wav::wrap_pcm(&request.pcm, &policy.audio_format)?;
        let transcript = timeout(
            self.call_timeout,
            self.transcriber.transcribe(wav, &request.language),
        )
        .await
        .map_err(|_| TranscriptionError::TimedOut(self.call_timeout))??;
        debug!(%user_id, transcript = %transcript, "Utterance transcribed");

        let existing = self.store.find_current(user_id, policy.reuse_window).await?;
        let mut log = match &existing {
            Some(conversation) => conversation.messages().map_err(PipelineError::History)?,
            None => MessageLog::default(),
        };

        let profile = match self.store.fetch_profile(user_id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => return Err(PipelineError::UnknownUser),
            Err(err) => {
                warn!(%user_id, error = %err, "Profile lookup failed, prompting without it");
                None
            }
        };
        let system_prompt = self.prompts.build(profile.as_ref(), Utc::now());

        let user_message = Message::new(Sender::User, transcript.clone());
        let mut outgoing = log.messages.clone();
        outgoing.push(Message {
            content: format!("{}{}", transcript, policy.format_reminder),
            ..user_message.clone()
        });

        let raw_reply = timeout(
            self.call_timeout,
            self.generator.generate(&system_prompt, &outgoing, &request.language),
        )
        .await
        .map_err(|_| GenerationError::TimedOut(self.call_timeout))??;

        let (reply, fallback_reason) = match self.parser.parse(&raw_reply) {
            Ok(reply) => (reply, None),
            Err(reason) => {
                warn!(%user_id, reason = %reason, "Model reply failed validation, using fallback");
                (StructuredReply::fallback(), Some(reason))
            }
        };

        log.push(user_message);
        log.push(Message::new(Sender::Assistant, reply.message.clone()));
        let blob = log.to_blob().map_err(PipelineError::History)?;

        let write = match &existing {
            Some(conversation) => self
                .store
                .update(conversation.id, blob)
                .await
                .map(|_| conversation.id),
            None => self.store.insert(user_id, blob).await.map(|inserted| inserted.id),
        };
        let (conversation_id, persisted) = match write {
            Ok(id) => (Some(id), true),
            Err(err @ (StoreError::ForeignKeyViolation | StoreError::NotFound(_))) => {
                return Err(err.into());
            }
            Err(err) => {
                warn!(
                    %user_id,
                    error = %err,
                    "Failed to persist conversation, delivering reply anyway"
                );
                (existing.as_ref().map(|c| c.id), false)
            }
        };

        let audio = if policy.synthesize {
            self.synthesize(&reply.message).await
        } else {
            None
        };

        info!(
            %user_id,
            device_id = request.device_id,
            conversation_id = ?conversation_id,
            reused = existing.is_some(),
            turns = log.len(),
            emotion = %reply.emotion,
            fallback = fallback_reason.is_some(),
            persisted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Utterance processed"
        );

        Ok(UtteranceOutcome {
            transcript,
            reply,
            fallback_reason,
            conversation_id,
            persisted,
            audio,
        })
    }

    async fn synthesize(&self, text: &str) -> Option<Vec<u8>> {
        let synthesizer = self.synthesizer.as_ref()?;
        let result = timeout(self.call_timeout, synthesizer.synthesize(text))
            .await
            .map_err(|_| SynthesisError::TimedOut(self.call_timeout))
            .and_then(|inner| inner);
        match result {
            Ok(audio) => Some(audio),
            Err(err) => {
                warn!(error = %err, "Speech synthesis failed, sending text only");
                None
            }
        }
    }
}

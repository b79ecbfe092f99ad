//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with `APP__` prefix and `__` between sections)
//! - Platform variables (`HOST`, `PORT`, `DATABASE_PATH`, `GROQ_API_KEY`, `ELEVENLABS_API_KEY`)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables
//! 2. `APP__` environment variables (e.g. `APP__CONVERSATION__REUSE_WINDOW_MINUTES=20`)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The double underscore separator lets field names such as `reuse_window_minutes`
//! keep their own underscores.

use crate::audio::wav::AudioFormat;
use crate::conversation::request::UtteranceLimits;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (HTTP server, audio format, conversation
/// policy, reply frames, upstream services, storage, capacity), which keeps
/// the TOML file readable and lets runtime updates touch one group at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub conversation: ConversationConfig,
    pub reply_profile: ReplyProfile,
    pub services: ServicesConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from devices on the network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PCM format streamed by the devices and the shortest utterance worth transcribing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Utterances shorter than this are rejected before transcription.
    pub min_utterance_ms: u64,
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
        }
    }

    /// `None` when the duration can't be expressed in bytes for this format.
    pub fn min_utterance_bytes(&self) -> Option<usize> {
        self.format().bytes_for_duration_ms(self.min_utterance_ms)
    }
}

/// Conversation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// A conversation created less than this many minutes ago is continued
    /// instead of starting a new one.
    pub reuse_window_minutes: u32,
    pub supported_languages: Vec<String>,
    /// Used by the one-shot endpoint when the request names no language.
    pub default_language: String,
    /// Appended to the outgoing user turn only; never persisted.
    pub format_reminder: String,
    /// Opening paragraph of the system prompt.
    pub persona: String,
}

/// Which frames a completed utterance produces on the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyProfile {
    /// Text frame carrying the emotion tag.
    pub send_emotion: bool,
    /// Text frame carrying the reply message.
    pub send_message: bool,
    /// Binary frame carrying synthesized speech, when synthesis is enabled.
    pub send_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Upper bound for every remote call.
    pub request_timeout_secs: u64,
    pub transcription: TranscriptionServiceConfig,
    pub llm: LlmServiceConfig,
    pub tts: TtsServiceConfig,
}

impl ServicesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionServiceConfig {
    pub base_url: String,
    pub model: String,
    pub response_format: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmServiceConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsServiceConfig {
    pub enabled: bool,
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    /// Provider output format, e.g. `pcm_16000`.
    pub output_format: String,
    /// Wrap raw `pcm_*` output in a WAV envelope before sending it on.
    pub wrap_wav: bool,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Largest WebSocket frame or HTTP request body accepted, in bytes.
    pub max_request_bytes: usize,
    /// Optional cap on one WebSocket utterance across all its frames; unbounded when unset.
    #[serde(default)]
    pub max_utterance_bytes: Option<usize>,
}

const DEFAULT_PERSONA: &str = "You are Anne, a warm and playful companion who helps a child \
through their day. Keep answers short, kind and easy to understand.";

/// Upper bound on `audio.channels`; keeps the header arithmetic in range.
const MAX_CHANNELS: u16 = 8;
/// Upper bound on `audio.min_utterance_ms`.
const MAX_MIN_UTTERANCE_MS: u64 = 60_000;

const DEFAULT_FORMAT_REMINDER: &str = "\n\n(Answer only with the JSON object described in your \
instructions: message, emotion, task_completion.)";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 16_000,
                channels: 1,
                bits_per_sample: 16,
                min_utterance_ms: 500, // 16000 bytes at 16 kHz mono 16-bit
            },
            conversation: ConversationConfig {
                reuse_window_minutes: 15,
                supported_languages: vec!["en".to_string(), "de".to_string()],
                default_language: "en".to_string(),
                format_reminder: DEFAULT_FORMAT_REMINDER.to_string(),
                persona: DEFAULT_PERSONA.to_string(),
            },
            reply_profile: ReplyProfile {
                send_emotion: true,
                send_message: false,
                send_audio: false,
            },
            services: ServicesConfig {
                request_timeout_secs: 30,
                transcription: TranscriptionServiceConfig {
                    base_url: "https://api.groq.com/openai/v1".to_string(),
                    model: "whisper-large-v3-turbo".to_string(),
                    response_format: "json".to_string(),
                    api_key: None,
                },
                llm: LlmServiceConfig {
                    base_url: "https://api.groq.com/openai/v1".to_string(),
                    model: "llama-3.3-70b-versatile".to_string(),
                    api_key: None,
                },
                tts: TtsServiceConfig {
                    enabled: false,
                    base_url: "https://api.elevenlabs.io".to_string(),
                    voice_id: "cgSgspJ2msm6clMCkdW9".to_string(),
                    model_id: "eleven_monolingual_v1".to_string(),
                    output_format: "pcm_16000".to_string(),
                    wrap_wav: false,
                    api_key: None,
                },
            },
            storage: StorageConfig {
                database_path: "data/companion.sqlite3".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                max_request_bytes: 10 * 1024 * 1024, // ~5 minutes of audio
                max_utterance_bytes: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__SERVICES__TTS__ENABLED=true`: Turn on speech synthesis
    /// - `GROQ_API_KEY=...`: Key for both transcription and generation
    /// - `ELEVENLABS_API_KEY=...`: Key for speech synthesis
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            settings = settings.set_override("storage.database_path", path)?;
        }
        if let Some(key) = non_empty_var("GROQ_API_KEY") {
            settings = settings
                .set_override("services.transcription.api_key", key.clone())?
                .set_override("services.llm.api_key", key)?;
        }
        if let Some(key) = non_empty_var("ELEVENLABS_API_KEY") {
            settings = settings.set_override("services.tts.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!(
                "Audio sample rate and channel count must be greater than 0"
            ));
        }

        if self.audio.channels > MAX_CHANNELS {
            return Err(anyhow::anyhow!(
                "At most {} audio channels are supported, got {}",
                MAX_CHANNELS,
                self.audio.channels
            ));
        }

        if self.audio.min_utterance_ms > MAX_MIN_UTTERANCE_MS {
            return Err(anyhow::anyhow!(
                "Minimum utterance length cannot exceed {} ms, got {}",
                MAX_MIN_UTTERANCE_MS,
                self.audio.min_utterance_ms
            ));
        }

        if self.audio.bits_per_sample != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {} bits per sample",
                self.audio.bits_per_sample
            ));
        }

        if self.conversation.reuse_window_minutes == 0 {
            return Err(anyhow::anyhow!("Conversation reuse window must be at least one minute"));
        }

        if self.conversation.supported_languages.is_empty() {
            return Err(anyhow::anyhow!("At least one supported language is required"));
        }

        if !self
            .conversation
            .supported_languages
            .contains(&self.conversation.default_language)
        {
            return Err(anyhow::anyhow!(
                "Default language '{}' is not in the supported languages",
                self.conversation.default_language
            ));
        }

        if self.services.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if self.services.tts.enabled && self.services.tts.voice_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Speech synthesis is enabled but no voice_id is set"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let min_utterance_bytes = self
            .audio
            .min_utterance_bytes()
            .ok_or_else(|| anyhow::anyhow!("Audio format is too large to size utterances"))?;

        if self.performance.max_request_bytes < min_utterance_bytes {
            return Err(anyhow::anyhow!(
                "Max request size must be at least the minimum utterance size"
            ));
        }

        if let Some(cap) = self.performance.max_utterance_bytes {
            if cap < min_utterance_bytes {
                return Err(anyhow::anyhow!(
                    "Max utterance size must be at least the minimum utterance size"
                ));
            }
        }

        Ok(())
    }

    /// Thresholds applied to every utterance before it reaches the pipeline.
    pub fn utterance_limits(&self) -> UtteranceLimits {
        UtteranceLimits {
            // validate() rules out the overflow; an unvalidated config rejects everything
            min_bytes: self.audio.min_utterance_bytes().unwrap_or(usize::MAX),
            supported_languages: self.conversation.supported_languages.clone(),
        }
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only non-secret settings can change at runtime. For example,
    /// `{"conversation": {"reuse_window_minutes": 30}}` changes only the window.
    /// API keys, service URLs and the database path are ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} is out of range", port))?;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(ms) = audio.get("min_utterance_ms").and_then(|v| v.as_u64()) {
                self.audio.min_utterance_ms = ms;
            }
        }

        if let Some(conversation) = partial_config.get("conversation") {
            if let Some(minutes) = conversation
                .get("reuse_window_minutes")
                .and_then(|v| v.as_u64())
            {
                self.conversation.reuse_window_minutes = u32::try_from(minutes)
                    .map_err(|_| anyhow::anyhow!("Reuse window {} is out of range", minutes))?;
            }
            if let Some(languages) = conversation
                .get("supported_languages")
                .and_then(|v| v.as_array())
            {
                self.conversation.supported_languages = languages
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect();
            }
            if let Some(language) = conversation.get("default_language").and_then(|v| v.as_str()) {
                self.conversation.default_language = language.to_string();
            }
        }

        if let Some(profile) = partial_config.get("reply_profile") {
            if let Some(flag) = profile.get("send_emotion").and_then(|v| v.as_bool()) {
                self.reply_profile.send_emotion = flag;
            }
            if let Some(flag) = profile.get("send_message").and_then(|v| v.as_bool()) {
                self.reply_profile.send_message = flag;
            }
            if let Some(flag) = profile.get("send_audio").and_then(|v| v.as_bool()) {
                self.reply_profile.send_audio = flag;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(bytes) = performance.get("max_request_bytes").and_then(|v| v.as_u64()) {
                self.performance.max_request_bytes = bytes as usize;
            }
            match performance.get("max_utterance_bytes") {
                Some(serde_json::Value::Null) => self.performance.max_utterance_bytes = None,
                Some(value) => {
                    if let Some(bytes) = value.as_u64() {
                        self.performance.max_utterance_bytes = Some(bytes as usize);
                    }
                }
                None => {}
            }
        }

        self.validate()?;
        Ok(())
    }

    /// JSON view of the configuration with every API key replaced by a presence flag.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        for service in ["transcription", "llm", "tts"] {
            if let Some(section) = value
                .get_mut("services")
                .and_then(|services| services.get_mut(service))
                .and_then(|section| section.as_object_mut())
            {
                let configured = section
                    .get("api_key")
                    .map(|key| !key.is_null())
                    .unwrap_or(false);
                section.remove("api_key");
                section.insert("api_key_configured".to_string(), configured.into());
            }
        }
        value
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

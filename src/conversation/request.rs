//! Device identity headers and utterance validation.
//!
//! Both entry points (the WebSocket session and the one-shot HTTP request)
//! funnel through [`UtteranceRequest::validate`], so an utterance is accepted
//! or rejected by the same rules regardless of how it arrived.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity triple sent once per connection as a JSON text frame.
///
/// Keys follow the HTTP header names the devices already use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHeaders {
    #[serde(rename = "X-User-ID")]
    pub user_id: String,
    #[serde(rename = "X-Device-ID")]
    pub device_id: String,
    #[serde(rename = "X-Language")]
    pub language: String,
}

impl DeviceHeaders {
    /// Parse the handshake frame. Only the JSON shape is checked here.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Thresholds an utterance must satisfy before it reaches the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceLimits {
    pub min_bytes: usize,
    pub supported_languages: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UtteranceError {
    #[error("no PCM data received")]
    EmptyAudio,

    #[error("missing required headers")]
    MissingHeaders,

    #[error("invalid language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid user_id: {0}")]
    InvalidUserId(String),

    #[error("invalid device_id: {0}")]
    InvalidDeviceId(String),

    #[error("audio too short: {len} bytes, at least {min} required")]
    TooShort { len: usize, min: usize },
}

/// A validated utterance ready for the conversation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceRequest {
    pub user_id: Uuid,
    pub device_id: i64,
    pub language: String,
    pub pcm: Vec<u8>,
}

impl UtteranceRequest {
    /// Check `headers` and `pcm` against `limits`.
    ///
    /// Checks run in a fixed order (audio present, headers present, language,
    /// user id, device id, minimum length) so the first failing rule is the
    /// one reported.
    pub fn validate(
        headers: &DeviceHeaders,
        pcm: Vec<u8>,
        limits: &UtteranceLimits,
    ) -> Result<Self, UtteranceError> {
        if pcm.is_empty() {
            return Err(UtteranceError::EmptyAudio);
        }

        let user_id = headers.user_id.trim();
        let device_id = headers.device_id.trim();
        let language = headers.language.trim();
        if user_id.is_empty() || device_id.is_empty() || language.is_empty() {
            return Err(UtteranceError::MissingHeaders);
        }

        if !limits.supported_languages.iter().any(|l| l == language) {
            return Err(UtteranceError::UnsupportedLanguage(language.to_string()));
        }

        let user_id = Uuid::parse_str(user_id)
            .map_err(|_| UtteranceError::InvalidUserId(user_id.to_string()))?;
        let device_id = device_id
            .parse::<i64>()
            .map_err(|_| UtteranceError::InvalidDeviceId(device_id.to_string()))?;

        if pcm.len() < limits.min_bytes {
            return Err(UtteranceError::TooShort {
                len: pcm.len(),
                min: limits.min_bytes,
            });
        }

        Ok(Self {
            user_id,
            device_id,
            language: language.to_string(),
            pcm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> UtteranceLimits {
        UtteranceLimits {
            min_bytes: 16_000,
            supported_languages: vec!["en".to_string(), "de".to_string()],
        }
    }

    fn headers(language: &str) -> DeviceHeaders {
        DeviceHeaders {
            user_id: "0b7c1f5e-54a4-4e55-9a4e-1f2f0a5c6d7e".to_string(),
            device_id: "42".to_string(),
            language: language.to_string(),
        }
    }

    #[test]
    fn test_parse_handshake_frame() {
        let frame = r#"{"X-User-ID":"u","X-Device-ID":"7","X-Language":"de"}"#;
        let parsed = DeviceHeaders::parse(frame).unwrap();
        assert_eq!(parsed.device_id, "7");
        assert_eq!(parsed.language, "de");
    }

    /// A frame missing one of the keys is not a valid handshake.
    #[test]
    fn test_parse_rejects_partial_frame() {
        assert!(DeviceHeaders::parse(r#"{"X-User-ID":"u"}"#).is_err());
        assert!(DeviceHeaders::parse("hello").is_err());
    }

    #[test]
    fn test_valid_request() {
        let request =
            UtteranceRequest::validate(&headers("en"), vec![0; 16_000], &limits()).unwrap();
        assert_eq!(request.device_id, 42);
        assert_eq!(request.language, "en");
        assert_eq!(request.pcm.len(), 16_000);
    }

    #[test]
    fn test_empty_audio_reported_first() {
        let err = UtteranceRequest::validate(&DeviceHeaders::default(), Vec::new(), &limits())
            .unwrap_err();
        assert_eq!(err, UtteranceError::EmptyAudio);
    }

    #[test]
    fn test_missing_headers() {
        let mut h = headers("en");
        h.device_id = " ".to_string();
        let err = UtteranceRequest::validate(&h, vec![0; 16_000], &limits()).unwrap_err();
        assert_eq!(err, UtteranceError::MissingHeaders);
    }

    #[test]
    fn test_unsupported_language() {
        let err =
            UtteranceRequest::validate(&headers("fr"), vec![0; 16_000], &limits()).unwrap_err();
        assert_eq!(err, UtteranceError::UnsupportedLanguage("fr".to_string()));
    }

    #[test]
    fn test_invalid_ids() {
        let mut h = headers("en");
        h.user_id = "not-a-uuid".to_string();
        assert!(matches!(
            UtteranceRequest::validate(&h, vec![0; 16_000], &limits()),
            Err(UtteranceError::InvalidUserId(_))
        ));

        let mut h = headers("en");
        h.device_id = "abc".to_string();
        assert!(matches!(
            UtteranceRequest::validate(&h, vec![0; 16_000], &limits()),
            Err(UtteranceError::InvalidDeviceId(_))
        ));
    }

    /// Audio below the minimum is rejected with both lengths reported.
    #[test]
    fn test_too_short() {
        let err =
            UtteranceRequest::validate(&headers("de"), vec![0; 15_999], &limits()).unwrap_err();
        assert_eq!(err, UtteranceError::TooShort { len: 15_999, min: 16_000 });
    }
}

//! # One-shot Conversation Endpoint
//!
//! `POST /api/v1/conversation` runs a whole utterance in a single request,
//! for clients that cannot hold a WebSocket open.
//!
//! ## Accepted bodies:
//! - `application/json`: `{"user_id", "device_id", "request_pcm" (base64), "language"?}`
//! - `application/octet-stream`: raw PCM, identity in `X-User-ID`, `X-Device-ID`, `X-Language`
//!
//! Anything else is refused with 415. The utterance then goes through the
//! same validation as a WebSocket `EOS`.

use crate::conversation::{ConversationPolicy, DeviceHeaders, UtteranceOutcome, UtteranceRequest};
use crate::error::{AppError, AppResult};
use crate::reply::{Emotion, TaskCompletion};
use crate::state::AppState;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Device ids arrive as JSON numbers from some firmware and as strings from others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceIdField {
    Number(i64),
    Text(String),
}

impl DeviceIdField {
    fn into_string(self) -> String {
        match self {
            DeviceIdField::Number(n) => n.to_string(),
            DeviceIdField::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConversationRequestBody {
    #[serde(default)]
    user_id: String,
    device_id: Option<DeviceIdField>,
    #[serde(default)]
    request_pcm: String,
    language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub transcript: String,
    pub message: String,
    pub emotion: Emotion,
    pub task_completion: Option<TaskCompletion>,
    /// True when the model reply failed validation and the fixed reply was used.
    pub fallback: bool,
    pub conversation_id: Option<i64>,
    pub persisted: bool,
    /// Base64 synthesized speech, when synthesis is enabled and succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

impl From<UtteranceOutcome> for ConversationResponse {
    fn from(outcome: UtteranceOutcome) -> Self {
        Self {
            fallback: outcome.used_fallback(),
            transcript: outcome.transcript,
            message: outcome.reply.message,
            emotion: outcome.reply.emotion,
            task_completion: outcome.reply.task_completion,
            conversation_id: outcome.conversation_id,
            persisted: outcome.persisted,
            audio: outcome
                .audio
                .map(|audio| base64::engine::general_purpose::STANDARD.encode(audio)),
        }
    }
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Pull the identity triple and the PCM bytes out of either body shape.
///
/// A missing language falls back to `default_language`; other missing fields
/// are left empty for [`UtteranceRequest::validate`] to report.
fn extract_utterance(
    req: &HttpRequest,
    body: &[u8],
    default_language: &str,
) -> AppResult<(DeviceHeaders, Vec<u8>)> {
    match req.content_type() {
        "application/json" => {
            let parsed: ConversationRequestBody = serde_json::from_slice(body)?;
            let pcm = base64::engine::general_purpose::STANDARD
                .decode(parsed.request_pcm.trim())
                .map_err(|e| {
                    AppError::BadRequest(format!("request_pcm is not valid base64: {}", e))
                })?;
            let headers = DeviceHeaders {
                user_id: parsed.user_id,
                device_id: parsed
                    .device_id
                    .map(DeviceIdField::into_string)
                    .unwrap_or_default(),
                language: parsed
                    .language
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or_else(|| default_language.to_string()),
            };
            Ok((headers, pcm))
        }
        "application/octet-stream" => {
            let headers = DeviceHeaders {
                user_id: header_value(req, "X-User-ID").unwrap_or_default(),
                device_id: header_value(req, "X-Device-ID").unwrap_or_default(),
                language: header_value(req, "X-Language")
                    .unwrap_or_else(|| default_language.to_string()),
            };
            Ok((headers, body.to_vec()))
        }
        "" => Err(AppError::UnsupportedMediaType("missing Content-Type".to_string())),
        other => Err(AppError::UnsupportedMediaType(format!(
            "expected application/json or application/octet-stream, got {}",
            other
        ))),
    }
}

/// Run one utterance and answer with the reply as JSON.
pub async fn converse(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let (headers, pcm) = extract_utterance(&req, &body, &config.conversation.default_language)?;

    let request = match UtteranceRequest::validate(&headers, pcm, &config.utterance_limits()) {
        Ok(request) => request,
        Err(err) => {
            warn!(reason = %err, "One-shot utterance rejected");
            state.record_rejected_utterance();
            return Err(err.into());
        }
    };
    info!(
        user_id = %request.user_id,
        device_id = request.device_id,
        bytes = request.pcm.len(),
        "One-shot utterance received"
    );

    let policy = ConversationPolicy::from_config(&config);
    let result = state.pipeline.process(request, &policy).await;
    state.record_utterance(&result);

    Ok(HttpResponse::Ok().json(ConversationResponse::from(result?)))
}

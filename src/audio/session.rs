//! # Conversation Session State
//!
//! Per-connection protocol state for the device WebSocket, kept free of any
//! socket I/O so every transition can be exercised directly. The actor in
//! `websocket.rs` feeds frames in and writes the returned frames out.
//!
//! ## Session Lifecycle:
//! 1. **AwaitingHeaders**: waiting for the JSON identity frame
//! 2. **Accumulating**: collecting PCM frames until `EOS`
//! 3. **Processing**: one utterance is in the pipeline; back to Accumulating afterwards
//!
//! `PING` is answered with `PONG` in every state. Messages a device splits
//! across several WebSocket frames are handled like a single frame.

use crate::audio::buffer::{BufferOverflow, UtteranceBuffer};
use crate::config::ReplyProfile;
use crate::conversation::{
    DeviceHeaders, PipelineError, UtteranceLimits, UtteranceOutcome, UtteranceRequest,
};
use crate::reply::Emotion;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const END_OF_STREAM: &str = "EOS";
pub const HEADERS_ACCEPTED: &str = "Headers received successfully.";
pub const INVALID_HEADERS: &str = "Invalid headers format.";
pub const HEADERS_REQUIRED: &str = "Headers must be sent before PCM data.";
pub const BUSY: &str = "Still processing the previous utterance.";
pub const UNSUPPORTED_CONTROL: &str = "Unsupported control message.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    AwaitingHeaders,
    Accumulating,
    Processing,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::AwaitingHeaders => "awaiting_headers",
            SessionStatus::Accumulating => "accumulating",
            SessionStatus::Processing => "processing",
        }
    }
}

/// A frame to write back to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl ServerFrame {
    fn text(message: impl Into<String>) -> Self {
        ServerFrame::Text(message.into())
    }
}

/// Longest text message reassembled from fragments.
const MAX_TEXT_MESSAGE_BYTES: usize = 64 * 1024;

/// One frame of a message the device split across several WebSocket frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment<'a> {
    FirstText(&'a [u8]),
    FirstBinary(&'a [u8]),
    Continue(&'a [u8]),
    Last(&'a [u8]),
}

/// A fragmented message still being received.
#[derive(Debug)]
enum PendingMessage {
    /// Reassembled and handled once complete; `None` once it outgrew the limit.
    Text(Option<Vec<u8>>),
    /// Appended to the utterance buffer piece by piece.
    Binary,
}

/// What the connection should do after an inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionAction {
    /// Nothing to send.
    None,
    Reply(ServerFrame),
    /// Run the pipeline, then report the result through [`ConversationSession::complete`].
    Process(UtteranceRequest),
}

/// Counters reported when the connection closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub total_audio_bytes: usize,
    pub utterances_processed: u32,
    pub utterances_rejected: u32,
    pub pipeline_failures: u32,
}

/// Protocol state for one device connection.
#[derive(Debug)]
pub struct ConversationSession {
    id: Uuid,
    status: SessionStatus,
    /// Set once by the handshake and never replaced.
    headers: Option<DeviceHeaders>,
    buffer: UtteranceBuffer,
    /// Set when the current utterance outgrew the buffer; cleared at `EOS`.
    overflow: Option<BufferOverflow>,
    pending: Option<PendingMessage>,
    limits: UtteranceLimits,
    profile: ReplyProfile,
    /// Emotion most recently sent on this connection.
    last_emotion: Option<Emotion>,
    created_at: DateTime<Utc>,
    summary: SessionSummary,
}

impl ConversationSession {
    /// `max_utterance_bytes` caps one utterance; `None` leaves it unbounded.
    pub fn new(
        limits: UtteranceLimits,
        max_utterance_bytes: Option<usize>,
        profile: ReplyProfile,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::AwaitingHeaders,
            headers: None,
            buffer: UtteranceBuffer::new(max_utterance_bytes),
            overflow: None,
            pending: None,
            limits,
            profile,
            last_emotion: None,
            created_at: Utc::now(),
            summary: SessionSummary::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn headers(&self) -> Option<&DeviceHeaders> {
        self.headers.as_ref()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_emotion(&self) -> Option<Emotion> {
        self.last_emotion
    }

    pub fn summary(&self) -> SessionSummary {
        self.summary.clone()
    }

    /// Seconds since the connection was accepted.
    pub fn duration_seconds(&self) -> f64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds() as f64
            / 1000.0
    }

    pub fn handle_text(&mut self, text: &str) -> SessionAction {
        let text = text.trim();
        if text == PING {
            return SessionAction::Reply(ServerFrame::text(PONG));
        }

        match self.status {
            SessionStatus::AwaitingHeaders => match DeviceHeaders::parse(text) {
                Ok(headers) => {
                    debug!(
                        session_id = %self.id,
                        user_id = %headers.user_id,
                        device_id = %headers.device_id,
                        language = %headers.language,
                        "Headers received"
                    );
                    self.headers = Some(headers);
                    self.status = SessionStatus::Accumulating;
                    SessionAction::Reply(ServerFrame::text(HEADERS_ACCEPTED))
                }
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "Invalid headers frame");
                    SessionAction::Reply(ServerFrame::text(INVALID_HEADERS))
                }
            },
            SessionStatus::Processing => SessionAction::Reply(ServerFrame::text(BUSY)),
            SessionStatus::Accumulating if text == END_OF_STREAM => self.end_of_stream(),
            SessionStatus::Accumulating => {
                SessionAction::Reply(ServerFrame::text(UNSUPPORTED_CONTROL))
            }
        }
    }

    pub fn handle_binary(&mut self, frame: &[u8]) -> SessionAction {
        match self.status {
            SessionStatus::AwaitingHeaders => {
                warn!(session_id = %self.id, bytes = frame.len(), "PCM received before headers");
                SessionAction::Reply(ServerFrame::text(HEADERS_REQUIRED))
            }
            SessionStatus::Processing => {
                warn!(session_id = %self.id, bytes = frame.len(), "PCM received while processing");
                SessionAction::Reply(ServerFrame::text(BUSY))
            }
            SessionStatus::Accumulating => {
                self.summary.total_audio_bytes += frame.len();
                if self.overflow.is_some() {
                    return SessionAction::None;
                }
                if let Err(overflow) = self.buffer.append(frame) {
                    warn!(
                        session_id = %self.id,
                        %overflow,
                        "Utterance too large, discarding until EOS"
                    );
                    self.buffer.clear();
                    self.overflow = Some(overflow);
                }
                SessionAction::None
            }
        }
    }

    /// Handle one frame of a fragmented message.
    ///
    /// Binary pieces are appended in arrival order exactly as unfragmented
    /// frames are. Text is reassembled and handled when the last piece arrives.
    pub fn handle_fragment(&mut self, fragment: Fragment<'_>) -> SessionAction {
        match fragment {
            Fragment::FirstText(data) => {
                self.pending = Some(PendingMessage::Text(Some(Vec::new())));
                self.push_text_fragment(data);
                SessionAction::None
            }
            Fragment::FirstBinary(data) => {
                self.pending = Some(PendingMessage::Binary);
                self.handle_binary(data)
            }
            Fragment::Continue(data) => self.continue_message(data),
            Fragment::Last(data) => {
                let action = self.continue_message(data);
                match self.pending.take() {
                    Some(PendingMessage::Text(Some(bytes))) => {
                        self.handle_text(&String::from_utf8_lossy(&bytes))
                    }
                    Some(PendingMessage::Text(None)) => {
                        warn!(session_id = %self.id, "Fragmented text message too long");
                        // Too long to be a handshake or a control word.
                        self.handle_text("")
                    }
                    _ => action,
                }
            }
        }
    }

    fn continue_message(&mut self, data: &[u8]) -> SessionAction {
        match self.pending {
            Some(PendingMessage::Text(_)) => {
                self.push_text_fragment(data);
                SessionAction::None
            }
            Some(PendingMessage::Binary) if self.status == SessionStatus::Accumulating => {
                self.handle_binary(data)
            }
            // The first piece already drew the notice.
            Some(PendingMessage::Binary) => SessionAction::None,
            None => {
                warn!(
                    session_id = %self.id,
                    bytes = data.len(),
                    "Continuation frame without a message start"
                );
                SessionAction::None
            }
        }
    }

    fn push_text_fragment(&mut self, data: &[u8]) {
        if let Some(PendingMessage::Text(slot)) = &mut self.pending {
            match slot {
                Some(bytes) if bytes.len() + data.len() <= MAX_TEXT_MESSAGE_BYTES => {
                    bytes.extend_from_slice(data)
                }
                _ => *slot = None,
            }
        }
    }

    /// Validate the buffered utterance. The buffer is emptied either way.
    fn end_of_stream(&mut self) -> SessionAction {
        let pcm = self.buffer.take();

        if let Some(overflow) = self.overflow.take() {
            self.summary.utterances_rejected += 1;
            return SessionAction::Reply(ServerFrame::Text(format!(
                "Rejected utterance: {}",
                overflow
            )));
        }

        let headers = self.headers.clone().unwrap_or_default();
        match UtteranceRequest::validate(&headers, pcm, &self.limits) {
            Ok(request) => {
                debug!(session_id = %self.id, bytes = request.pcm.len(), "Utterance accepted");
                self.status = SessionStatus::Processing;
                SessionAction::Process(request)
            }
            Err(err) => {
                warn!(session_id = %self.id, reason = %err, "Utterance rejected");
                self.summary.utterances_rejected += 1;
                SessionAction::Reply(ServerFrame::Text(format!("Rejected utterance: {}", err)))
            }
        }
    }

    /// Record the pipeline result and return the frames to send.
    pub fn complete(
        &mut self,
        result: &Result<UtteranceOutcome, PipelineError>,
    ) -> Vec<ServerFrame> {
        self.status = SessionStatus::Accumulating;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.summary.pipeline_failures += 1;
                return vec![ServerFrame::Text(format!("Processing error: {}", err))];
            }
        };

        self.summary.utterances_processed += 1;
        let emotion = outcome.reply.emotion;
        if self.last_emotion != Some(emotion) {
            debug!(
                session_id = %self.id,
                from = ?self.last_emotion,
                to = %emotion,
                "Emotion changed"
            );
        }
        self.last_emotion = Some(emotion);

        let mut frames = Vec::new();
        if self.profile.send_emotion {
            frames.push(ServerFrame::text(emotion.as_str()));
        }
        if self.profile.send_message {
            frames.push(ServerFrame::text(outcome.reply.message.clone()));
        }
        if self.profile.send_audio {
            if let Some(audio) = &outcome.audio {
                frames.push(ServerFrame::Binary(audio.clone()));
            }
        }
        frames
    }
}

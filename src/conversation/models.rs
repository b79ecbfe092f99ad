//! Conversation records and the serialized message log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub content: String,
    /// RFC 3339, UTC.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered message history, serialized as `{"messages": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl MessageLog {
    /// Decode a stored blob. An empty blob is an empty log.
    pub fn from_blob(blob: &[u8]) -> Result<Self, serde_json::Error> {
        if blob.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(blob)
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A persisted conversation row.
///
/// `message_log` stays opaque at the storage layer; decode it with
/// [`Conversation::messages`].
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub user_id: Uuid,
    pub message_log: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn messages(&self) -> Result<MessageLog, serde_json::Error> {
        MessageLog::from_blob(&self.message_log)
    }
}

/// Identity and timestamp returned by a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedConversation {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// Read-only slice of a user's profile used to personalise the system prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub first_name: Option<String>,
    pub open_tasks: Vec<TaskSummary>,
    pub interests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
    pub id: i64,
    pub title: String,
    pub due_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// The log survives a store/load cycle with order and timestamps intact.
    #[test]
    fn test_log_blob_round_trip() {
        let mut log = MessageLog::default();
        log.push(Message::new(Sender::User, "what is my next task"));
        log.push(Message::new(Sender::Assistant, "feed the cat"));

        let decoded = MessageLog::from_blob(&log.to_blob().unwrap()).unwrap();
        assert_eq!(decoded, log);
        assert_eq!(decoded.messages[0].sender, Sender::User);
        assert_eq!(decoded.messages[1].sender, Sender::Assistant);
    }

    /// Rows written with second-precision `Z` timestamps still load.
    #[test]
    fn test_log_accepts_existing_row_format() {
        let blob = br#"{"messages":[{"sender":"user","content":"hi","timestamp":"2024-05-01T08:30:00Z"},{"sender":"assistant","content":"hello","timestamp":"2024-05-01T08:30:02Z"}]}"#;
        let log = MessageLog::from_blob(blob).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(
            log.messages[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
        );
        assert_eq!(log.messages[1].content, "hello");
    }

    #[test]
    fn test_empty_blob_is_empty_log() {
        assert!(MessageLog::from_blob(b"").unwrap().is_empty());
        assert!(MessageLog::from_blob(b"{}").unwrap().is_empty());
    }

    /// Unknown senders are rejected rather than silently coerced.
    #[test]
    fn test_unknown_sender_rejected() {
        let blob = br#"{"messages":[{"sender":"robot","content":"x","timestamp":"2024-05-01T08:30:00Z"}]}"#;
        assert!(MessageLog::from_blob(blob).is_err());
    }
}

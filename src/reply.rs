//! # Structured Replies
//!
//! The language model is asked to answer with a JSON object:
//!
//! ```json
//! {"message": "...", "emotion": "cute_smile", "task_completion": {"task": "5", "completed": "true"}}
//! ```
//!
//! Models regularly wrap that object in prose or code fences, pick emotions
//! outside the animation set, or fill `task_completion` halfway. This module
//! turns raw model text into a [`StructuredReply`] or a [`ReplyError`]
//! describing the first rule that failed; callers substitute
//! [`StructuredReply::fallback`] on error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Animations the device can play. Anything else from the model is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Celebration,
    Suspicious,
    CuteSmile,
    Curiosity,
    Confused,
    Sleep,
    LuckySmile,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Celebration,
        Emotion::Suspicious,
        Emotion::CuteSmile,
        Emotion::Curiosity,
        Emotion::Confused,
        Emotion::Sleep,
        Emotion::LuckySmile,
        Emotion::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Celebration => "celebration",
            Emotion::Suspicious => "suspicious",
            Emotion::CuteSmile => "cute_smile",
            Emotion::Curiosity => "curiosity",
            Emotion::Confused => "confused",
            Emotion::Sleep => "sleep",
            Emotion::LuckySmile => "lucky_smile",
            Emotion::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = ReplyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|emotion| emotion.as_str() == s)
            .ok_or_else(|| ReplyError::UnknownEmotion(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCompletion {
    pub task: String,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredReply {
    pub message: String,
    pub emotion: Emotion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_completion: Option<TaskCompletion>,
}

const FALLBACK_MESSAGE: &str = "I didn't quite understand that. Could you please try again?";

impl StructuredReply {
    /// Reply used whenever model output fails validation.
    pub fn fallback() -> Self {
        Self {
            message: FALLBACK_MESSAGE.to_string(),
            emotion: Emotion::Confused,
            task_completion: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("no JSON object found in model output")]
    MissingObject,

    #[error("model output is not valid reply JSON: {0}")]
    Malformed(String),

    #[error("reply message is empty")]
    EmptyMessage,

    #[error("unknown emotion: {0}")]
    UnknownEmotion(String),

    #[error("task_completion needs both task and completed")]
    PartialTaskCompletion,

    #[error("task_completion.completed must be true or false, got {0:?}")]
    InvalidCompletedFlag(String),
}

/// Turns raw model text into a reply. Kept behind a trait so a stricter
/// extractor can replace the brace heuristic without touching the pipeline.
pub trait ReplyParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<StructuredReply, ReplyError>;
}

/// Takes the span from the first `{` to the last `}` and validates it.
///
/// Trailing prose that itself contains a `}` widens the span and fails the
/// parse, which lands on the fallback reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceSpanParser;

impl ReplyParser for BraceSpanParser {
    fn parse(&self, raw: &str) -> Result<StructuredReply, ReplyError> {
        let span = extract_object_span(raw).ok_or(ReplyError::MissingObject)?;
        let candidate: RawReply =
            serde_json::from_str(span).map_err(|err| ReplyError::Malformed(err.to_string()))?;
        candidate.validate()
    }
}

fn extract_object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Loosely typed shape of what the model produced.
#[derive(Debug, Deserialize)]
struct RawReply {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    task_completion: Option<RawTaskCompletion>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTaskCompletion {
    #[serde(default)]
    task: Option<Scalar>,
    #[serde(default)]
    completed: Option<Scalar>,
}

/// Models emit task ids and flags as strings, numbers or booleans.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Number(number) => number.to_string(),
            Scalar::Bool(flag) => flag.to_string(),
        }
    }
}

impl RawReply {
    fn validate(self) -> Result<StructuredReply, ReplyError> {
        let message = self.message.unwrap_or_default();
        if message.trim().is_empty() {
            return Err(ReplyError::EmptyMessage);
        }

        let emotion = match self.emotion.as_deref().map(str::trim) {
            None | Some("") => Emotion::CuteSmile,
            Some(tag) => tag.parse()?,
        };

        let task_completion = match self.task_completion {
            None => None,
            Some(raw) => raw.validate()?,
        };

        Ok(StructuredReply {
            message,
            emotion,
            task_completion,
        })
    }
}

impl RawTaskCompletion {
    fn validate(self) -> Result<Option<TaskCompletion>, ReplyError> {
        let task = self
            .task
            .map(Scalar::into_text)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        let completed = self
            .completed
            .map(Scalar::into_text)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        match (task.is_empty(), completed.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => {
                let completed = if completed.eq_ignore_ascii_case("true") {
                    true
                } else if completed.eq_ignore_ascii_case("false") {
                    false
                } else {
                    return Err(ReplyError::InvalidCompletedFlag(completed));
                };
                Ok(Some(TaskCompletion { task, completed }))
            }
            _ => Err(ReplyError::PartialTaskCompletion),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<StructuredReply, ReplyError> {
        BraceSpanParser.parse(raw)
    }

    /// Prose and code fences around the object are ignored.
    #[test]
    fn test_object_wrapped_in_prose() {
        let raw = "Sure! ```json\n{\"message\": \"Hi there\", \"emotion\": \"curiosity\"}\n``` Hope that helps";
        let reply = parse(raw).unwrap();
        assert_eq!(reply.message, "Hi there");
        assert_eq!(reply.emotion, Emotion::Curiosity);
        assert_eq!(reply.task_completion, None);
    }

    #[test]
    fn test_task_completion_parsed() {
        let raw = r#"{"message":"Great job!","emotion":"celebration","task_completion":{"task":"5","completed":"TRUE"}}"#;
        let reply = parse(raw).unwrap();
        assert_eq!(
            reply.task_completion,
            Some(TaskCompletion {
                task: "5".to_string(),
                completed: true
            })
        );
    }

    /// Numeric task ids and boolean flags are normalised to text first.
    #[test]
    fn test_task_completion_scalars() {
        let raw = r#"{"message":"ok","emotion":"sleep","task_completion":{"task":7,"completed":false}}"#;
        let reply = parse(raw).unwrap();
        assert_eq!(
            reply.task_completion,
            Some(TaskCompletion {
                task: "7".to_string(),
                completed: false
            })
        );
    }

    #[test]
    fn test_empty_task_completion_is_none() {
        let raw = r#"{"message":"ok","emotion":"sleep","task_completion":{"task":"","completed":""}}"#;
        assert_eq!(parse(raw).unwrap().task_completion, None);
    }

    #[test]
    fn test_missing_emotion_defaults() {
        let reply = parse(r#"{"message":"Hello"}"#).unwrap();
        assert_eq!(reply.emotion, Emotion::CuteSmile);
        let reply = parse(r#"{"message":"Hello","emotion":""}"#).unwrap();
        assert_eq!(reply.emotion, Emotion::CuteSmile);
    }

    #[test]
    fn test_no_braces() {
        assert_eq!(parse("just words"), Err(ReplyError::MissingObject));
        assert_eq!(parse("} backwards {"), Err(ReplyError::MissingObject));
    }

    #[test]
    fn test_missing_message() {
        assert_eq!(
            parse(r#"{"emotion":"sleep"}"#),
            Err(ReplyError::EmptyMessage)
        );
    }

    #[test]
    fn test_unknown_emotion() {
        assert_eq!(
            parse(r#"{"message":"Hi","emotion":"angry"}"#),
            Err(ReplyError::UnknownEmotion("angry".to_string()))
        );
    }

    #[test]
    fn test_partial_task_completion() {
        assert_eq!(
            parse(r#"{"message":"Hi","emotion":"sleep","task_completion":{"task":"5"}}"#),
            Err(ReplyError::PartialTaskCompletion)
        );
    }

    #[test]
    fn test_invalid_completed_flag() {
        assert_eq!(
            parse(r#"{"message":"Hi","emotion":"sleep","task_completion":{"task":"5","completed":"maybe"}}"#),
            Err(ReplyError::InvalidCompletedFlag("maybe".to_string()))
        );
    }

    /// A stray closing brace after the object widens the span and fails.
    #[test]
    fn test_trailing_brace_in_prose_fails() {
        let raw = r#"{"message":"Hi","emotion":"sleep"} and then }"#;
        assert!(matches!(parse(raw), Err(ReplyError::Malformed(_))));
    }

    #[test]
    fn test_fallback_reply() {
        let fallback = StructuredReply::fallback();
        assert_eq!(fallback.emotion, Emotion::Confused);
        assert_eq!(fallback.message, FALLBACK_MESSAGE);
        assert!(fallback.task_completion.is_none());
    }

    #[test]
    fn test_emotion_round_trip_through_str() {
        for emotion in Emotion::ALL {
            assert_eq!(emotion.as_str().parse::<Emotion>().unwrap(), emotion);
        }
        assert!("Celebration".parse::<Emotion>().is_err());
    }
}

//! # Conversation Module
//!
//! Everything between a validated utterance and a persisted reply.
//!
//! ## Key Components:
//! - **models**: conversation rows and the JSON message log
//! - **request**: device headers and utterance validation
//! - **store**: SQLite persistence with a reuse window
//! - **pipeline**: transcription → generation → validation → storage → synthesis

pub mod models;
pub mod pipeline;
pub mod request;
pub mod store;

pub use pipeline::{ConversationPipeline, ConversationPolicy, PipelineError, UtteranceOutcome};
pub use request::{DeviceHeaders, UtteranceError, UtteranceLimits, UtteranceRequest};
pub use store::ConversationStore;

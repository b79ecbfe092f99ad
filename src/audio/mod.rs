//! # Audio Module
//!
//! Per-connection audio handling for device utterances.
//!
//! ## Key Components:
//! - **buffer**: accumulates PCM frames until the end-of-stream marker
//! - **session**: the device protocol state machine (handshake, accumulate, process)
//! - **wav**: wraps raw PCM in a RIFF/WAVE envelope for the upstream services
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! The socket itself lives in `src/websocket.rs`.

pub mod buffer;
pub mod session;
pub mod wav;

//! Vocalis Gateway - real-time voice conversation backend
//!
//! A client streams microphone audio over a WebSocket. The gateway:
//! - Transcribes it through a streaming speech recognizer, reconnecting
//!   transparently when the provider caps a session
//! - Answers each final transcript with a streamed LLM reply
//! - Splits the reply into speakable segments and synthesizes them in order
//! - Streams the audio back, with control notices and an emotion label
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  WebSocket client                     │
//! │        audio frames  │  control text  │  audio out    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                   Coordinator                         │
//! │  Audio queue │ STT supervisor │ Reply │ Emotion       │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                Hosted providers                       │
//! │        Deepgram  │  OpenAI  │  ElevenLabs             │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};

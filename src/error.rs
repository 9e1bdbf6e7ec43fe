//! Error types for Vocalis gateway

use thiserror::Error;

/// Result type alias for Vocalis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Vocalis gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Speech-to-text error that is fatal to the recognition session
    #[error("STT error: {0}")]
    Stt(String),

    /// Recognition session exceeded the service's maximum duration
    #[error("STT session timed out: {0}")]
    SttTimeout(String),

    /// Reconnection attempts exhausted
    #[error("STT reconnection failed after {attempts} attempts")]
    SttReconnectFailed { attempts: u32 },

    /// Text generation error
    #[error("generation error: {0}")]
    Generation(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Upstream quota or rate limit exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Emotion analysis error
    #[error("emotion analysis error: {0}")]
    Emotion(String),

    /// Client transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the upstream service rejected the request for quota reasons
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Whether a recognition session ended because it ran too long
    #[must_use]
    pub const fn is_stt_timeout(&self) -> bool {
        matches!(self, Self::SttTimeout(_))
    }
}

//! Streaming text-to-speech (TTS)

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::config::{TtsConfig, TtsProvider};
use crate::{Error, Result};

/// Stream of encoded audio bytes for one utterance
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

/// Converts text to streamed audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected; [`Error::RateLimited`] for
    /// quota errors
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;

    /// MIME type of the produced audio
    fn content_type(&self) -> &'static str {
        "audio/mpeg"
    }
}

/// Drain an audio stream into one buffer
///
/// # Errors
///
/// Returns the first stream error
pub async fn collect_audio(stream: AudioStream) -> Result<Bytes> {
    let chunks: Vec<Bytes> = stream.try_collect().await?;
    Ok(chunks.concat().into())
}

/// Synthesizes speech through a hosted provider
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    response_format: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a TTS client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            Error::Config(format!(
                "{} API key required for TTS",
                config.provider.as_str()
            ))
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
            response_format: config.response_format.clone(),
            provider: config.provider,
        })
    }

    /// Request streamed speech from `OpenAI`
    async fn request_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: &self.response_format,
        };

        Ok(self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&request)
            .send()
            .await?)
    }

    /// Request streamed speech from ElevenLabs
    async fn request_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream",
            self.voice
        );

        Ok(self
            .client
            .post(&url)
            .query(&[("output_format", self.elevenlabs_format())])
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await?)
    }

    fn elevenlabs_format(&self) -> &str {
        if self.response_format.contains('_') {
            &self.response_format
        } else {
            "mp3_44100_128"
        }
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        tracing::debug!(provider = self.provider.as_str(), chars = text.len(), "synthesizing");

        let response = match self.provider {
            TtsProvider::OpenAi => self.request_openai(text).await?,
            TtsProvider::ElevenLabs => self.request_elevenlabs(text).await?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let provider = self.provider.as_str();
            tracing::warn!(status = %status, provider, "TTS API error");
            if status.as_u16() == 429 {
                return Err(Error::RateLimited(format!("{provider} TTS: {body}")));
            }
            return Err(Error::Tts(format!("{provider} TTS error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| Error::Tts(format!("audio stream interrupted: {e}")))
            .boxed())
    }

    fn content_type(&self) -> &'static str {
        let format = match self.provider {
            TtsProvider::OpenAi => self.response_format.as_str(),
            TtsProvider::ElevenLabs => self.elevenlabs_format(),
        };
        content_type_for(format)
    }
}

/// MIME type for a provider audio format name
#[must_use]
pub fn content_type_for(format: &str) -> &'static str {
    match format.split('_').next().unwrap_or(format) {
        "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pcm" => "audio/pcm",
        "ulaw" => "audio/basic",
        _ => "audio/mpeg",
    }
}

//! Configuration management for Vocalis gateway
//!
//! Values resolve as env > TOML file > built-in defaults.

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::voice::{ActivityPolicy, ReconnectPolicy, SynthesisStrategy};
use crate::{Error, Result};

/// Default worker count for parallel synthesis
pub const DEFAULT_SYNTHESIS_WORKERS: usize = 3;

/// Vocalis gateway configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub pipeline: PipelineConfig,
    pub reconnect: ReconnectPolicy,
    pub emotion: EmotionConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS origins; empty or `*` allows any
    pub allowed_origins: Vec<String>,
    /// Receive timeout after which a quiet connection re-checks liveness
    pub idle_timeout: Duration,
    /// WebSocket upgrades allowed per minute, 0 for unlimited
    pub connections_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            idle_timeout: Duration::from_secs(30),
            connections_per_minute: 0,
        }
    }
}

/// Streaming speech recognition configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: Option<SecretString>,
    pub endpoint: String,
    pub model: String,
    pub language: String,
    /// Client audio sample rate in Hz
    pub sample_rate: u32,
    pub encoding: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-2".to_string(),
            language: "en-US".to_string(),
            sample_rate: 16_000,
            encoding: "linear16".to_string(),
        }
    }
}

/// Text generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a friendly voice assistant. Answer in short, natural spoken \
                            sentences without markdown, lists, or emoji."
                .to_string(),
            max_tokens: None,
            temperature: 0.7,
        }
    }
}

/// Speech synthesis provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    #[default]
    OpenAi,
    ElevenLabs,
}

impl TtsProvider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::ElevenLabs => "elevenlabs",
        }
    }

    const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "tts-1",
            Self::ElevenLabs => "eleven_turbo_v2_5",
        }
    }

    const fn default_voice(self) -> &'static str {
        match self {
            Self::OpenAi => "alloy",
            Self::ElevenLabs => "21m00Tcm4TlvDq8ikWAM",
        }
    }
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" | "eleven_labs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    /// Audio container returned by the provider
    pub response_format: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let provider = TtsProvider::default();
        Self {
            provider,
            api_key: None,
            model: provider.default_model().to_string(),
            voice: provider.default_voice().to_string(),
            speed: 1.0,
            response_format: "mp3".to_string(),
        }
    }
}

/// Reply pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub segment_min_length: usize,
    pub punctuation: String,
    pub synthesis: SynthesisStrategy,
    /// Barge-in detection on recognition activity
    pub activity: ActivityPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_min_length: crate::voice::DEFAULT_MIN_LENGTH,
            punctuation: crate::voice::DEFAULT_PUNCTUATION.to_string(),
            synthesis: SynthesisStrategy::Sequential,
            activity: ActivityPolicy::default(),
        }
    }
}

/// Emotion analysis configuration
#[derive(Debug, Clone)]
pub struct EmotionConfig {
    pub enabled: bool,
    /// Model override; the LLM model is used when unset
    pub model: Option<String>,
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: None,
        }
    }
}

fn parse_strategy(name: &str, workers: usize) -> Result<SynthesisStrategy> {
    match name.to_lowercase().as_str() {
        "sequential" => Ok(SynthesisStrategy::Sequential),
        "parallel" => Ok(SynthesisStrategy::Parallel {
            workers: workers.max(1),
        }),
        other => Err(Error::Config(format!("unknown synthesis strategy: {other}"))),
    }
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.is_empty()).map(SecretString::from)
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a named provider or strategy is unknown
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a named provider or strategy is unknown
    pub fn from_sources<F>(fc: file::VocalisConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        // Server (env > toml > default)
        let server_default = ServerConfig::default();
        let server = ServerConfig {
            host: var("VOCALIS_HOST")
                .or(fc.server.host)
                .unwrap_or(server_default.host),
            port: var("VOCALIS_PORT")
                .or_else(|| var("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(server_default.port),
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
                .or(fc.server.allowed_origins)
                .unwrap_or(server_default.allowed_origins),
            idle_timeout: parsed("VOCALIS_IDLE_TIMEOUT_SECS")
                .or(fc.server.idle_timeout_secs)
                .map_or(server_default.idle_timeout, Duration::from_secs),
            connections_per_minute: var("VOCALIS_CONNECTIONS_PER_MINUTE")
                .and_then(|s| s.parse().ok())
                .or(fc.server.connections_per_minute)
                .unwrap_or(server_default.connections_per_minute),
        };

        // Speech recognition
        let stt_default = SttConfig::default();
        let stt = SttConfig {
            api_key: secret(var("DEEPGRAM_API_KEY").or(fc.stt.api_key)),
            endpoint: var("VOCALIS_STT_ENDPOINT")
                .or(fc.stt.endpoint)
                .unwrap_or(stt_default.endpoint),
            model: var("VOCALIS_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or(stt_default.model),
            language: var("VOCALIS_STT_LANGUAGE")
                .or(fc.stt.language)
                .unwrap_or(stt_default.language),
            sample_rate: var("VOCALIS_STT_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.stt.sample_rate)
                .unwrap_or(stt_default.sample_rate),
            encoding: fc.stt.encoding.unwrap_or(stt_default.encoding),
        };

        // Text generation
        let openai_key = var("OPENAI_API_KEY");
        let llm_default = LlmConfig::default();
        let llm = LlmConfig {
            api_key: secret(openai_key.clone().or(fc.llm.api_key)),
            base_url: var("VOCALIS_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or(llm_default.base_url),
            model: var("VOCALIS_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(llm_default.model),
            system_prompt: var("VOCALIS_SYSTEM_PROMPT")
                .or(fc.llm.system_prompt)
                .unwrap_or(llm_default.system_prompt),
            max_tokens: fc.llm.max_tokens,
            temperature: fc.llm.temperature.unwrap_or(llm_default.temperature),
        };

        // Speech synthesis; the key follows the chosen provider
        let provider = var("VOCALIS_TTS_PROVIDER")
            .or(fc.tts.provider)
            .map(|p| p.parse::<TtsProvider>())
            .transpose()?
            .unwrap_or_default();
        let provider_key = match provider {
            TtsProvider::OpenAi => openai_key,
            TtsProvider::ElevenLabs => var("ELEVENLABS_API_KEY"),
        };
        let tts = TtsConfig {
            provider,
            api_key: secret(provider_key.or(fc.tts.api_key)),
            model: var("VOCALIS_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or_else(|| provider.default_model().to_string()),
            voice: var("VOCALIS_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| provider.default_voice().to_string()),
            speed: fc.tts.speed.unwrap_or(1.0),
            response_format: fc.tts.response_format.unwrap_or_else(|| "mp3".to_string()),
        };

        // Pipeline
        let pipeline_default = PipelineConfig::default();
        let workers = var("VOCALIS_SYNTHESIS_WORKERS")
            .and_then(|s| s.parse().ok())
            .or(fc.pipeline.workers)
            .unwrap_or(DEFAULT_SYNTHESIS_WORKERS);
        let synthesis = var("VOCALIS_SYNTHESIS")
            .or(fc.pipeline.synthesis)
            .map(|name| parse_strategy(&name, workers))
            .transpose()?
            .unwrap_or(pipeline_default.synthesis);
        let activity_default = pipeline_default.activity;
        let pipeline = PipelineConfig {
            segment_min_length: fc
                .pipeline
                .segment_min_length
                .unwrap_or(pipeline_default.segment_min_length),
            punctuation: fc
                .pipeline
                .punctuation
                .filter(|p| !p.is_empty())
                .unwrap_or(pipeline_default.punctuation),
            synthesis,
            activity: ActivityPolicy {
                enabled: var("VOCALIS_BARGE_IN")
                    .and_then(|s| s.parse().ok())
                    .or(fc.pipeline.barge_in)
                    .unwrap_or(activity_default.enabled),
                min_interval: fc
                    .pipeline
                    .barge_in_interval_ms
                    .map_or(activity_default.min_interval, Duration::from_millis),
                speech_only: fc
                    .pipeline
                    .barge_in_speech_only
                    .unwrap_or(activity_default.speech_only),
            },
        };

        // Reconnect backoff
        let reconnect_default = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            initial_delay: fc
                .reconnect
                .initial_delay_ms
                .map_or(reconnect_default.initial_delay, Duration::from_millis),
            factor: fc.reconnect.factor.unwrap_or(reconnect_default.factor),
            max_delay: fc
                .reconnect
                .max_delay_ms
                .map_or(reconnect_default.max_delay, Duration::from_millis),
            max_attempts: var("VOCALIS_STT_MAX_RECONNECTS")
                .and_then(|s| s.parse().ok())
                .or(fc.reconnect.max_attempts)
                .unwrap_or(reconnect_default.max_attempts),
        };

        let emotion = EmotionConfig {
            enabled: var("VOCALIS_EMOTION_ENABLED")
                .and_then(|s| s.parse().ok())
                .or(fc.emotion.enabled)
                .unwrap_or(true),
            model: var("VOCALIS_EMOTION_MODEL").or(fc.emotion.model),
        };

        Ok(Self {
            server,
            stt,
            llm,
            tts,
            pipeline,
            reconnect,
            emotion,
        })
    }

    /// Effective configuration as JSON with secrets reduced to "set" or "unset"
    #[must_use]
    pub fn redacted(&self) -> serde_json::Value {
        let key_state = |key: &Option<SecretString>| if key.is_some() { "set" } else { "unset" };
        let synthesis = match self.pipeline.synthesis {
            SynthesisStrategy::Sequential => serde_json::json!({ "strategy": "sequential" }),
            SynthesisStrategy::Parallel { workers } => {
                serde_json::json!({ "strategy": "parallel", "workers": workers })
            }
        };

        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "allowed_origins": self.server.allowed_origins,
                "idle_timeout_secs": self.server.idle_timeout.as_secs(),
                "connections_per_minute": self.server.connections_per_minute,
            },
            "stt": {
                "api_key": key_state(&self.stt.api_key),
                "endpoint": self.stt.endpoint,
                "model": self.stt.model,
                "language": self.stt.language,
                "sample_rate": self.stt.sample_rate,
                "encoding": self.stt.encoding,
            },
            "llm": {
                "api_key": key_state(&self.llm.api_key),
                "base_url": self.llm.base_url,
                "model": self.llm.model,
                "max_tokens": self.llm.max_tokens,
                "temperature": self.llm.temperature,
            },
            "tts": {
                "provider": self.tts.provider.as_str(),
                "api_key": key_state(&self.tts.api_key),
                "model": self.tts.model,
                "voice": self.tts.voice,
                "speed": self.tts.speed,
                "response_format": self.tts.response_format,
            },
            "pipeline": {
                "segment_min_length": self.pipeline.segment_min_length,
                "punctuation": self.pipeline.punctuation,
                "synthesis": synthesis,
                "barge_in": self.pipeline.activity.enabled,
            },
            "reconnect": {
                "initial_delay_ms": u64::try_from(self.reconnect.initial_delay.as_millis()).unwrap_or(u64::MAX),
                "factor": self.reconnect.factor,
                "max_delay_ms": u64::try_from(self.reconnect.max_delay.as_millis()).unwrap_or(u64::MAX),
                "max_attempts": self.reconnect.max_attempts,
            },
            "emotion": {
                "enabled": self.emotion.enabled,
                "model": self.emotion.model,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(file::VocalisConfigFile::default(), env(&[])).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.stt.sample_rate, 16_000);
        assert_eq!(config.pipeline.segment_min_length, 10);
        assert_eq!(config.pipeline.synthesis, SynthesisStrategy::Sequential);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.llm.api_key.is_none());
        assert!(config.emotion.enabled);
    }

    #[test]
    fn env_overrides_file() {
        let fc: file::VocalisConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            host = "127.0.0.1"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(fc, env(&[("VOCALIS_PORT", "7000")])).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn tts_key_follows_provider() {
        let config = Config::from_sources(
            file::VocalisConfigFile::default(),
            env(&[
                ("VOCALIS_TTS_PROVIDER", "elevenlabs"),
                ("OPENAI_API_KEY", "sk-openai"),
                ("ELEVENLABS_API_KEY", "xi-key"),
            ]),
        )
        .unwrap();
        assert_eq!(config.tts.provider, TtsProvider::ElevenLabs);
        assert_eq!(config.tts.api_key.unwrap().expose_secret(), "xi-key");
        assert_eq!(config.llm.api_key.unwrap().expose_secret(), "sk-openai");
        assert_eq!(config.tts.model, "eleven_turbo_v2_5");
    }

    #[test]
    fn parallel_strategy_reads_workers() {
        let config = Config::from_sources(
            file::VocalisConfigFile::default(),
            env(&[("VOCALIS_SYNTHESIS", "parallel"), ("VOCALIS_SYNTHESIS_WORKERS", "4")]),
        )
        .unwrap();
        assert_eq!(config.pipeline.synthesis, SynthesisStrategy::Parallel { workers: 4 });
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let err = Config::from_sources(
            file::VocalisConfigFile::default(),
            env(&[("VOCALIS_TTS_PROVIDER", "robot")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_sources(
            file::VocalisConfigFile::default(),
            env(&[("VOCALIS_SYNTHESIS", "warp")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn redacted_hides_keys() {
        let config = Config::from_sources(
            file::VocalisConfigFile::default(),
            env(&[("DEEPGRAM_API_KEY", "dg-secret")]),
        )
        .unwrap();
        let json = config.redacted();
        assert_eq!(json["stt"]["api_key"], "set");
        assert_eq!(json["llm"]["api_key"], "unset");
        assert!(!json.to_string().contains("dg-secret"));
    }
}

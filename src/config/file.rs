//! TOML configuration file loading
//!
//! Supports `~/.config/vocalis/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VocalisConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    #[serde(default)]
    pub emotion: EmotionFileConfig,
}

/// HTTP server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// CORS origins; `["*"]` allows any
    pub allowed_origins: Option<Vec<String>>,
    /// Seconds a quiet connection waits before re-checking liveness
    pub idle_timeout_secs: Option<u64>,
    /// WebSocket upgrades allowed per minute (0 disables the limit)
    pub connections_per_minute: Option<u32>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub sample_rate: Option<u32>,
    pub encoding: Option<String>,
}

/// Text generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub response_format: Option<String>,
}

/// Reply pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub segment_min_length: Option<usize>,
    pub punctuation: Option<String>,
    /// "sequential" or "parallel"
    pub synthesis: Option<String>,
    pub workers: Option<usize>,
    pub barge_in: Option<bool>,
    pub barge_in_interval_ms: Option<u64>,
    pub barge_in_speech_only: Option<bool>,
}

/// Recognition reconnect backoff
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub initial_delay_ms: Option<u64>,
    pub factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Emotion analysis configuration
#[derive(Debug, Default, Deserialize)]
pub struct EmotionFileConfig {
    pub enabled: Option<bool>,
    pub model: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VocalisConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VocalisConfigFile {
    config_file_path().map_or_else(VocalisConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> VocalisConfigFile {
    if !path.exists() {
        return VocalisConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VocalisConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VocalisConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/vocalis/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("vocalis").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc: VocalisConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [pipeline]
            synthesis = "parallel"
            workers = 3
            "#,
        )
        .unwrap();

        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.server.host, None);
        assert_eq!(fc.pipeline.synthesis.as_deref(), Some("parallel"));
        assert_eq!(fc.pipeline.workers, Some(3));
        assert!(fc.stt.api_key.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let fc = load_from(Path::new("/nonexistent/vocalis/config.toml"));
        assert!(fc.server.port.is_none());
    }
}

//! Emotion classification of user utterances

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::control::EmotionResult;
use super::llm::classify_failure;
use crate::config::{EmotionConfig, LlmConfig};
use crate::{Error, Result};

/// Labels the classifier may answer with
pub const EMOTION_LABELS: &[&str] = &[
    "joy",
    "anger",
    "annoyance",
    "upset",
    "sadness",
    "happiness",
    "surprise",
    "embarrassment",
    "boredom",
    "weariness",
];

/// Label reported when classification fails
pub const NEUTRAL: &str = "neutral";

/// Classifies the emotion of a piece of text
#[async_trait]
pub trait EmotionAnalyzer: Send + Sync {
    /// Return one of [`EMOTION_LABELS`]
    ///
    /// # Errors
    ///
    /// Returns error if the service fails or answers outside the label set
    async fn analyze(&self, text: &str) -> Result<String>;
}

/// Classify `text`, falling back to [`NEUTRAL`] with the error attached
pub async fn classify(analyzer: &dyn EmotionAnalyzer, text: &str) -> EmotionResult {
    match analyzer.analyze(text).await {
        Ok(emotion) => EmotionResult {
            emotion,
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "emotion analysis failed");
            EmotionResult {
                emotion: NEUTRAL.to_string(),
                error: Some(e.to_string()),
            }
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmotionPayload {
    emotion: String,
}

/// Emotion classifier on an OpenAI-compatible endpoint with JSON schema output
pub struct OpenAiEmotionAnalyzer {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiEmotionAnalyzer {
    /// Create an analyzer sharing the LLM endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(llm: &LlmConfig, emotion: &EmotionConfig) -> Result<Self> {
        let api_key = llm
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("LLM API key required for emotion analysis".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            model: emotion.model.clone().unwrap_or_else(|| llm.model.clone()),
        })
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {
                    "role": "system",
                    "content": "Classify the main emotion of the user's message. \
                                Answer with exactly one label from the schema.",
                },
                { "role": "user", "content": text },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "emotion",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "emotion": { "type": "string", "enum": EMOTION_LABELS },
                        },
                        "required": ["emotion"],
                        "additionalProperties": false,
                    },
                },
            },
        })
    }
}

/// Parse the model's JSON answer and check it against the label set
fn parse_emotion(content: &str) -> Result<String> {
    let payload: EmotionPayload = serde_json::from_str(content.trim())
        .map_err(|e| Error::Emotion(format!("invalid emotion payload: {e}")))?;
    let emotion = payload.emotion.trim().to_lowercase();
    if EMOTION_LABELS.contains(&emotion.as_str()) {
        Ok(emotion)
    } else {
        Err(Error::Emotion(format!("unknown emotion label: {emotion}")))
    }
}

#[async_trait]
impl EmotionAnalyzer for OpenAiEmotionAnalyzer {
    async fn analyze(&self, text: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&self.request_body(text))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body));
        }

        let completion: CompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Emotion("empty completion".to_string()))?;

        let emotion = parse_emotion(&content)?;
        tracing::debug!(emotion = %emotion, "emotion classified");
        Ok(emotion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl EmotionAnalyzer for Fixed {
        async fn analyze(&self, _text: &str) -> Result<String> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| Error::Emotion("unavailable".to_string()))
        }
    }

    #[test]
    fn accepts_known_labels() {
        assert_eq!(parse_emotion(r#"{"emotion":"Joy"}"#).unwrap(), "joy");
    }

    #[test]
    fn rejects_unknown_labels() {
        assert!(parse_emotion(r#"{"emotion":"ecstatic"}"#).is_err());
        assert!(parse_emotion("joy").is_err());
    }

    #[tokio::test]
    async fn failure_falls_back_to_neutral() {
        let result = classify(&Fixed(None), "hello").await;
        assert_eq!(result.emotion, NEUTRAL);
        assert!(result.error.is_some());

        let result = classify(&Fixed(Some("surprise")), "wow").await;
        assert_eq!(result.emotion, "surprise");
        assert!(result.error.is_none());
    }

    #[test]
    fn schema_lists_every_label() {
        let llm = LlmConfig {
            api_key: Some(SecretString::from("k".to_string())),
            ..LlmConfig::default()
        };
        let analyzer = OpenAiEmotionAnalyzer::new(&llm, &EmotionConfig::default()).unwrap();
        let body = analyzer.request_body("hi");
        let labels = &body["response_format"]["json_schema"]["schema"]["properties"]["emotion"]["enum"];
        assert_eq!(labels.as_array().unwrap().len(), EMOTION_LABELS.len());
        assert_eq!(body["model"], llm.model);
    }
}

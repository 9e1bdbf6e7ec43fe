//! Streaming text generation
//!
//! Replies are produced by an OpenAI-compatible chat completions endpoint with
//! server-sent events. Each connection keeps its conversation in a
//! [`ChatSession`] handed out by the [`SessionRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Prior exchanges kept per conversation
const MAX_HISTORY_TURNS: usize = 40;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation state for one client
#[derive(Debug)]
pub struct ChatSession {
    id: String,
    history: Mutex<Vec<ChatTurn>>,
}

impl ChatSession {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of prior turns, oldest first
    pub async fn history(&self) -> Vec<ChatTurn> {
        self.history.lock().await.clone()
    }

    /// Record a completed exchange, dropping the oldest turns past the cap
    pub async fn record_exchange(&self, user: &str, assistant: &str) {
        let mut history = self.history.lock().await;
        history.push(ChatTurn::new(Role::User, user));
        history.push(ChatTurn::new(Role::Assistant, assistant));
        let excess = history.len().saturating_sub(MAX_HISTORY_TURNS);
        history.drain(..excess);
    }
}

/// Explicitly owned map of conversation sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ChatSession>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `id`, created on first use
    pub async fn get_or_create(&self, id: &str) -> Arc<ChatSession> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write().await;
        Arc::clone(
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ChatSession::new(id))),
        )
    }

    /// Forget the session for `id`, returning whether one existed
    pub async fn clear(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are live
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Stream of generated text fragments
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Generates streamed replies
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Start a reply to `prompt` in the context of `session`
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected; [`Error::RateLimited`] for
    /// quota errors
    async fn stream_reply(&self, prompt: &str, session: &ChatSession) -> Result<FragmentStream>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

/// OpenAI-compatible streaming chat client
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    system_prompt: String,
    max_tokens: Option<u32>,
    temperature: f32,
}

impl OpenAiGenerator {
    /// Create a generator from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("LLM API key required".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    async fn messages(&self, prompt: &str, session: &ChatSession) -> Vec<ChatTurn> {
        let mut messages = Vec::new();
        if !self.system_prompt.is_empty() {
            messages.push(ChatTurn::new(Role::System, self.system_prompt.clone()));
        }
        messages.extend(session.history().await);
        messages.push(ChatTurn::new(Role::User, prompt));
        messages
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn stream_reply(&self, prompt: &str, session: &ChatSession) -> Result<FragmentStream> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: self.messages(prompt, session).await,
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(session = %session.id(), model = %self.model, "requesting reply");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "chat completions error");
            return Err(classify_failure(status.as_u16(), &body));
        }

        Ok(sse_fragments(response.bytes_stream().boxed()))
    }
}

/// Map an error response to a generation or quota error
#[must_use]
pub fn classify_failure(status: u16, body: &str) -> Error {
    let lower = body.to_lowercase();
    if status == 429 || lower.contains("resource_exhausted") || lower.contains("rate_limit") {
        Error::RateLimited(format!("{status}: {body}"))
    } else {
        Error::Generation(format!("{status}: {body}"))
    }
}

/// Splits a byte stream into SSE `data:` payloads
#[derive(Debug, Default)]
struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                out.push(data);
            }
        }
        out
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    line.strip_prefix("data:")
        .map(|data| data.trim_start().to_string())
}

enum SseData {
    Text(String),
    Done,
    Skip,
}

fn parse_data(data: &str) -> Result<SseData> {
    if data == "[DONE]" {
        return Ok(SseData::Done);
    }
    let json: serde_json::Value = serde_json::from_str(data)?;
    if let Some(error) = json.get("error") {
        return Err(classify_failure(
            error.get("code").and_then(serde_json::Value::as_u64).map_or(0, |c| u16::try_from(c).unwrap_or(0)),
            &error.to_string(),
        ));
    }
    Ok(json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map_or(SseData::Skip, |s| SseData::Text(s.to_string())))
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    lines: SseLines,
    pending: VecDeque<String>,
    done: bool,
}

fn sse_fragments(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = SseState {
        bytes,
        lines: SseLines::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.pending.pop_front() {
                match parse_data(&data) {
                    Ok(SseData::Text(text)) => return Some((Ok(text), st)),
                    Ok(SseData::Skip) => continue,
                    Ok(SseData::Done) => return None,
                    Err(e) => {
                        st.done = true;
                        st.pending.clear();
                        return Some((Err(e), st));
                    }
                }
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let lines = st.lines.feed(&chunk);
                    st.pending.extend(lines);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(Error::Generation(format!("stream interrupted: {e}"))), st));
                }
                None => {
                    st.pending.extend(st.lines.finish());
                    st.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_survive_chunk_splits() {
        let mut lines = SseLines::default();
        assert!(lines.feed(b"data: {\"a\"").is_empty());
        assert_eq!(lines.feed(b":1}\r\n\r\ndata: [DONE]\n"), vec![r#"{"a":1}"#, "[DONE]"]);
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn parses_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert!(matches!(parse_data(data).unwrap(), SseData::Text(t) if t == "Hel"));
        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(matches!(parse_data(role_only).unwrap(), SseData::Skip));
        assert!(matches!(parse_data("[DONE]").unwrap(), SseData::Done));
    }

    #[test]
    fn quota_errors_are_rate_limits() {
        assert!(classify_failure(429, "slow down").is_rate_limited());
        assert!(classify_failure(400, r#"{"status":"RESOURCE_EXHAUSTED"}"#).is_rate_limited());
        assert!(!classify_failure(500, "oops").is_rate_limited());
    }

    #[tokio::test]
    async fn fragments_stop_at_done() {
        let body: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\ndata: [DONE]\n\n")),
        ];
        let out: Vec<String> = sse_fragments(stream::iter(body).boxed())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn registry_reuses_and_clears_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("client-1").await;
        let b = registry.get_or_create("client-1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);

        assert!(registry.clear("client-1").await);
        assert!(!registry.clear("client-1").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let session = ChatSession::new("c");
        for i in 0..MAX_HISTORY_TURNS {
            session.record_exchange(&format!("q{i}"), &format!("a{i}")).await;
        }
        let history = session.history().await;
        assert_eq!(history.len(), MAX_HISTORY_TURNS);
        assert_eq!(history.last().unwrap().content, format!("a{}", MAX_HISTORY_TURNS - 1));
    }
}

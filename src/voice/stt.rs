//! Streaming speech-to-text (STT)
//!
//! A [`SpeechRecognizer`] opens one live recognition session; the
//! [`TranscriptionAdapter`] feeds it from the connection's [`AudioQueue`] and
//! turns its results into [`TranscriptEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::stream::{self, BoxStream, SplitStream, StreamExt};
use futures::{Sink, SinkExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::events::{AudioFrame, AudioQueue, TranscriptEvent};
use crate::config::SttConfig;
use crate::{Error, Result};

/// Reasons an upstream service gives when a session ran past its maximum duration
const DURATION_ABORT_MARKERS: &[&str] = &[
    "exceeded maximum",
    "maximum allowed stream duration",
    "max duration",
    "out_of_range",
];

/// Buffered audio between the adapter and the network writer
const AUDIO_BUFFER: usize = 64;

/// Idle gap after which a KeepAlive is sent so the service holds a silent session open
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One hypothesis from the recognition service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub transcript: String,
    pub is_final: bool,
}

/// A live recognition session
///
/// Dropping `audio` asks the service to finalize; `results` ends once it has.
pub struct RecognitionSession {
    pub audio: mpsc::Sender<Bytes>,
    pub results: BoxStream<'static, Result<RecognitionResult>>,
}

/// Opens streaming recognition sessions
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a new session
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established
    async fn connect(&self) -> Result<RecognitionSession>;
}

/// Map an upstream abort to an error, separating duration limits from real failures
#[must_use]
pub fn classify_abort(code: Option<u16>, reason: &str) -> Error {
    let detail = match code {
        Some(code) => format!("{code}: {reason}"),
        None => reason.to_string(),
    };
    if is_duration_abort(reason) {
        Error::SttTimeout(detail)
    } else {
        Error::Stt(detail)
    }
}

fn is_duration_abort(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    DURATION_ABORT_MARKERS.iter().any(|m| reason.contains(m))
}

/// When a recognition result counts as evidence of live speech
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityPolicy {
    pub enabled: bool,
    /// Minimum spacing between pulses
    pub min_interval: Duration,
    /// Ignore results with an empty transcript
    pub speech_only: bool,
}

impl Default for ActivityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval: Duration::from_secs(1),
            speech_only: true,
        }
    }
}

#[derive(Debug)]
struct ActivityGate {
    policy: ActivityPolicy,
    last_pulse: Option<Instant>,
}

impl ActivityGate {
    const fn new(policy: ActivityPolicy) -> Self {
        Self {
            policy,
            last_pulse: None,
        }
    }

    fn observe(&mut self, result: &RecognitionResult) -> bool {
        if !self.policy.enabled {
            return false;
        }
        if self.policy.speech_only && result.transcript.trim().is_empty() {
            return false;
        }
        let now = Instant::now();
        let quiet = self
            .last_pulse
            .is_none_or(|last| now.duration_since(last) >= self.policy.min_interval);
        if quiet {
            self.last_pulse = Some(now);
        }
        quiet
    }
}

/// How a recognition session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// End-of-stream was consumed and the service closed the session
    EndOfStream,
    /// The service hit its maximum session duration
    Timeout,
}

/// Result of driving one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    /// Recognition results received during the session
    pub results: usize,
}

/// Feeds queued audio into recognition sessions and emits transcript events
pub struct TranscriptionAdapter {
    recognizer: Arc<dyn SpeechRecognizer>,
    activity: ActivityPolicy,
}

impl TranscriptionAdapter {
    #[must_use]
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, activity: ActivityPolicy) -> Self {
        Self {
            recognizer,
            activity,
        }
    }

    /// Open a session and drive it to completion
    ///
    /// Fatal failures are reported as [`TranscriptEvent::FatalError`] before
    /// being returned. Dropping the future stops frame submission and closes
    /// the session; unconsumed frames stay queued.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be opened or fails for a reason
    /// other than its maximum duration
    pub async fn run(
        &self,
        queue: &AudioQueue,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<SessionOutcome> {
        match self.open(events).await? {
            Some(session) => self.drive(session, queue, events).await,
            None => Ok(SessionOutcome {
                end: SessionEnd::Timeout,
                results: 0,
            }),
        }
    }

    /// Open a session, reporting a refused connection as an event
    ///
    /// Returns `None` when the service turned the session away with a
    /// duration limit, which callers treat like a timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be opened for any other reason
    pub async fn open(
        &self,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<Option<RecognitionSession>> {
        match self.recognizer.connect().await {
            Ok(session) => Ok(Some(session)),
            Err(e) if e.is_stt_timeout() => {
                emit(events, TranscriptEvent::TimeoutSignal(e.to_string())).await?;
                Ok(None)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open recognition session");
                emit(events, TranscriptEvent::FatalError(e.to_string())).await?;
                Err(e)
            }
        }
    }

    /// Drive an already open session
    ///
    /// # Errors
    ///
    /// Returns error if the session fails for a reason other than its
    /// maximum duration, or if the event sink is gone
    pub async fn drive(
        &self,
        session: RecognitionSession,
        queue: &AudioQueue,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<SessionOutcome> {
        let RecognitionSession { audio, mut results } = session;
        let mut audio = Some(audio);
        let mut frames = queue.consumer().await;
        let mut gate = ActivityGate::new(self.activity);
        let mut received = 0;

        loop {
            tokio::select! {
                frame = frames.recv(), if audio.is_some() => match frame {
                    Some(AudioFrame::Data(bytes)) => {
                        if let Some(tx) = &audio
                            && tx.send(bytes).await.is_err()
                        {
                            // The results stream reports why the writer went away
                            tracing::debug!("recognition writer closed");
                            audio = None;
                        }
                    }
                    Some(AudioFrame::EndOfStream) | None => {
                        tracing::debug!("end of audio, finalizing recognition session");
                        audio = None;
                    }
                },
                item = results.next() => match item {
                    Some(Ok(result)) => {
                        received += 1;
                        if gate.observe(&result) {
                            emit(events, TranscriptEvent::ActivityPulse).await?;
                        }
                        if result.transcript.trim().is_empty() {
                            continue;
                        }
                        let event = if result.is_final {
                            tracing::info!(transcript = %result.transcript, "final transcript");
                            TranscriptEvent::Final(result.transcript)
                        } else {
                            TranscriptEvent::Interim(result.transcript)
                        };
                        emit(events, event).await?;
                    }
                    Some(Err(e)) if e.is_stt_timeout() => {
                        tracing::info!(error = %e, "recognition session reached maximum duration");
                        emit(events, TranscriptEvent::TimeoutSignal(e.to_string())).await?;
                        return Ok(SessionOutcome { end: SessionEnd::Timeout, results: received });
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "recognition session failed");
                        emit(events, TranscriptEvent::FatalError(e.to_string())).await?;
                        return Err(e);
                    }
                    None if audio.is_none() => {
                        tracing::debug!(results = received, "recognition session closed");
                        return Ok(SessionOutcome { end: SessionEnd::EndOfStream, results: received });
                    }
                    None => {
                        let e = Error::Stt("recognition session closed unexpectedly".to_string());
                        tracing::error!(error = %e, "recognition session failed");
                        emit(events, TranscriptEvent::FatalError(e.to_string())).await?;
                        return Err(e);
                    }
                },
            }
        }
    }
}

pub(crate) async fn emit(events: &mpsc::Sender<TranscriptEvent>, event: TranscriptEvent) -> Result<()> {
    events
        .send(event)
        .await
        .map_err(|_| Error::Transport("transcript event sink closed".to_string()))
}

type DeepgramSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(serde::Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_final: bool,
    channel: Option<DeepgramChannel>,
    description: Option<String>,
    message: Option<String>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Deepgram live streaming recognizer
pub struct DeepgramRecognizer {
    api_key: SecretString,
    endpoint: String,
    model: String,
    language: String,
    encoding: String,
    sample_rate: u32,
}

impl DeepgramRecognizer {
    /// Create a recognizer from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;

        Ok(Self {
            api_key,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
            encoding: config.encoding.clone(),
            sample_rate: config.sample_rate,
        })
    }

    /// Session URL with recognition options in the query string
    ///
    /// # Errors
    ///
    /// Returns error if the configured endpoint is not a valid URL
    pub fn session_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid STT endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", &self.language)
            .append_pair("encoding", &self.encoding)
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("interim_results", "true")
            .append_pair("punctuate", "true");
        Ok(url)
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn connect(&self) -> Result<RecognitionSession> {
        let url = self.session_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Stt(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid Deepgram API key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        tracing::debug!(model = %self.model, language = %self.language, "opening Deepgram session");
        let (socket, _) = connect_async(request).await.map_err(|e| {
            tracing::error!(error = %e, "Deepgram connection failed");
            Error::Stt(format!("Deepgram connection failed: {e}"))
        })?;

        let (sink, read) = socket.split();
        let (audio, mut audio_rx) = mpsc::channel::<Bytes>(AUDIO_BUFFER);

        tokio::spawn(write_deepgram_audio(sink, audio_rx, KEEPALIVE_INTERVAL));

        Ok(RecognitionSession {
            audio,
            results: deepgram_results(read),
        })
    }
}

/// Forward audio to the service, keeping a quiet session alive until the sender drops
async fn write_deepgram_audio<S>(
    mut sink: S,
    mut audio_rx: mpsc::Receiver<Bytes>,
    keepalive: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut idle = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            chunk = audio_rx.recv() => match chunk {
                Some(chunk) => {
                    idle.reset();
                    Message::Binary(chunk)
                }
                None => break,
            },
            _ = idle.tick() => {
                tracing::trace!("sending Deepgram KeepAlive");
                Message::Text(r#"{"type":"KeepAlive"}"#.into())
            }
        };
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(error = %e, "Deepgram audio write failed");
            return;
        }
    }

    let close = r#"{"type":"CloseStream"}"#;
    if let Err(e) = sink.send(Message::Text(close.into())).await {
        tracing::debug!(error = %e, "failed to send CloseStream");
    }
}

fn deepgram_results(read: SplitStream<DeepgramSocket>) -> BoxStream<'static, Result<RecognitionResult>> {
    stream::unfold(Some(read), |state| async move {
        let mut read = state?;
        loop {
            match read.next().await? {
                Ok(Message::Text(text)) => match parse_deepgram(text.as_str()) {
                    Ok(Some(result)) => return Some((Ok(result), Some(read))),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), None)),
                },
                Ok(Message::Close(frame)) => {
                    let frame = frame?;
                    let code = u16::from(frame.code);
                    let reason = frame.reason.as_str();
                    if code == 1000 && !is_duration_abort(reason) {
                        return None;
                    }
                    return Some((Err(classify_abort(Some(code), reason)), None));
                }
                Ok(_) => {}
                Err(e) => return Some((Err(Error::Stt(e.to_string())), None)),
            }
        }
    })
    .boxed()
}

/// Parse one Deepgram message; non-result messages yield `None`
fn parse_deepgram(text: &str) -> Result<Option<RecognitionResult>> {
    let msg: DeepgramMessage = serde_json::from_str(text)?;
    match msg.kind.as_str() {
        "Results" => {
            let transcript = msg
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .map(|a| a.transcript)
                .unwrap_or_default();
            Ok(Some(RecognitionResult {
                transcript,
                is_final: msg.is_final,
            }))
        }
        "Error" => {
            let reason = msg.description.or(msg.message).unwrap_or_default();
            Err(classify_abort(None, &reason))
        }
        _ => Ok(None),
    }
}

//! Per-connection pipeline coordinator
//!
//! Owns the audio queue, the transcription supervisor, and at most one active
//! reply. Transcript events drive replies: a final transcript supersedes the
//! running reply, and recognition activity during a reply interrupts it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::control::{ClientCommand, ControlMessage, Egress, Outbound};
use super::emotion::{self, EmotionAnalyzer, OpenAiEmotionAnalyzer};
use super::events::{AudioFrame, AudioQueue, TranscriptEvent};
use super::llm::{ChatSession, OpenAiGenerator, SessionRegistry, TextGenerator};
use super::reconnect::{ReconnectPolicy, Supervisor};
use super::reply::ReplyPipeline;
use super::segmenter::TextSegmenter;
use super::stt::{ActivityPolicy, DeepgramRecognizer, SpeechRecognizer, TranscriptionAdapter};
use super::synthesis::{SynthesisAdapter, SynthesisStrategy};
use super::tts::{Synthesizer, TextToSpeech};
use crate::config::Config;
use crate::Result;

/// Transcript events buffered between the supervisor and the coordinator
const EVENT_BUFFER: usize = 64;

/// Item read from the client transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Binary audio frame
    Audio(Bytes),
    /// Text frame
    Text(String),
    /// Client closed the transport
    Closed,
}

/// Service handles shared by every connection
#[derive(Clone)]
pub struct VoiceServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub emotion: Option<Arc<dyn EmotionAnalyzer>>,
    pub sessions: Arc<SessionRegistry>,
}

impl VoiceServices {
    /// Build the hosted providers named by `config`
    ///
    /// # Errors
    ///
    /// Returns error if a required API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let emotion: Option<Arc<dyn EmotionAnalyzer>> = if config.emotion.enabled {
            Some(Arc::new(OpenAiEmotionAnalyzer::new(&config.llm, &config.emotion)?))
        } else {
            None
        };

        Ok(Self {
            recognizer: Arc::new(DeepgramRecognizer::new(&config.stt)?),
            generator: Arc::new(OpenAiGenerator::new(&config.llm)?),
            synthesizer: Arc::new(TextToSpeech::new(&config.tts)?),
            emotion,
            sessions: Arc::new(SessionRegistry::new()),
        })
    }
}

/// Connection-level tuning
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub idle_timeout: Duration,
    pub activity: ActivityPolicy,
    pub reconnect: ReconnectPolicy,
    pub synthesis: SynthesisStrategy,
    pub segment_min_length: usize,
    pub punctuation: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.server.idle_timeout,
            activity: config.pipeline.activity,
            reconnect: config.reconnect.clone(),
            synthesis: config.pipeline.synthesis,
            segment_min_length: config.pipeline.segment_min_length,
            punctuation: config.pipeline.punctuation.clone(),
        }
    }
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// The client went away
    Disconnected,
    /// Transcription failed beyond recovery
    Fatal(String),
}

/// Runs the voice pipeline for each accepted connection
pub struct Coordinator {
    services: VoiceServices,
    settings: CoordinatorSettings,
    pipeline: Arc<ReplyPipeline>,
}

impl Coordinator {
    #[must_use]
    pub fn new(services: VoiceServices, settings: CoordinatorSettings) -> Self {
        let pipeline = Arc::new(ReplyPipeline::new(
            Arc::clone(&services.generator),
            SynthesisAdapter::new(Arc::clone(&services.synthesizer), settings.synthesis),
            TextSegmenter::new(settings.segment_min_length, &settings.punctuation),
        ));
        Self {
            services,
            settings,
            pipeline,
        }
    }

    /// Session registry shared by all connections
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.services.sessions
    }

    /// Serve one connection until the client leaves or transcription fails
    ///
    /// Teardown always runs before returning: child tasks are cancelled and
    /// awaited, the conversation session is cleared, and `Outbound::Close` is
    /// sent to the transport.
    pub async fn run<S>(
        &self,
        client_id: &str,
        mut inbound: S,
        outbound: mpsc::Sender<Outbound>,
    ) -> TeardownReason
    where
        S: Stream<Item = Inbound> + Unpin + Send,
    {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let mut conn = Connection {
            client_id,
            coordinator: self,
            egress: Egress::new(outbound),
            queue: AudioQueue::new(),
            events: event_tx,
            root: CancellationToken::new(),
            transcription: None,
            reply: None,
            session: None,
            frames_since_stop: 0,
        };

        tracing::info!(client_id = %client_id, "voice connection accepted");
        conn.start_transcription();

        let reason = loop {
            tokio::select! {
                msg = tokio::time::timeout(self.settings.idle_timeout, inbound.next()) => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(_) if conn.egress.is_live() => {
                            tracing::trace!(client_id = %client_id, "receive idle, connection still live");
                            continue;
                        }
                        Err(_) => break TeardownReason::Disconnected,
                    };
                    match msg {
                        Some(Inbound::Audio(bytes)) => conn.accept_audio(bytes),
                        Some(Inbound::Text(text)) => conn.accept_text(&text),
                        Some(Inbound::Closed) | None => {
                            tracing::info!(client_id = %client_id, "client disconnected");
                            break TeardownReason::Disconnected;
                        }
                    }
                }
                Some(event) = event_rx.recv() => {
                    if let Some(reason) = conn.handle_event(event).await {
                        break reason;
                    }
                }
                finished = join_transcription(&mut conn.transcription) => {
                    conn.transcription = None;
                    // Events sent before the task ended are handled first
                    let mut fatal = None;
                    while let Ok(event) = event_rx.try_recv() {
                        if let Some(reason) = conn.handle_event(event).await {
                            fatal.get_or_insert(reason);
                        }
                    }
                    match (finished, fatal) {
                        (_, Some(reason)) => break reason,
                        (Ok(Ok(())), None) => {
                            tracing::debug!(client_id = %client_id, "transcription ended");
                            if conn.queue.pending() > 0 {
                                conn.start_transcription();
                            }
                        }
                        (Ok(Err(e)), None) => {
                            conn.egress.control(ControlMessage::stt_error(e.to_string())).await;
                            break TeardownReason::Fatal(e.to_string());
                        }
                        (Err(e), None) => {
                            tracing::error!(client_id = %client_id, error = %e, "transcription task failed");
                            break TeardownReason::Fatal(e.to_string());
                        }
                    }
                }
            }
        };

        conn.teardown(&reason).await;
        reason
    }
}

struct TranscriptionTask {
    handle: JoinHandle<Result<()>>,
    cancel: CancellationToken,
}

struct ActiveReply {
    cancel: CancellationToken,
    reply: JoinHandle<()>,
    emotion: Option<JoinHandle<()>>,
}

impl ActiveReply {
    fn is_running(&self) -> bool {
        !self.reply.is_finished()
    }
}

/// State of one live connection
struct Connection<'a> {
    client_id: &'a str,
    coordinator: &'a Coordinator,
    egress: Egress,
    queue: AudioQueue,
    events: mpsc::Sender<TranscriptEvent>,
    root: CancellationToken,
    transcription: Option<TranscriptionTask>,
    reply: Option<ActiveReply>,
    session: Option<Arc<ChatSession>>,
    /// Audio frames queued since the last end-of-stream
    frames_since_stop: usize,
}

impl Connection<'_> {
    fn start_transcription(&mut self) {
        let settings = &self.coordinator.settings;
        let adapter = TranscriptionAdapter::new(
            Arc::clone(&self.coordinator.services.recognizer),
            settings.activity,
        );
        let supervisor = Supervisor::new(adapter, settings.reconnect.clone());
        let queue = self.queue.clone();
        let events = self.events.clone();
        let cancel = self.root.child_token();
        let token = cancel.clone();

        tracing::debug!(client_id = %self.client_id, "starting transcription");
        let handle = tokio::spawn(async move { supervisor.run(&queue, &events, &token).await });
        self.transcription = Some(TranscriptionTask { handle, cancel });
    }

    fn accept_audio(&mut self, bytes: Bytes) {
        // A finishing session restarts from the join arm once it has closed
        if self.transcription.is_none() {
            self.start_transcription();
        }
        match self.queue.push(AudioFrame::Data(bytes)) {
            Ok(()) => self.frames_since_stop += 1,
            Err(e) => tracing::warn!(client_id = %self.client_id, error = %e, "dropping audio frame"),
        }
    }

    fn accept_text(&mut self, text: &str) {
        match ClientCommand::parse(text) {
            Some(ClientCommand::StopRecording) if self.frames_since_stop > 0 => {
                tracing::info!(
                    client_id = %self.client_id,
                    frames = self.frames_since_stop,
                    "client stopped recording"
                );
                self.frames_since_stop = 0;
                if let Err(e) = self.queue.finish() {
                    tracing::warn!(client_id = %self.client_id, error = %e, "failed to queue end of stream");
                }
            }
            Some(ClientCommand::StopRecording) => {
                tracing::debug!(client_id = %self.client_id, "stop recording with no audio since last stop");
            }
            None => tracing::debug!(client_id = %self.client_id, len = text.len(), "ignoring text frame"),
        }
    }

    /// Apply one transcript event, returning a reason when the connection must end
    async fn handle_event(&mut self, event: TranscriptEvent) -> Option<TeardownReason> {
        match event {
            TranscriptEvent::Interim(text) => {
                tracing::trace!(client_id = %self.client_id, transcript = %text, "interim transcript");
            }
            TranscriptEvent::Final(text) => {
                if !text.trim().is_empty() {
                    self.interrupt_reply().await;
                    self.start_reply(text).await;
                }
            }
            TranscriptEvent::ActivityPulse => {
                if self.reply.as_ref().is_some_and(ActiveReply::is_running) {
                    tracing::info!(client_id = %self.client_id, "speech detected during reply, interrupting");
                    self.egress.control(ControlMessage::interruption_detected()).await;
                    self.interrupt_reply().await;
                }
            }
            TranscriptEvent::TimeoutSignal(reason) => {
                tracing::debug!(client_id = %self.client_id, reason = %reason, "transcription timeout");
            }
            TranscriptEvent::Reconnecting {
                attempt,
                max_attempts,
                ..
            } => {
                self.egress
                    .control(ControlMessage::stt_reconnecting(attempt, max_attempts))
                    .await;
            }
            TranscriptEvent::Reconnected { .. } => {
                self.egress.control(ControlMessage::stt_reconnected()).await;
            }
            TranscriptEvent::ReconnectFailed { message, .. } => {
                self.egress
                    .control(ControlMessage::stt_reconnect_failed(message.clone()))
                    .await;
                return Some(TeardownReason::Fatal(message));
            }
            TranscriptEvent::FatalError(message) => {
                self.egress
                    .control(ControlMessage::stt_error(message.clone()))
                    .await;
                return Some(TeardownReason::Fatal(message));
            }
        }
        None
    }

    async fn start_reply(&mut self, transcript: String) {
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => {
                let session = self
                    .coordinator
                    .services
                    .sessions
                    .get_or_create(self.client_id)
                    .await;
                self.session = Some(Arc::clone(&session));
                session
            }
        };

        let cancel = self.root.child_token();

        let emotion = self.coordinator.services.emotion.as_ref().map(|analyzer| {
            let analyzer = Arc::clone(analyzer);
            let egress = self.egress.clone();
            let text = transcript.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {}
                    result = emotion::classify(analyzer.as_ref(), &text) => {
                        egress.emotion(result).await;
                    }
                }
            })
        });

        let pipeline = Arc::clone(&self.coordinator.pipeline);
        let egress = self.egress.clone();
        let token = cancel.clone();
        tracing::info!(client_id = %self.client_id, transcript = %transcript, "starting reply");
        let reply = tokio::spawn(async move {
            pipeline.run(&transcript, &session, &egress, &token).await;
        });

        self.reply = Some(ActiveReply {
            cancel,
            reply,
            emotion,
        });
    }

    /// Cancel the active reply and wait until it has stopped
    async fn interrupt_reply(&mut self) {
        let Some(active) = self.reply.take() else {
            return;
        };
        active.cancel.cancel();
        if let Err(e) = active.reply.await {
            tracing::warn!(client_id = %self.client_id, error = %e, "reply task ended abnormally");
        }
        if let Some(emotion) = active.emotion
            && let Err(e) = emotion.await
        {
            tracing::warn!(client_id = %self.client_id, error = %e, "emotion task ended abnormally");
        }
    }

    async fn teardown(&mut self, reason: &TeardownReason) {
        tracing::info!(client_id = %self.client_id, reason = ?reason, "tearing down connection");

        self.egress.mark_closed();

        if let Some(task) = self.transcription.take() {
            task.cancel.cancel();
            match task.handle.await {
                Ok(Err(e)) => tracing::debug!(client_id = %self.client_id, error = %e, "transcription stopped with error"),
                Err(e) => tracing::warn!(client_id = %self.client_id, error = %e, "transcription task ended abnormally"),
                Ok(Ok(())) => {}
            }
        }

        self.interrupt_reply().await;
        self.root.cancel();

        let dropped = self.queue.drain().await;
        if dropped > 0 {
            tracing::debug!(client_id = %self.client_id, frames = dropped, "discarded queued audio");
        }

        self.session = None;
        if self.coordinator.services.sessions.clear(self.client_id).await {
            tracing::debug!(client_id = %self.client_id, "cleared conversation session");
        }

        if !self.egress.close().await {
            tracing::debug!(client_id = %self.client_id, "transport already closed");
        }
        tracing::info!(client_id = %self.client_id, "voice connection closed");
    }
}

async fn join_transcription(
    task: &mut Option<TranscriptionTask>,
) -> std::result::Result<Result<()>, JoinError> {
    match task {
        Some(task) => (&mut task.handle).await,
        None => std::future::pending().await,
    }
}

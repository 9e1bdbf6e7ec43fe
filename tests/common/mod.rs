//! Shared test utilities: scripted stand-ins for the hosted providers

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use vocalis_gateway::voice::{
    AudioStream, ChatSession, EmotionAnalyzer, FragmentStream, Outbound, RecognitionResult,
    RecognitionSession, SessionRegistry, SpeechRecognizer, Synthesizer, TextGenerator,
    VoiceServices,
};
use vocalis_gateway::{Error, Result};

/// Test side of one mock recognition session
pub struct SessionHandle {
    pub audio: mpsc::Receiver<Bytes>,
    results: mpsc::UnboundedSender<Result<RecognitionResult>>,
}

impl SessionHandle {
    pub fn interim(&self, text: &str) {
        self.push(text, false);
    }

    pub fn final_transcript(&self, text: &str) {
        self.push(text, true);
    }

    fn push(&self, text: &str, is_final: bool) {
        let _ = self.results.send(Ok(RecognitionResult {
            transcript: text.to_string(),
            is_final,
        }));
    }

    /// Abort the session with a duration-limit error
    pub fn time_out(&self) {
        let _ = self
            .results
            .send(Err(Error::SttTimeout("exceeded maximum allowed stream duration".to_string())));
    }

    /// Abort the session with a fatal error
    pub fn fail(&self, message: &str) {
        let _ = self.results.send(Err(Error::Stt(message.to_string())));
    }

    /// Collect frames until the adapter finalizes, then close the session
    pub async fn finish_on_end_of_audio(mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = self.audio.recv().await {
            frames.push(frame);
        }
        frames
    }
}

/// Recognizer whose sessions are driven by the test through [`SessionHandle`]s
pub struct ScriptedRecognizer {
    handles: mpsc::UnboundedSender<SessionHandle>,
    rejections: Mutex<VecDeque<Error>>,
    reject_all_with_timeout: bool,
    connects: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn create() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionHandle>) {
        Self::build(Vec::new(), false)
    }

    /// Refuse the first connects with the given errors
    pub fn rejecting(errors: Vec<Error>) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionHandle>) {
        Self::build(errors, false)
    }

    /// Refuse every connect with a duration-limit error
    pub fn always_timing_out() -> Arc<Self> {
        Self::build(Vec::new(), true).0
    }

    fn build(
        errors: Vec<Error>,
        reject_all_with_timeout: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        let recognizer = Arc::new(Self {
            handles,
            rejections: Mutex::new(errors.into()),
            reject_all_with_timeout,
            connects: AtomicUsize::new(0),
        });
        (recognizer, rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn connect(&self) -> Result<RecognitionSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_all_with_timeout {
            return Err(Error::SttTimeout("max duration".to_string()));
        }
        if let Some(e) = self.rejections.lock().unwrap().pop_front() {
            return Err(e);
        }

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let _ = self.handles.send(SessionHandle {
            audio: audio_rx,
            results: results_tx,
        });
        Ok(RecognitionSession {
            audio: audio_tx,
            results: UnboundedReceiverStream::new(results_rx).boxed(),
        })
    }
}

/// Behavior of one scripted reply
pub enum Reply {
    /// Yield the fragments, then end
    Fragments(Vec<&'static str>),
    /// Yield the fragments, then never finish
    Stall(Vec<&'static str>),
    /// Refuse to start
    Reject(Error),
    /// Yield the fragments, then fail
    FailAfter(Vec<&'static str>, Error),
}

/// Generator answering from a script, echoing once the script runs out
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Reply>>,
    /// Prompt and history length seen by each call
    pub calls: Mutex<Vec<(String, usize)>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

fn fragments(parts: Vec<&'static str>) -> impl futures::Stream<Item = Result<String>> + Send {
    stream::iter(parts.into_iter().map(|p| Ok(p.to_string())))
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn stream_reply(&self, prompt: &str, session: &ChatSession) -> Result<FragmentStream> {
        let history = session.history().await.len();
        self.calls.lock().unwrap().push((prompt.to_string(), history));

        let reply = self.script.lock().unwrap().pop_front();
        Ok(match reply {
            Some(Reply::Fragments(parts)) => fragments(parts).boxed(),
            Some(Reply::Stall(parts)) => fragments(parts).chain(stream::pending()).boxed(),
            Some(Reply::Reject(e)) => return Err(e),
            Some(Reply::FailAfter(parts, e)) => fragments(parts).chain(stream::iter([Err(e)])).boxed(),
            None => stream::iter([Ok(format!("You said: {prompt}."))]).boxed(),
        })
    }
}

/// Synthesizer producing `<text>` as audio, with per-segment delays and failures
#[derive(Default)]
pub struct ScriptedSynthesizer {
    delays: HashMap<String, Duration>,
    failing: Vec<String>,
    breaking: Vec<String>,
    /// Texts requested, in call order
    pub requests: Mutex<Vec<String>>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay synthesis of segments containing `marker`
    pub fn delay(mut self, marker: &str, delay: Duration) -> Self {
        self.delays.insert(marker.to_string(), delay);
        self
    }

    /// Fail synthesis of segments containing `marker`
    pub fn fail_on(mut self, marker: &str) -> Self {
        self.failing.push(marker.to_string());
        self
    }

    /// Yield a partial chunk for segments containing `marker`, then fail
    pub fn break_midway_on(mut self, marker: &str) -> Self {
        self.breaking.push(marker.to_string());
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Audio the scripted synthesizer produces for `text`
pub fn audio_for(text: &str) -> Bytes {
    Bytes::from(format!("<{text}>"))
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.requests.lock().unwrap().push(text.to_string());

        let delay = self
            .delays
            .iter()
            .find(|(marker, _)| text.contains(marker.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.iter().any(|marker| text.contains(marker.as_str())) {
            return Err(Error::Tts(format!("cannot synthesize {text:?}")));
        }
        if self.breaking.iter().any(|marker| text.contains(marker.as_str())) {
            let partial = Bytes::from(format!("<{text}"));
            let broken = Error::Tts(format!("stream broke while synthesizing {text:?}"));
            return Ok(stream::iter([Ok(partial), Err(broken)]).boxed());
        }
        Ok(stream::iter([Ok(audio_for(text))]).boxed())
    }
}

/// Emotion analyzer answering with a fixed label
pub struct FixedEmotion(pub &'static str);

#[async_trait]
impl EmotionAnalyzer for FixedEmotion {
    async fn analyze(&self, _text: &str) -> Result<String> {
        Ok(self.0.to_string())
    }
}

/// Service bundle over the given mocks, without emotion analysis
pub fn services(
    recognizer: Arc<dyn SpeechRecognizer>,
    generator: Arc<dyn TextGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
) -> VoiceServices {
    VoiceServices {
        recognizer,
        generator,
        synthesizer,
        emotion: None,
        sessions: Arc::new(SessionRegistry::new()),
    }
}

/// Receive the next outbound item, failing the test after a long (virtual) wait
pub async fn next_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for outbound message")
        .expect("outbound channel closed")
}

/// Receive outbound items until `stop` matches one, returning all of them
pub async fn outbound_until(
    rx: &mut mpsc::Receiver<Outbound>,
    stop: impl Fn(&Outbound) -> bool,
) -> Vec<Outbound> {
    let mut seen = Vec::new();
    loop {
        let item = next_outbound(rx).await;
        let done = stop(&item);
        seen.push(item);
        if done {
            return seen;
        }
    }
}

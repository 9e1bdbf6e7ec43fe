//! Audio ingress queue and transcription events

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::{Mutex, MutexGuard, mpsc};

use crate::{Error, Result};

/// One item of inbound audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFrame {
    /// Raw audio bytes as received from the client
    Data(Bytes),
    /// Client finished speaking; the recognition session should close gracefully
    EndOfStream,
}

/// Per-connection audio ingress queue
///
/// The receiving half lives behind a mutex so successive recognition sessions
/// can consume from the same queue: frames buffered while a session is being
/// re-established stay queued for the next one.
#[derive(Clone)]
pub struct AudioQueue {
    tx: mpsc::UnboundedSender<AudioFrame>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<AudioFrame>>>,
}

impl AudioQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Queue a frame of audio
    ///
    /// # Errors
    ///
    /// Returns error if the queue has been closed
    pub fn push(&self, frame: AudioFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::Transport("audio queue closed".to_string()))
    }

    /// Queue the end-of-stream sentinel
    ///
    /// # Errors
    ///
    /// Returns error if the queue has been closed
    pub fn finish(&self) -> Result<()> {
        self.push(AudioFrame::EndOfStream)
    }

    /// Take exclusive consumer access for the lifetime of one session
    pub async fn consumer(&self) -> MutexGuard<'_, mpsc::UnboundedReceiver<AudioFrame>> {
        self.rx.lock().await
    }

    /// Number of frames waiting to be consumed
    ///
    /// Returns 0 while a session holds the consumer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.try_lock().map_or(0, |rx| rx.len())
    }

    /// Discard everything still queued, returning how many frames were dropped
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Default for AudioQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Event emitted by the transcription side of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Partial hypothesis, may still change
    Interim(String),
    /// Finalized utterance
    Final(String),
    /// Upstream evidence of live speech, used for barge-in
    ActivityPulse,
    /// Session hit the service's maximum duration
    TimeoutSignal(String),
    /// Session failed for any other reason
    FatalError(String),
    /// Supervisor is about to re-open the session
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    /// A re-opened session is live
    Reconnected { attempt: u32 },
    /// Supervisor gave up
    ReconnectFailed { attempts: u32, message: String },
}

//! Client-facing control messages and the egress handle

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Plain-text frame some clients send when the microphone is turned off
pub const STOP_RECORDING_TEXT: &str = "Client stopped recording";

/// Phase of an assistant response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingAction {
    StartProcessing,
    EndProcessing,
}

/// Why a response phase changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingReason {
    Processing,
    ProcessingComplete,
    Interruption,
    RateLimited,
    Error,
}

/// Delivery summary attached to a completed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub chunks_sent: usize,
    pub duration_secs: f64,
}

/// Transcription service health as shown to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttState {
    Reconnecting,
    Reconnected,
    Error,
}

/// Control message sent to the client as a JSON text frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Assistant started or finished responding
    ResponseStatus {
        action: ProcessingAction,
        reason: ProcessingReason,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_info: Option<AudioInfo>,
    },
    /// User speech detected over an in-flight response
    Interruption { status: String, message: String },
    /// Transcription session status
    SttStatus {
        status: SttState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlMessage {
    #[must_use]
    pub fn start_processing() -> Self {
        Self::ResponseStatus {
            action: ProcessingAction::StartProcessing,
            reason: ProcessingReason::Processing,
            message: "Assistant is responding...".to_string(),
            audio_info: None,
        }
    }

    #[must_use]
    pub fn processing_complete(info: AudioInfo) -> Self {
        Self::ResponseStatus {
            action: ProcessingAction::EndProcessing,
            reason: ProcessingReason::ProcessingComplete,
            message: "Response complete. Go ahead.".to_string(),
            audio_info: Some(info),
        }
    }

    #[must_use]
    pub fn processing_interrupted() -> Self {
        Self::ResponseStatus {
            action: ProcessingAction::EndProcessing,
            reason: ProcessingReason::Interruption,
            message: "Response interrupted. Keep talking.".to_string(),
            audio_info: None,
        }
    }

    /// End-of-processing notice for a failed reply
    ///
    /// Quota errors get their own wording so the user knows retrying later helps.
    #[must_use]
    pub fn processing_failed(error: &Error) -> Self {
        let (reason, message) = if error.is_rate_limited() {
            (
                ProcessingReason::RateLimited,
                "The service is busy right now. Please try again later.",
            )
        } else {
            (
                ProcessingReason::Error,
                "Something went wrong. Please try again.",
            )
        };
        Self::ResponseStatus {
            action: ProcessingAction::EndProcessing,
            reason,
            message: message.to_string(),
            audio_info: None,
        }
    }

    #[must_use]
    pub fn interruption_detected() -> Self {
        Self::Interruption {
            status: "detected".to_string(),
            message: "Go ahead with your new question.".to_string(),
        }
    }

    #[must_use]
    pub const fn stt_reconnecting(attempt: u32, max_attempts: u32) -> Self {
        Self::SttStatus {
            status: SttState::Reconnecting,
            attempt: Some(attempt),
            max_attempts: Some(max_attempts),
            message: None,
            error: None,
        }
    }

    #[must_use]
    pub fn stt_reconnected() -> Self {
        Self::SttStatus {
            status: SttState::Reconnected,
            attempt: None,
            max_attempts: None,
            message: Some("Speech recognition reconnected.".to_string()),
            error: None,
        }
    }

    #[must_use]
    pub fn stt_reconnect_failed(error: impl Into<String>) -> Self {
        Self::SttStatus {
            status: SttState::Error,
            attempt: None,
            max_attempts: None,
            message: Some("Speech recognition unavailable. Please try again shortly.".to_string()),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn stt_error(error: impl Into<String>) -> Self {
        Self::SttStatus {
            status: SttState::Error,
            attempt: None,
            max_attempts: None,
            message: Some("Speech recognition error. Please try again shortly.".to_string()),
            error: Some(error.into()),
        }
    }

    /// Whether this is an `end_processing` notice
    #[must_use]
    pub const fn is_end_processing(&self) -> bool {
        matches!(
            self,
            Self::ResponseStatus {
                action: ProcessingAction::EndProcessing,
                ..
            }
        )
    }
}

/// Emotion classification of the user's utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "emotion_result")]
pub struct EmotionResult {
    pub emotion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Command parsed from a client text frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    StopRecording,
}

#[derive(Deserialize)]
struct ClientControl {
    control: String,
}

impl ClientCommand {
    /// Parse a text frame, accepting the legacy plain-text sentinel and JSON
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed == STOP_RECORDING_TEXT {
            return Some(Self::StopRecording);
        }
        let parsed: ClientControl = serde_json::from_str(trimmed).ok()?;
        match parsed.control.as_str() {
            "stop_recording" => Some(Self::StopRecording),
            _ => None,
        }
    }
}

/// Item written to the client transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Synthesized audio, sent as a binary frame
    Audio(Bytes),
    /// Control notice, sent as JSON text
    Control(ControlMessage),
    /// Emotion result, sent as JSON text
    Emotion(EmotionResult),
    /// Close the transport
    Close,
}

impl Outbound {
    /// JSON body for text frames, `None` for binary and close
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Option<String>> {
        match self {
            Self::Control(msg) => Ok(Some(serde_json::to_string(msg)?)),
            Self::Emotion(msg) => Ok(Some(serde_json::to_string(msg)?)),
            Self::Audio(_) | Self::Close => Ok(None),
        }
    }
}

/// Write side of a connection, shared by the coordinator and its child tasks
///
/// Child tasks only read the liveness flag; the coordinator's teardown is the
/// single writer.
#[derive(Clone)]
pub struct Egress {
    tx: mpsc::Sender<Outbound>,
    live: Arc<AtomicBool>,
}

impl Egress {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the connection is still live
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Mark the connection as not live
    pub(crate) fn mark_closed(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Send synthesized audio
    ///
    /// # Errors
    ///
    /// Returns error if the connection is no longer live
    pub async fn audio(&self, chunk: Bytes) -> Result<()> {
        if !self.is_live() {
            return Err(Error::Transport("connection closed".to_string()));
        }
        self.tx
            .send(Outbound::Audio(chunk))
            .await
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    /// Send a control notice, returning whether it was queued
    ///
    /// Notices are best-effort; a closed connection is logged, not raised.
    pub async fn control(&self, msg: ControlMessage) -> bool {
        self.send(Outbound::Control(msg)).await
    }

    /// Send an emotion result, returning whether it was queued
    pub async fn emotion(&self, result: EmotionResult) -> bool {
        self.send(Outbound::Emotion(result)).await
    }

    /// Ask the transport to close; works after the connection was marked closed
    pub async fn close(&self) -> bool {
        self.tx.send(Outbound::Close).await.is_ok()
    }

    async fn send(&self, item: Outbound) -> bool {
        if !self.is_live() {
            tracing::debug!(?item, "connection closed, dropping outbound message");
            return false;
        }
        self.tx.send(item).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_status_shape() {
        let json = serde_json::to_value(ControlMessage::start_processing()).unwrap();
        assert_eq!(json["control"], "response_status");
        assert_eq!(json["action"], "start_processing");
        assert_eq!(json["reason"], "processing");
        assert!(json.get("audio_info").is_none());
    }

    #[test]
    fn completion_carries_audio_info() {
        let msg = ControlMessage::processing_complete(AudioInfo {
            chunks_sent: 4,
            duration_secs: 1.5,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], "end_processing");
        assert_eq!(json["reason"], "processing_complete");
        assert_eq!(json["audio_info"]["chunks_sent"], 4);
        assert!(msg.is_end_processing());
    }

    #[test]
    fn rate_limit_gets_distinct_reason() {
        let limited = ControlMessage::processing_failed(&Error::RateLimited("429".into()));
        let generic = ControlMessage::processing_failed(&Error::Tts("boom".into()));

        let limited = serde_json::to_value(limited).unwrap();
        let generic = serde_json::to_value(generic).unwrap();
        assert_eq!(limited["reason"], "rate_limited");
        assert_eq!(generic["reason"], "error");
        assert_ne!(limited["message"], generic["message"]);
    }

    #[test]
    fn stt_status_omits_empty_fields() {
        let json = serde_json::to_value(ControlMessage::stt_reconnecting(2, 5)).unwrap();
        assert_eq!(json["control"], "stt_status");
        assert_eq!(json["status"], "reconnecting");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["max_attempts"], 5);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn interruption_shape() {
        let json = serde_json::to_value(ControlMessage::interruption_detected()).unwrap();
        assert_eq!(json["control"], "interruption");
        assert_eq!(json["status"], "detected");
    }

    #[test]
    fn emotion_result_is_type_tagged() {
        let result = EmotionResult {
            emotion: "joy".to_string(),
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"type":"emotion_result","emotion":"joy"}"#);
    }

    #[test]
    fn parses_stop_recording_forms() {
        assert_eq!(
            ClientCommand::parse("Client stopped recording"),
            Some(ClientCommand::StopRecording)
        );
        assert_eq!(
            ClientCommand::parse(r#"{"control":"stop_recording"}"#),
            Some(ClientCommand::StopRecording)
        );
        assert_eq!(ClientCommand::parse("hello"), None);
        assert_eq!(ClientCommand::parse(r#"{"control":"dance"}"#), None);
    }

    #[tokio::test]
    async fn egress_refuses_audio_after_close() {
        let (tx, mut rx) = mpsc::channel(4);
        let egress = Egress::new(tx);

        egress.audio(Bytes::from_static(b"pcm")).await.unwrap();
        egress.mark_closed();
        assert!(egress.audio(Bytes::from_static(b"pcm")).await.is_err());
        assert!(!egress.control(ControlMessage::start_processing()).await);
        assert!(egress.close().await);

        assert_eq!(rx.recv().await, Some(Outbound::Audio(Bytes::from_static(b"pcm"))));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }
}

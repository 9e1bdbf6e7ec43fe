//! Real-time voice pipeline
//!
//! Audio frames from a client flow through streaming recognition, reply
//! generation, sentence segmentation, and speech synthesis, with the audio
//! streamed back over the same connection.

mod control;
mod coordinator;
mod emotion;
mod events;
mod llm;
mod reconnect;
mod reply;
mod segmenter;
mod stt;
mod synthesis;
mod tts;

pub use control::{
    AudioInfo, ClientCommand, ControlMessage, Egress, EmotionResult, Outbound, ProcessingAction,
    ProcessingReason, STOP_RECORDING_TEXT, SttState,
};
pub use coordinator::{Coordinator, CoordinatorSettings, Inbound, TeardownReason, VoiceServices};
pub use emotion::{EMOTION_LABELS, EmotionAnalyzer, NEUTRAL, OpenAiEmotionAnalyzer, classify};
pub use events::{AudioFrame, AudioQueue, TranscriptEvent};
pub use llm::{
    ChatSession, ChatTurn, FragmentStream, OpenAiGenerator, Role, SessionRegistry, TextGenerator,
};
pub use reconnect::{ReconnectPolicy, Supervisor};
pub use reply::{ReplyOutcome, ReplyPipeline};
pub use segmenter::{DEFAULT_MIN_LENGTH, DEFAULT_PUNCTUATION, TextSegmenter, segment_stream};
pub use stt::{
    ActivityPolicy, DeepgramRecognizer, RecognitionResult, RecognitionSession, SessionEnd,
    SessionOutcome, SpeechRecognizer, TranscriptionAdapter, classify_abort,
};
pub use synthesis::{AudioChunk, ReorderBuffer, SynthesisAdapter, SynthesisReport, SynthesisStrategy};
pub use tts::{AudioStream, Synthesizer, TextToSpeech, collect_audio, content_type_for};

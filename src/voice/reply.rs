//! Reply pipeline: generation, segmentation, synthesis, delivery

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::control::{AudioInfo, ControlMessage, Egress};
use super::llm::{ChatSession, TextGenerator};
use super::segmenter::{TextSegmenter, segment_stream};
use super::synthesis::{AudioChunk, SynthesisAdapter, SynthesisReport};
use crate::{Error, Result};

/// Synthesized chunks buffered between synthesis and the transport
const CHUNK_BUFFER: usize = 32;

/// How a reply ended
#[derive(Debug)]
pub enum ReplyOutcome {
    /// All segments were processed
    Completed(SynthesisReport),
    /// Cancelled by a newer utterance, barge-in, or teardown
    Interrupted,
    /// Generation or synthesis failed
    Failed(Error),
}

/// Turns one transcript into streamed speech
pub struct ReplyPipeline {
    generator: Arc<dyn TextGenerator>,
    synthesis: SynthesisAdapter,
    segmenter: TextSegmenter,
}

impl ReplyPipeline {
    #[must_use]
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        synthesis: SynthesisAdapter,
        segmenter: TextSegmenter,
    ) -> Self {
        Self {
            generator,
            synthesis,
            segmenter,
        }
    }

    /// Answer `transcript`, streaming audio to `egress`
    ///
    /// Sends `start_processing` first and exactly one `end_processing`
    /// afterwards, whatever the outcome. The exchange is recorded on the
    /// session only when the reply completes.
    pub async fn run(
        &self,
        transcript: &str,
        session: &ChatSession,
        egress: &Egress,
        cancel: &CancellationToken,
    ) -> ReplyOutcome {
        egress.control(ControlMessage::start_processing()).await;
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => ReplyOutcome::Interrupted,
            result = self.chain(transcript, session, egress) => match result {
                Ok(report) => ReplyOutcome::Completed(report),
                Err(e) => ReplyOutcome::Failed(e),
            },
        };

        let notice = match &outcome {
            ReplyOutcome::Completed(report) => {
                tracing::info!(
                    session = %session.id(),
                    segments = report.segments,
                    chunks = report.chunks,
                    failed = report.failed.len(),
                    "reply complete"
                );
                ControlMessage::processing_complete(AudioInfo {
                    chunks_sent: report.chunks,
                    duration_secs: started.elapsed().as_secs_f64(),
                })
            }
            ReplyOutcome::Interrupted => {
                tracing::info!(session = %session.id(), "reply interrupted");
                ControlMessage::processing_interrupted()
            }
            ReplyOutcome::Failed(e) => {
                tracing::warn!(session = %session.id(), error = %e, "reply failed");
                ControlMessage::processing_failed(e)
            }
        };
        egress.control(notice).await;

        if let ReplyOutcome::Completed(report) = &outcome {
            session.record_exchange(transcript, &report.text).await;
        }
        outcome
    }

    async fn chain(
        &self,
        transcript: &str,
        session: &ChatSession,
        egress: &Egress,
    ) -> Result<SynthesisReport> {
        let fragments = self.generator.stream_reply(transcript, session).await?;
        let segments = segment_stream(fragments, self.segmenter.clone()).boxed();
        let (tx, rx) = mpsc::channel::<AudioChunk>(CHUNK_BUFFER);

        // Each side owns its channel half so a failure on either end unblocks the other
        let producer = async move {
            let tx = tx;
            self.synthesis.run(segments, &tx).await
        };
        let forwarder = async move {
            let mut rx = rx;
            while let Some(chunk) = rx.recv().await {
                egress.audio(chunk.audio).await?;
            }
            Ok::<_, Error>(())
        };

        let (report, forwarded) = tokio::join!(producer, forwarder);
        let report = report?;
        forwarded?;
        Ok(report)
    }
}

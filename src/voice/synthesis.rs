//! Segment synthesis with order-preserving delivery
//!
//! Segments are indexed densely from 0 in arrival order. Audio leaves the
//! adapter in ascending index order whether segments are synthesized one at a
//! time or by a bounded pool of workers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::tts::Synthesizer;
use crate::{Error, Result};

/// How segments are scheduled onto the synthesizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStrategy {
    /// One segment at a time, each released once its audio is complete
    Sequential,
    /// Up to `workers` segments in flight, reassembled in index order
    Parallel { workers: usize },
}

/// Synthesized audio tagged with its segment index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub index: usize,
    pub audio: Bytes,
}

/// What a synthesis run delivered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    /// Segments accepted for synthesis
    pub segments: usize,
    /// Segments whose audio was delivered
    pub delivered: usize,
    /// Indices skipped after a synthesis failure
    pub failed: Vec<usize>,
    /// Audio chunks sent
    pub chunks: usize,
    /// Audio bytes sent
    pub bytes: usize,
    /// Concatenated text of delivered segments
    pub text: String,
}

/// Drives segment synthesis for one reply
pub struct SynthesisAdapter {
    synthesizer: Arc<dyn Synthesizer>,
    strategy: SynthesisStrategy,
}

impl SynthesisAdapter {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, strategy: SynthesisStrategy) -> Self {
        Self {
            synthesizer,
            strategy,
        }
    }

    /// Synthesize every segment, sending audio to `out` in index order
    ///
    /// A segment whose synthesis fails is skipped with a warning and later
    /// segments still play. Dropping the future aborts in-flight work.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if the segment stream fails, a transport
    /// error if `out` is closed, or the first synthesis error when no segment
    /// could be delivered at all
    pub async fn run<S>(&self, segments: S, out: &mpsc::Sender<AudioChunk>) -> Result<SynthesisReport>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
    {
        let mut report = SynthesisReport::default();
        let first_error = match self.strategy {
            SynthesisStrategy::Sequential => self.run_sequential(segments, out, &mut report).await?,
            SynthesisStrategy::Parallel { workers } => {
                self.run_parallel(segments, out, workers.max(1), &mut report)
                    .await?
            }
        };

        match first_error {
            Some(e) if report.delivered == 0 => Err(e),
            _ => Ok(report),
        }
    }

    async fn run_sequential<S>(
        &self,
        mut segments: S,
        out: &mpsc::Sender<AudioChunk>,
        report: &mut SynthesisReport,
    ) -> Result<Option<Error>>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
    {
        let mut first_error = None;

        while let Some(segment) = segments.next().await {
            let text = segment?;
            if text.trim().is_empty() {
                continue;
            }
            let index = report.segments;
            report.segments += 1;

            match self.stream_segment(index, &text, out, report).await {
                Ok(()) => {
                    report.delivered += 1;
                    report.text.push_str(&text);
                }
                Err(e @ Error::Transport(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping segment after synthesis failure");
                    report.failed.push(index);
                    first_error.get_or_insert(e);
                }
            }
        }

        Ok(first_error)
    }

    async fn stream_segment(
        &self,
        index: usize,
        text: &str,
        out: &mpsc::Sender<AudioChunk>,
        report: &mut SynthesisReport,
    ) -> Result<()> {
        let audio = self.synthesizer.synthesize(text).await?;
        let chunks: Vec<Bytes> = audio.try_collect().await?;
        for chunk in chunks {
            send(out, index, chunk, report).await?;
        }
        Ok(())
    }

    async fn run_parallel<S>(
        &self,
        mut segments: S,
        out: &mpsc::Sender<AudioChunk>,
        workers: usize,
        report: &mut SynthesisReport,
    ) -> Result<Option<Error>>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
    {
        let mut first_error = None;
        let mut tasks: JoinSet<(usize, Result<Vec<Bytes>>)> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut texts: HashMap<usize, String> = HashMap::new();
        let mut reorder = ReorderBuffer::default();
        let mut input_done = false;

        loop {
            tokio::select! {
                segment = segments.next(), if !input_done && tasks.len() < workers => match segment {
                    Some(Ok(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let index = report.segments;
                        report.segments += 1;
                        let synthesizer = Arc::clone(&self.synthesizer);
                        let worker_text = text.clone();
                        let handle = tasks.spawn(async move {
                            let audio = async {
                                let stream = synthesizer.synthesize(&worker_text).await?;
                                stream.try_collect::<Vec<Bytes>>().await
                            }
                            .await;
                            (index, audio)
                        });
                        task_index.insert(handle.id(), index);
                        texts.insert(index, text);
                    }
                    Some(Err(e)) => return Err(e),
                    None => input_done = true,
                },
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    let (index, audio) = match joined {
                        Some(Ok((id, (index, audio)))) => {
                            task_index.remove(&id);
                            (index, audio)
                        }
                        Some(Err(e)) => {
                            let index = task_index.remove(&e.id()).unwrap_or(reorder.next);
                            (index, Err(Error::Tts(format!("synthesis worker failed: {e}"))))
                        }
                        None => continue,
                    };
                    reorder.insert(index, audio);

                    for (index, audio) in reorder.drain_ready() {
                        let text = texts.remove(&index).unwrap_or_default();
                        match audio {
                            Ok(chunks) => {
                                for chunk in chunks {
                                    send(out, index, chunk, report).await?;
                                }
                                report.delivered += 1;
                                report.text.push_str(&text);
                            }
                            Err(e) => {
                                tracing::warn!(index, error = %e, "skipping segment after synthesis failure");
                                report.failed.push(index);
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                else => break,
            }
        }

        Ok(first_error)
    }
}

async fn send(
    out: &mpsc::Sender<AudioChunk>,
    index: usize,
    audio: Bytes,
    report: &mut SynthesisReport,
) -> Result<()> {
    if audio.is_empty() {
        return Ok(());
    }
    let len = audio.len();
    out.send(AudioChunk { index, audio })
        .await
        .map_err(|_| Error::Transport("audio sink closed".to_string()))?;
    report.chunks += 1;
    report.bytes += len;
    Ok(())
}

/// Holds out-of-order results until the next expected index arrives
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    pending: BTreeMap<usize, T>,
    next: usize,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
        }
    }
}

impl<T> ReorderBuffer<T> {
    /// Park the result for `index`
    pub fn insert(&mut self, index: usize, item: T) {
        if index >= self.next {
            self.pending.insert(index, item);
        }
    }

    /// Remove the contiguous run starting at the next expected index
    pub fn drain_ready(&mut self) -> Vec<(usize, T)> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push((self.next, item));
            self.next += 1;
        }
        ready
    }

    /// Results waiting on an earlier index
    #[must_use]
    pub fn parked(&self) -> usize {
        self.pending.len()
    }
}

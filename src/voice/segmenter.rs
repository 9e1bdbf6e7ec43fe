//! Re-segmentation of streamed text into speakable units
//!
//! Generated text arrives in arbitrary fragments. Synthesis sounds best when fed
//! clause-sized pieces, so fragments are accumulated until the buffer reaches a
//! minimum length and then cut after the last punctuation mark.

use futures::stream::{self, Stream, StreamExt};

use crate::Result;

/// Default minimum buffer length, in characters, before a cut is attempted
pub const DEFAULT_MIN_LENGTH: usize = 10;

/// Default set of characters a segment may end on
pub const DEFAULT_PUNCTUATION: &str = ".?!,";

/// Incremental text segmenter
///
/// Segments are emitted verbatim: concatenating everything returned by
/// [`push`](Self::push) and [`finish`](Self::finish) reproduces the input.
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    min_length: usize,
    punctuation: Vec<char>,
    buffer: String,
}

impl TextSegmenter {
    /// Create a segmenter
    #[must_use]
    pub fn new(min_length: usize, punctuation: &str) -> Self {
        Self {
            min_length,
            punctuation: punctuation.chars().collect(),
            buffer: String::new(),
        }
    }

    /// Append a fragment, returning a segment if one is ready
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_str(fragment);

        if self.buffer.chars().count() < self.min_length {
            return None;
        }

        match self.buffer.rfind(|c| self.punctuation.contains(&c)) {
            Some(idx) => {
                let cut = idx + self.buffer[idx..].chars().next().map_or(1, char::len_utf8);
                let rest = self.buffer.split_off(cut);
                Some(std::mem::replace(&mut self.buffer, rest))
            }
            None => Some(std::mem::take(&mut self.buffer)),
        }
    }

    /// Flush whatever is left once the input is exhausted
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Characters currently buffered
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

impl Default for TextSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_LENGTH, DEFAULT_PUNCTUATION)
    }
}

/// Segment a fragment stream
///
/// An upstream error is forwarded and ends the stream; the partial buffer is
/// not flushed in that case. Dropping the returned stream drops the upstream.
pub fn segment_stream<S>(fragments: S, segmenter: TextSegmenter) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<String>> + Unpin,
{
    stream::unfold(
        Some((fragments, segmenter)),
        |state| async move {
            let (mut fragments, mut segmenter) = state?;
            loop {
                match fragments.next().await {
                    Some(Ok(fragment)) => {
                        if let Some(segment) = segmenter.push(&fragment) {
                            return Some((Ok(segment), Some((fragments, segmenter))));
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => return segmenter.finish().map(|rest| (Ok(rest), None)),
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn run(min_length: usize, fragments: &[&str]) -> Vec<String> {
        let mut segmenter = TextSegmenter::new(min_length, DEFAULT_PUNCTUATION);
        let mut out: Vec<String> = fragments.iter().filter_map(|f| segmenter.push(f)).collect();
        out.extend(segmenter.finish());
        out
    }

    #[test]
    fn cuts_after_last_punctuation() {
        assert_eq!(
            run(5, &["Hello", ", how are", " you?"]),
            vec!["Hello", ",", " how are you?"]
        );
    }

    #[test]
    fn short_input_is_flushed_at_end() {
        assert_eq!(run(10, &["Hi", " there"]), vec!["Hi there"]);
    }

    #[test]
    fn emits_whole_buffer_without_punctuation() {
        assert_eq!(run(4, &["abcdef", "gh"]), vec!["abcdef", "gh"]);
    }

    #[test]
    fn concatenation_reproduces_input() {
        let fragments = [
            "Sure", "! Here is", " a list: one, two", ", three. And",
            " that's all", " folks?", " ", "Done",
        ];
        for min_length in [1, 3, 10, 25, 200] {
            let joined: String = run(min_length, &fragments).concat();
            assert_eq!(joined, fragments.concat(), "min_length {min_length}");
        }
    }

    #[test]
    fn counts_characters_not_bytes() {
        // Each é is two bytes; five characters stay under a min of six
        let mut segmenter = TextSegmenter::new(6, DEFAULT_PUNCTUATION);
        assert_eq!(segmenter.push("ééééé"), None);
        assert_eq!(segmenter.push("é."), Some("éééééé.".to_string()));
    }

    #[test]
    fn multibyte_punctuation_is_kept_whole() {
        let mut segmenter = TextSegmenter::new(3, "。");
        assert_eq!(segmenter.push("你好。再"), Some("你好。".to_string()));
        assert_eq!(segmenter.finish(), Some("再".to_string()));
    }

    #[tokio::test]
    async fn stream_flushes_remainder() {
        let input = stream::iter(vec![Ok("One. Two".to_string()), Ok(" three".to_string())]);
        let out: Vec<String> = segment_stream(input, TextSegmenter::new(4, DEFAULT_PUNCTUATION))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["One.", " Two three"]);
    }

    #[tokio::test]
    async fn stream_error_does_not_flush() {
        let input = stream::iter(vec![
            Ok("partial".to_string()),
            Err(Error::Generation("upstream died".into())),
            Ok("never seen".to_string()),
        ]);
        let out: Vec<Result<String>> =
            segment_stream(input, TextSegmenter::new(50, DEFAULT_PUNCTUATION))
                .collect()
                .await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(Error::Generation(_))));
    }
}

//! Reconnection supervision for recognition sessions
//!
//! Streaming recognition services cap how long one session may run. Hitting
//! the cap is not a failure: the supervisor waits a backoff delay and opens a
//! new session against the same audio queue.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{AudioQueue, TranscriptEvent};
use super::stt::{SessionEnd, SessionOutcome, TranscriptionAdapter, emit};
use crate::{Error, Result};

/// Backoff policy for re-opening timed-out sessions
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Consecutive timeouts tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based): `min(initial * factor^(attempt-1), max)`
    ///
    /// Non-decreasing in `attempt` for any factor of at least 1.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scale = self.factor.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * scale;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Keeps a recognition session alive across duration timeouts
pub struct Supervisor {
    adapter: TranscriptionAdapter,
    policy: ReconnectPolicy,
}

impl Supervisor {
    #[must_use]
    pub const fn new(adapter: TranscriptionAdapter, policy: ReconnectPolicy) -> Self {
        Self { adapter, policy }
    }

    /// Run sessions until end of stream, cancellation, or failure
    ///
    /// Emits `Reconnecting` before each backoff wait, `Reconnected` once the
    /// replacement session is open, and `ReconnectFailed` once when the
    /// attempts are exhausted. Frames queued during the wait are kept for the
    /// next session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SttReconnectFailed`] when attempts are exhausted, or
    /// the adapter's error for any non-timeout failure
    pub async fn run(
        &self,
        queue: &AudioQueue,
        events: &mpsc::Sender<TranscriptEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("transcription supervisor cancelled");
                Ok(())
            }
            result = self.supervise(queue, events) => result,
        }
    }

    async fn supervise(
        &self,
        queue: &AudioQueue,
        events: &mpsc::Sender<TranscriptEvent>,
    ) -> Result<()> {
        let mut timeouts: u32 = 0;

        loop {
            let outcome = match self.adapter.open(events).await? {
                Some(session) => {
                    if timeouts > 0 {
                        tracing::info!(attempt = timeouts, "recognition session reconnected");
                        emit(events, TranscriptEvent::Reconnected { attempt: timeouts }).await?;
                    }
                    self.adapter.drive(session, queue, events).await?
                }
                None => SessionOutcome {
                    end: SessionEnd::Timeout,
                    results: 0,
                },
            };

            match outcome.end {
                SessionEnd::EndOfStream => {
                    tracing::debug!("transcription finished");
                    return Ok(());
                }
                SessionEnd::Timeout => {
                    if outcome.results > 0 {
                        timeouts = 0;
                    }
                    timeouts += 1;

                    if timeouts >= self.policy.max_attempts {
                        let err = Error::SttReconnectFailed {
                            attempts: self.policy.max_attempts,
                        };
                        tracing::error!(attempts = timeouts, "giving up on recognition session");
                        emit(
                            events,
                            TranscriptEvent::ReconnectFailed {
                                attempts: self.policy.max_attempts,
                                message: err.to_string(),
                            },
                        )
                        .await?;
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_attempt(timeouts);
                    tracing::info!(
                        attempt = timeouts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "recognition session timed out, reconnecting"
                    );
                    emit(
                        events,
                        TranscriptEvent::Reconnecting {
                            attempt: timeouts,
                            max_attempts: self.policy.max_attempts,
                            delay,
                        },
                    )
                    .await?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2250));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<_> = (1..=30).map(|a| policy.delay_for_attempt(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn shrinking_factor_is_clamped() {
        let policy = ReconnectPolicy {
            factor: 0.5,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
    }
}

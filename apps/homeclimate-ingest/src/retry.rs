use crate::sample::Sample;
use crate::sink::{Sink, SinkError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

pub const BATCH_MAX_ATTEMPTS: u32 = 5;
pub const BATCH_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Duration,
    pub jitter: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: NonZeroU32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter).filter(|j| !j.is_zero());
        self
    }

    /// Policy of the batch delivery path: five tries one minute apart.
    pub fn batch() -> Self {
        Self::new(NonZeroU32::MIN.saturating_add(BATCH_MAX_ATTEMPTS - 1), BATCH_BACKOFF)
    }

    fn delay(&self) -> Duration {
        match self.jitter {
            Some(jitter) => {
                let extra_ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
                self.backoff + Duration::from_millis(extra_ms)
            }
            None => self.backoff,
        }
    }
}

/// What a deployment does once a batch has used up its retry budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Log and drop the batch; keep polling.
    #[default]
    Drop,
    /// Stop the process with a failure status.
    Exit,
}

impl std::str::FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "exit" => Ok(Self::Exit),
            other => Err(format!("unknown exhaustion policy {other:?} (expected drop or exit)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery of {batch_len} samples failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        batch_len: usize,
        last: SinkError,
    },
}

/// Wraps a sink with a bounded retry budget. At-most-once: a batch that runs
/// out of attempts is dropped and reported to the caller.
#[derive(Clone)]
pub struct RetryingWriter {
    sink: Arc<dyn Sink>,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
}

impl RetryingWriter {
    pub fn new(sink: Arc<dyn Sink>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            attempt_timeout: None,
        }
    }

    /// Bounds each individual `Sink::write`; an attempt that overruns counts
    /// as `SinkError::Timeout`.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn write(&self, batch: &[Sample]) -> Result<Delivery, DeliveryError> {
        let max_attempts = self.policy.max_attempts.get();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.attempt(batch).await {
                Ok(()) => {
                    tracing::debug!(attempt, len = batch.len(), "delivered batch");
                    return Ok(Delivery { attempts: attempt });
                }
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    batch_len: batch.len(),
                    last: err,
                });
            }

            let delay = self.policy.delay();
            tracing::warn!(
                attempt,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "sink write failed"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, batch: &[Sample]) -> Result<(), SinkError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sink.write(batch))
                .await
                .unwrap_or(Err(SinkError::Timeout)),
            None => self.sink.write(batch).await,
        }
    }
}

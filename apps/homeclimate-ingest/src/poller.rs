use crate::adapter::DeviceAdapter;
use crate::retry::{Delivery, DeliveryError, RetryingWriter};
use crate::sample::{Sample, Tags, DEFAULT_MEASUREMENT};
use crate::validate::Validator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Sampling,
    Validating,
    Tagging,
    Delivering,
    Sleeping,
}

/// Fills in the measurement name and deployment-wide tags. Keys the adapter
/// already set are left alone.
#[derive(Debug, Clone, Default)]
pub struct Tagger {
    global_tags: Tags,
}

impl Tagger {
    pub fn new(global_tags: Tags) -> Self {
        Self { global_tags }
    }

    pub fn apply(&self, sample: &mut Sample) {
        if sample.measurement.trim().is_empty() {
            sample.measurement = DEFAULT_MEASUREMENT.to_string();
        }
        for (key, value) in &self.global_tags {
            sample
                .tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct PollerStats {
    pub ticks: AtomicU64,
    pub gap_samples: AtomicU64,
    pub nulled_fields: AtomicU64,
    pub delivered_samples: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStatsSnapshot {
    pub ticks: u64,
    pub gap_samples: u64,
    pub nulled_fields: u64,
    pub delivered_samples: u64,
    pub dropped_batches: u64,
    pub last_error: Option<String>,
}

impl PollerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            gap_samples: self.gap_samples.load(Ordering::Relaxed),
            nulled_fields: self.nulled_fields.load(Ordering::Relaxed),
            delivered_samples: self.delivered_samples.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

/// Sent when a poller's sample could not be delivered within the retry budget.
#[derive(Debug, Clone)]
pub struct ExhaustionReport {
    pub adapter: String,
    pub error: DeliveryError,
}

/// Outcome of one Sampling..Delivering cycle.
#[derive(Debug)]
pub struct TickReport {
    pub sample: Sample,
    pub nulled: Vec<String>,
    pub delivery: Result<Delivery, DeliveryError>,
}

/// Drives one adapter on a fixed cadence: read, validate, tag, deliver, sleep.
pub struct Poller {
    adapter: Box<dyn DeviceAdapter>,
    validator: Validator,
    tagger: Tagger,
    writer: RetryingWriter,
    interval: Duration,
    stats: Arc<PollerStats>,
    exhausted_tx: Option<mpsc::Sender<ExhaustionReport>>,
    state: PollerState,
    #[cfg(test)]
    trail: Vec<PollerState>,
}

impl Poller {
    pub fn new(
        adapter: Box<dyn DeviceAdapter>,
        validator: Validator,
        tagger: Tagger,
        writer: RetryingWriter,
        interval: Duration,
    ) -> Self {
        Self {
            adapter,
            validator,
            tagger,
            writer,
            interval,
            stats: Arc::new(PollerStats::new()),
            exhausted_tx: None,
            state: PollerState::Idle,
            #[cfg(test)]
            trail: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: Arc<PollerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_exhaustion_reports(mut self, tx: mpsc::Sender<ExhaustionReport>) -> Self {
        self.exhausted_tx = Some(tx);
        self
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        self.stats.clone()
    }

    fn enter(&mut self, state: PollerState) {
        tracing::trace!(adapter = %self.adapter.name(), from = ?self.state, to = ?state, "poller state");
        self.state = state;
        #[cfg(test)]
        self.trail.push(state);
    }

    /// One Sampling..Delivering cycle; leaves the poller in `Delivering`.
    /// Never fails; a dropped batch shows up in the report.
    pub async fn tick(&mut self) -> TickReport {
        self.enter(PollerState::Sampling);
        let outcome = self.adapter.read_outcome().await;
        let read_failed = outcome.failure.is_some();
        let mut sample = outcome.sample;
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        self.enter(PollerState::Validating);
        let nulled = self.validator.apply(&mut sample);
        if !nulled.is_empty() {
            tracing::warn!(
                adapter = %self.adapter.name(),
                fields = ?nulled,
                "reading outside plausible range; nulled"
            );
            self.stats
                .nulled_fields
                .fetch_add(nulled.len() as u64, Ordering::Relaxed);
        }
        if read_failed || sample.is_gap() {
            self.stats.gap_samples.fetch_add(1, Ordering::Relaxed);
        }

        self.enter(PollerState::Tagging);
        self.tagger.apply(&mut sample);

        self.enter(PollerState::Delivering);
        let delivery = self.writer.write(std::slice::from_ref(&sample)).await;
        match &delivery {
            Ok(_) => {
                self.stats.delivered_samples.fetch_add(1, Ordering::Relaxed);
                self.stats.clear_error();
            }
            Err(err) => {
                tracing::error!(adapter = %self.adapter.name(), error = %err, "dropping sample");
                self.stats.dropped_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                if let Some(tx) = &self.exhausted_tx {
                    let report = ExhaustionReport {
                        adapter: self.adapter.name().to_string(),
                        error: err.clone(),
                    };
                    if tx.send(report).await.is_err() {
                        tracing::debug!("exhaustion listener gone");
                    }
                }
            }
        }

        TickReport {
            sample,
            nulled,
            delivery,
        }
    }

    /// Runs until `cancel` fires. Cancellation is only observed while
    /// sleeping, so an in-flight read or write always finishes. Hands the
    /// adapter back so the caller decides when it is released.
    pub async fn run(mut self, cancel: CancellationToken) -> Box<dyn DeviceAdapter> {
        tracing::info!(
            adapter = %self.adapter.name(),
            interval_secs = self.interval.as_secs_f64(),
            "poller started"
        );
        loop {
            self.tick().await;
            if !self.pause(&cancel).await {
                break;
            }
        }
        tracing::info!(adapter = %self.adapter.name(), "poller stopped");
        self.adapter
    }

    /// Sleeps for one interval. Returns false, still `Sleeping`, when
    /// `cancel` fired; otherwise moves to `Idle`.
    pub async fn pause(&mut self, cancel: &CancellationToken) -> bool {
        self.enter(PollerState::Sleeping);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.interval) => {}
        }
        self.enter(PollerState::Idle);
        true
    }
}

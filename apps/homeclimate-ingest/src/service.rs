use crate::adapter;
use crate::config::Config;
use crate::poller::{ExhaustionReport, Poller, PollerStats, PollerStatsSnapshot, Tagger};
use crate::retry::{ExhaustionPolicy, RetryingWriter};
use crate::sink::Sink;
use anyhow::{bail, Result};
use futures::future;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped by the shutdown signal.
    Stopped,
    /// Stopped because a delivery ran out of attempts under the `exit` policy.
    Exhausted,
}

/// Per-adapter statistics collected when the pollers stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub pollers: Vec<(String, PollerStatsSnapshot)>,
}

impl RunSummary {
    pub fn poller(&self, adapter: &str) -> Option<&PollerStatsSnapshot> {
        self.pollers
            .iter()
            .find(|(name, _)| name == adapter)
            .map(|(_, stats)| stats)
    }

    /// Counters summed over all pollers. `last_error` is left per adapter.
    pub fn totals(&self) -> PollerStatsSnapshot {
        let mut totals = PollerStatsSnapshot::default();
        for (_, stats) in &self.pollers {
            totals.ticks += stats.ticks;
            totals.gap_samples += stats.gap_samples;
            totals.nulled_fields += stats.nulled_fields;
            totals.delivered_samples += stats.delivered_samples;
            totals.dropped_batches += stats.dropped_batches;
        }
        totals
    }
}

/// Spawns one poller task per configured adapter and runs them until
/// `shutdown` resolves (or, under the `exit` policy, until a delivery is
/// exhausted). Every poller finishes its current cycle before this returns.
pub async fn run_pollers<S>(config: &Config, sink: Arc<dyn Sink>, shutdown: S) -> Result<RunSummary>
where
    S: Future<Output = ()>,
{
    if config.adapters.is_empty() {
        bail!(
            "no adapters configured; add an `adapters` list to {}",
            config.setup_path.display()
        );
    }

    let validator = config.validator();
    let tagger = Tagger::new(config.global_tags.clone());
    let writer = RetryingWriter::new(sink, config.write_policy())
        .with_attempt_timeout(config.write_attempt_timeout());
    let cancel = CancellationToken::new();
    let (exhausted_tx, mut exhausted_rx) = mpsc::channel::<ExhaustionReport>(config.adapters.len());

    let mut handles = Vec::with_capacity(config.adapters.len());
    let mut stats = Vec::with_capacity(config.adapters.len());
    for adapter_config in &config.adapters {
        let poller_stats = Arc::new(PollerStats::new());
        stats.push((adapter_config.name().to_string(), poller_stats.clone()));
        let device = adapter::build(adapter_config, config.read_timeout());
        let mut poller = Poller::new(
            device,
            validator.with_overrides(adapter_config.bounds()),
            tagger.clone(),
            writer.clone(),
            config.sample_interval(),
        )
        .with_stats(poller_stats);
        if config.on_exhausted == ExhaustionPolicy::Exit {
            poller = poller.with_exhaustion_reports(exhausted_tx.clone());
        }
        handles.push(tokio::spawn(poller.run(cancel.clone())));
    }
    drop(exhausted_tx);

    tokio::pin!(shutdown);
    let outcome = tokio::select! {
        _ = &mut shutdown => {
            tracing::info!("shutdown signal received");
            RunOutcome::Stopped
        }
        Some(report) = exhausted_rx.recv() => {
            tracing::error!(
                adapter = %report.adapter,
                error = %report.error,
                "delivery exhausted; stopping pollers"
            );
            RunOutcome::Exhausted
        }
    };

    cancel.cancel();
    for joined in future::join_all(handles).await {
        match joined {
            Ok(device) => {
                tracing::debug!(adapter = %device.name(), "released adapter");
                drop(device);
            }
            Err(err) => tracing::error!(error = %err, "poller task failed"),
        }
    }

    let summary = RunSummary {
        outcome,
        pollers: stats
            .into_iter()
            .map(|(name, stats)| (name, stats.snapshot()))
            .collect(),
    };
    for (adapter, stats) in &summary.pollers {
        tracing::info!(
            adapter = %adapter,
            ticks = stats.ticks,
            gap_samples = stats.gap_samples,
            nulled_fields = stats.nulled_fields,
            delivered_samples = stats.delivered_samples,
            dropped_batches = stats.dropped_batches,
            last_error = stats.last_error.as_deref().unwrap_or(""),
            "poller summary"
        );
    }
    let totals = summary.totals();
    tracing::info!(
        pollers = summary.pollers.len(),
        ticks = totals.ticks,
        delivered_samples = totals.delivered_samples,
        dropped_batches = totals.dropped_batches,
        "pollers stopped"
    );
    Ok(summary)
}

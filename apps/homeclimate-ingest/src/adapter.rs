mod exec;
mod hs110;
mod system;

pub use exec::ExecAdapter;
pub use hs110::Hs110Adapter;
pub use system::SystemAdapter;

use crate::config::AdapterConfig;
use crate::sample::{Fields, Sample, SampleTemplate};
use crate::tplink::{ProtocolError, TpLinkClient};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),
    #[error("read timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A source of samples. Implementors only provide `measure`; `read` turns any
/// failure into a gap sample so callers never see an error.
#[async_trait]
pub trait DeviceAdapter: Send {
    fn name(&self) -> &str;

    fn template(&self) -> &SampleTemplate;

    fn read_timeout(&self) -> Duration {
        DEFAULT_READ_TIMEOUT
    }

    /// Talks to the device and returns raw field values.
    async fn measure(&mut self) -> Result<Fields, ReadError>;

    /// Always yields a sample stamped with the time the read started.
    async fn read(&mut self) -> Sample {
        self.read_outcome().await.sample
    }

    /// Like `read`, but also says whether the sample stands in for a failed
    /// read. Sentinel fields make such a sample look non-empty, so callers
    /// that count gaps must use this.
    async fn read_outcome(&mut self) -> ReadOutcome {
        let started = Utc::now();
        let limit = self.read_timeout();
        let outcome = match tokio::time::timeout(limit, self.measure()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReadError::TimedOut(limit)),
        };
        match outcome {
            Ok(fields) => ReadOutcome {
                sample: self.template().sample(started, fields),
                failure: None,
            },
            Err(err) => {
                tracing::warn!(adapter = %self.name(), error = %err, "sensor read failed; reporting gap");
                ReadOutcome {
                    sample: self.template().failure(started),
                    failure: Some(err),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub sample: Sample,
    pub failure: Option<ReadError>,
}

impl ReadOutcome {
    pub fn is_gap(&self) -> bool {
        self.failure.is_some() || self.sample.is_gap()
    }
}

/// Builds the adapter described by one setup-file entry.
pub fn build(config: &AdapterConfig, read_timeout: Duration) -> Box<dyn DeviceAdapter> {
    match config {
        AdapterConfig::Hs110 {
            name,
            host,
            port,
            measurement,
            tags,
            ..
        } => {
            let client = TpLinkClient::new(host, *port);
            Box::new(
                Hs110Adapter::new(name.clone(), client, measurement.clone(), tags.clone())
                    .with_read_timeout(read_timeout),
            )
        }
        AdapterConfig::System {
            name,
            machine,
            measurement,
            tags,
            ..
        } => Box::new(
            SystemAdapter::new(name.clone(), machine.clone(), measurement.clone(), tags.clone())
                .with_read_timeout(read_timeout),
        ),
        AdapterConfig::Exec {
            name,
            command,
            fields,
            measurement,
            tags,
            ..
        } => Box::new(
            ExecAdapter::new(
                name.clone(),
                command.clone(),
                measurement.clone(),
                tags.clone(),
                fields.clone(),
            )
            .with_read_timeout(read_timeout),
        ),
    }
}

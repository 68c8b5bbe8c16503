mod influx;

pub use influx::{
    default_integer_fields, encode_line, InfluxSink, InfluxSinkConfig, DEFAULT_INTEGER_FIELDS,
};

use crate::sample::Sample;
use async_trait::async_trait;

/// Classified delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink write timed out")]
    Timeout,
    #[error("sink server error: {0}")]
    ServerError(String),
    #[error("sink write failed: {0}")]
    Unknown(String),
}

/// Persists a batch of samples. Implementations must tolerate concurrent
/// calls from several pollers.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, batch: &[Sample]) -> Result<(), SinkError>;
}

use super::{DeviceAdapter, ReadError, DEFAULT_READ_TIMEOUT};
use crate::sample::{Fields, SampleTemplate, Tags};
use crate::tplink::TpLinkClient;
use async_trait::async_trait;
use std::time::Duration;

pub const MEASUREMENT: &str = "power";
pub const FIELDS: [&str; 5] = ["voltage", "current", "power", "energy_total", "error_code"];
/// Reported as `error_code` when the plug cannot be read.
pub const UNREACHABLE_ERROR_CODE: f64 = 9999.0;

/// Energy meter of a TP-Link HS110 smart plug.
pub struct Hs110Adapter {
    name: String,
    client: TpLinkClient,
    template: SampleTemplate,
    read_timeout: Duration,
}

impl Hs110Adapter {
    pub fn new(
        name: impl Into<String>,
        client: TpLinkClient,
        measurement: Option<String>,
        mut tags: Tags,
    ) -> Self {
        tags.entry("sensor".to_string())
            .or_insert_with(|| "HS110".to_string());
        let template = SampleTemplate::new(
            measurement.unwrap_or_else(|| MEASUREMENT.to_string()),
            tags,
            FIELDS,
        )
        .with_failure_value("error_code", UNREACHABLE_ERROR_CODE);
        Self {
            name: name.into(),
            client,
            template,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl DeviceAdapter for Hs110Adapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn template(&self) -> &SampleTemplate {
        &self.template
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    async fn measure(&mut self) -> Result<Fields, ReadError> {
        let reading = self.client.realtime().await?;
        tracing::debug!(
            adapter = %self.name,
            addr = %self.client.addr(),
            power = reading.power,
            "plug reading"
        );
        Ok(reading.fields())
    }
}

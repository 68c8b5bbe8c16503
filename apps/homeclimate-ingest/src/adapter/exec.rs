use super::{DeviceAdapter, ReadError, DEFAULT_READ_TIMEOUT};
use crate::sample::{Fields, SampleTemplate, Tags, DEFAULT_MEASUREMENT};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Runs a helper program each tick and reads a flat JSON object of numeric
/// (or null) fields from its stdout. Sensor drivers that only exist as
/// vendor scripts plug in this way.
pub struct ExecAdapter {
    name: String,
    command: Vec<String>,
    template: SampleTemplate,
    read_timeout: Duration,
}

impl ExecAdapter {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        measurement: Option<String>,
        tags: Tags,
        fields: Vec<String>,
    ) -> Self {
        let template = SampleTemplate::new(
            measurement.unwrap_or_else(|| DEFAULT_MEASUREMENT.to_string()),
            tags,
            fields,
        );
        Self {
            name: name.into(),
            command,
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
impl DeviceAdapter for ExecAdapter {
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
        let Some((program, args)) = self.command.split_first() else {
            return Err(ReadError::SensorUnavailable("empty command".to_string()));
        };

        // The child dies with the future when the read times out.
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ReadError::SensorUnavailable(format!("failed to run {program}: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReadError::SensorUnavailable(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let mut fields = parse_fields(&output.stdout)?;
        let declared = &self.template.field_names;
        if !declared.is_empty() {
            fields.retain(|name, _| {
                let keep = declared.contains(name);
                if !keep {
                    tracing::debug!(adapter = %self.name, field = %name, "ignoring undeclared field");
                }
                keep
            });
        }
        Ok(fields)
    }
}

fn parse_fields(stdout: &[u8]) -> Result<Fields, ReadError> {
    let text = String::from_utf8_lossy(stdout);
    serde_json::from_str::<Fields>(text.trim()).map_err(|err| {
        ReadError::SensorUnavailable(format!("unparseable sensor output: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn adapter(script: &str) -> ExecAdapter {
        ExecAdapter::new(
            "dht22",
            shell(script),
            None,
            Tags::from([("sensor".to_string(), "DHT22".to_string())]),
            vec!["temperature".into(), "humidity".into()],
        )
    }

    #[test]
    fn parses_numbers_and_nulls() {
        let fields = parse_fields(b" {\"temperature\": 21.5, \"humidity\": null}\n").unwrap();
        assert_eq!(fields["temperature"], Some(21.5));
        assert_eq!(fields["humidity"], None);
    }

    #[test]
    fn rejects_non_numeric_output() {
        assert!(parse_fields(b"{\"temperature\": \"warm\"}").is_err());
        assert!(parse_fields(b"Failed to get reading").is_err());
    }

    #[tokio::test]
    async fn reads_declared_fields_from_stdout() {
        let mut adapter = adapter(r#"echo '{"temperature": 19.25, "humidity": 48, "debug": 1}'"#);

        let sample = adapter.read().await;

        assert_eq!(sample.measurement, "live logging");
        assert_eq!(sample.fields.len(), 2);
        assert_eq!(sample.fields["temperature"], Some(19.25));
        assert_eq!(sample.fields["humidity"], Some(48.0));
    }

    #[tokio::test]
    async fn failing_command_yields_gap() {
        let mut adapter = adapter("echo 'checksum error' >&2; exit 3");

        let sample = adapter.read().await;

        assert!(sample.is_gap());
        assert_eq!(sample.tags["sensor"], "DHT22");
    }

    #[tokio::test]
    async fn hung_command_is_killed_at_the_read_timeout() {
        let mut adapter = adapter("sleep 30").with_read_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let sample = adapter.read().await;

        assert!(sample.is_gap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

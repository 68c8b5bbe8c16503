use super::{DeviceAdapter, ReadError, DEFAULT_READ_TIMEOUT};
use crate::sample::{Fields, SampleTemplate, Tags};
use async_trait::async_trait;
use std::time::Duration;
use sysinfo::{Components, System};

pub const MEASUREMENT: &str = "system";
pub const FIELDS: [&str; 5] = ["cpu_load", "cpu_freq", "cpu_temp", "mem_load", "mem_used"];

const CPU_SENSOR_HINTS: [&str; 4] = ["cpu", "soc", "package", "k10temp"];

/// Health of the machine the ingester runs on.
pub struct SystemAdapter {
    name: String,
    system: System,
    template: SampleTemplate,
    read_timeout: Duration,
}

impl SystemAdapter {
    /// `machine` defaults to the host name.
    pub fn new(
        name: impl Into<String>,
        machine: Option<String>,
        measurement: Option<String>,
        mut tags: Tags,
    ) -> Self {
        let machine = machine
            .or_else(System::host_name)
            .unwrap_or_else(|| "unknown".to_string());
        tags.entry("machine".to_string()).or_insert(machine);
        let template = SampleTemplate::new(
            measurement.unwrap_or_else(|| MEASUREMENT.to_string()),
            tags,
            FIELDS,
        );
        let mut system = System::new();
        // Usage is a delta; prime it so the first tick has a baseline.
        system.refresh_cpu_all();
        Self {
            name: name.into(),
            system,
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
impl DeviceAdapter for SystemAdapter {
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
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        if total_memory == 0 {
            return Err(ReadError::SensorUnavailable(
                "memory statistics unavailable".to_string(),
            ));
        }
        let used_memory = self.system.used_memory();

        let cpu_freq = self
            .system
            .cpus()
            .first()
            .map(|cpu| cpu.frequency())
            .filter(|mhz| *mhz > 0)
            .map(|mhz| mhz as f64);

        Ok(Fields::from([
            (
                "cpu_load".to_string(),
                cpu_load(self.system.global_cpu_usage()),
            ),
            ("cpu_freq".to_string(), cpu_freq),
            ("cpu_temp".to_string(), cpu_temperature()),
            (
                "mem_load".to_string(),
                Some(used_memory as f64 / total_memory as f64 * 100.0),
            ),
            ("mem_used".to_string(), Some(used_memory as f64)),
        ]))
    }
}

/// A reading of exactly zero means the sampler had no baseline yet.
fn cpu_load(usage: f32) -> Option<f64> {
    if usage.is_finite() && usage > 0.0 {
        Some(usage as f64)
    } else {
        None
    }
}

fn cpu_temperature() -> Option<f64> {
    let components = Components::new_with_refreshed_list();
    let readings: Vec<(String, f32)> = components
        .list()
        .iter()
        .filter_map(|component| {
            let celsius: Option<f32> = component.temperature().into();
            celsius
                .filter(|value| value.is_finite())
                .map(|value| (component.label().to_ascii_lowercase(), value))
        })
        .collect();

    readings
        .iter()
        .find(|(label, _)| CPU_SENSOR_HINTS.iter().any(|hint| label.contains(hint)))
        .or_else(|| readings.first())
        .map(|(_, celsius)| *celsius as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cpu_load_is_missing() {
        assert_eq!(cpu_load(0.0), None);
        assert_eq!(cpu_load(f32::NAN), None);
        assert_eq!(cpu_load(12.5), Some(12.5));
    }

    #[test]
    fn machine_tag_defaults_but_can_be_set() {
        let adapter = SystemAdapter::new("pi", Some("garage-pi".into()), None, Tags::new());
        assert_eq!(adapter.template().tags["machine"], "garage-pi");
        assert_eq!(adapter.template().measurement, "system");

        let tags = Tags::from([("machine".to_string(), "custom".to_string())]);
        let adapter = SystemAdapter::new("pi", Some("garage-pi".into()), None, tags);
        assert_eq!(adapter.template().tags["machine"], "custom");
    }

    #[tokio::test]
    async fn reports_every_declared_field() {
        let mut adapter = SystemAdapter::new("pi", None, None, Tags::new());

        let sample = adapter.read().await;

        for field in FIELDS {
            assert!(sample.fields.contains_key(field), "{field}");
        }
        let mem_load = sample.fields["mem_load"].unwrap();
        assert!((0.0..=100.0).contains(&mem_load));
    }
}

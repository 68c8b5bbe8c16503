use crate::retry::{ExhaustionPolicy, RetryPolicy};
use crate::sample::Tags;
use crate::sink::{default_integer_fields, InfluxSinkConfig};
use crate::tplink::DEFAULT_PORT;
use crate::validate::{default_bounds, Bounds, Validator};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/homeclimate.json";

fn default_tplink_port() -> u16 {
    DEFAULT_PORT
}

/// One entry of the setup file's `adapters` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    Hs110 {
        name: String,
        host: String,
        #[serde(default = "default_tplink_port")]
        port: u16,
        #[serde(default)]
        measurement: Option<String>,
        #[serde(default)]
        tags: Tags,
        #[serde(default)]
        bounds: HashMap<String, Bounds>,
    },
    System {
        name: String,
        #[serde(default)]
        machine: Option<String>,
        #[serde(default)]
        measurement: Option<String>,
        #[serde(default)]
        tags: Tags,
        #[serde(default)]
        bounds: HashMap<String, Bounds>,
    },
    Exec {
        name: String,
        command: Vec<String>,
        #[serde(default)]
        fields: Vec<String>,
        #[serde(default)]
        measurement: Option<String>,
        #[serde(default)]
        tags: Tags,
        #[serde(default)]
        bounds: HashMap<String, Bounds>,
    },
}

impl AdapterConfig {
    pub fn name(&self) -> &str {
        match self {
            AdapterConfig::Hs110 { name, .. }
            | AdapterConfig::System { name, .. }
            | AdapterConfig::Exec { name, .. } => name,
        }
    }

    /// Per-adapter bounds; these win over the global table.
    pub fn bounds(&self) -> &HashMap<String, Bounds> {
        match self {
            AdapterConfig::Hs110 { bounds, .. }
            | AdapterConfig::System { bounds, .. }
            | AdapterConfig::Exec { bounds, .. } => bounds,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupFile {
    #[serde(default)]
    influx_url: Option<String>,
    #[serde(default)]
    influx_database: Option<String>,
    #[serde(default)]
    influx_username: Option<String>,
    #[serde(default)]
    influx_password: Option<String>,
    #[serde(default)]
    influx_timeout_ms: Option<u64>,
    #[serde(default)]
    influx_integer_fields: Option<Vec<String>>,
    #[serde(default)]
    sample_interval_seconds: Option<u64>,
    #[serde(default)]
    read_timeout_seconds: Option<u64>,
    #[serde(default)]
    write_max_attempts: Option<u32>,
    #[serde(default)]
    write_backoff_ms: Option<u64>,
    #[serde(default)]
    write_jitter_ms: Option<u64>,
    #[serde(default)]
    write_attempt_timeout_ms: Option<u64>,
    #[serde(default)]
    on_exhausted: Option<ExhaustionPolicy>,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    bounds: HashMap<String, Bounds>,
    #[serde(default)]
    adapters: Vec<AdapterConfig>,
}

fn load_setup_file(path: &Path) -> Result<Option<SetupFile>> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "setup config not found; using environment and defaults"
        );
        return Ok(None);
    }
    let mut bytes = std::fs::read(path)
        .with_context(|| format!("failed to read setup config {}", path.display()))?;
    let setup = simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("failed to parse setup config {}", path.display()))?;
    Ok(Some(setup))
}

#[derive(Clone, Debug)]
pub struct Config {
    pub setup_path: PathBuf,
    pub influx_url: String,
    pub influx_database: String,
    pub influx_username: Option<String>,
    pub influx_password: Option<String>,
    pub influx_timeout_ms: u64,
    pub influx_integer_fields: BTreeSet<String>,
    pub sample_interval_seconds: u64,
    pub read_timeout_seconds: u64,
    pub write_max_attempts: NonZeroU32,
    pub write_backoff_ms: u64,
    pub write_jitter_ms: Option<u64>,
    pub write_attempt_timeout_ms: u64,
    pub on_exhausted: ExhaustionPolicy,
    pub global_tags: Tags,
    pub bounds: HashMap<String, Bounds>,
    pub adapters: Vec<AdapterConfig>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Reads `.env`, the process environment and the setup file.
    pub fn load(setup_override: Option<&Path>) -> Result<Self> {
        dotenv().ok();
        Self::from_sources(|key| env::var(key).ok(), setup_override)
    }

    /// Environment values win over the setup file, which wins over defaults.
    pub fn from_sources<F>(env: F, setup_override: Option<&Path>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let setup_path = setup_override
            .map(Path::to_path_buf)
            .or_else(|| env_value("HOMECLIMATE_SETUP_CONFIG_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH));
        let setup = load_setup_file(&setup_path)?.unwrap_or_default();

        let text = |key: &str, from_setup: &Option<String>| {
            env_value(key).or_else(|| {
                from_setup
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };

        let influx_url = text("HOMECLIMATE_INFLUX_URL", &setup.influx_url)
            .unwrap_or_else(|| "http://127.0.0.1:8086".to_string());
        let influx_database = text("HOMECLIMATE_INFLUX_DATABASE", &setup.influx_database)
            .unwrap_or_else(|| "homeclimate".to_string());
        let influx_username = text("HOMECLIMATE_INFLUX_USERNAME", &setup.influx_username);
        let influx_password = text("HOMECLIMATE_INFLUX_PASSWORD", &setup.influx_password);

        let influx_timeout_ms =
            number(&env_value, "HOMECLIMATE_INFLUX_TIMEOUT_MS", setup.influx_timeout_ms)?
                .filter(|v| *v != 0)
                .unwrap_or(10_000);
        let influx_integer_fields = match env_value("HOMECLIMATE_INFLUX_INTEGER_FIELDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect(),
            None => setup
                .influx_integer_fields
                .map(|fields| fields.into_iter().collect())
                .unwrap_or_else(default_integer_fields),
        };
        let sample_interval_seconds = number(
            &env_value,
            "HOMECLIMATE_SAMPLE_INTERVAL_SECONDS",
            setup.sample_interval_seconds,
        )?
        .filter(|v| *v != 0)
        .unwrap_or(30);
        let read_timeout_seconds = number(
            &env_value,
            "HOMECLIMATE_READ_TIMEOUT_SECONDS",
            setup.read_timeout_seconds,
        )?
        .filter(|v| *v != 0)
        .unwrap_or(15);
        let write_max_attempts = number(
            &env_value,
            "HOMECLIMATE_WRITE_MAX_ATTEMPTS",
            setup.write_max_attempts,
        )?
        .unwrap_or(3);
        let write_max_attempts = NonZeroU32::new(write_max_attempts)
            .context("write_max_attempts must be at least 1")?;
        let write_backoff_ms =
            number(&env_value, "HOMECLIMATE_WRITE_BACKOFF_MS", setup.write_backoff_ms)?
                .unwrap_or(5_000);
        let write_jitter_ms =
            number(&env_value, "HOMECLIMATE_WRITE_JITTER_MS", setup.write_jitter_ms)?
                .filter(|v| *v != 0);
        let write_attempt_timeout_ms = number(
            &env_value,
            "HOMECLIMATE_WRITE_ATTEMPT_TIMEOUT_MS",
            setup.write_attempt_timeout_ms,
        )?
        .filter(|v| *v != 0)
        .unwrap_or(15_000);
        let on_exhausted = match env_value("HOMECLIMATE_ON_EXHAUSTED") {
            Some(raw) => raw
                .parse::<ExhaustionPolicy>()
                .map_err(anyhow::Error::msg)
                .context("invalid HOMECLIMATE_ON_EXHAUSTED")?,
            None => setup.on_exhausted.unwrap_or_default(),
        };

        Ok(Self {
            setup_path,
            influx_url,
            influx_database,
            influx_username,
            influx_password,
            influx_timeout_ms,
            influx_integer_fields,
            sample_interval_seconds,
            read_timeout_seconds,
            write_max_attempts,
            write_backoff_ms,
            write_jitter_ms,
            write_attempt_timeout_ms,
            on_exhausted,
            global_tags: setup.tags,
            bounds: setup.bounds,
            adapters: setup.adapters,
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.write_attempt_timeout_ms)
    }

    pub fn write_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(
            self.write_max_attempts,
            Duration::from_millis(self.write_backoff_ms),
        );
        match self.write_jitter_ms {
            Some(ms) => policy.with_jitter(Duration::from_millis(ms)),
            None => policy,
        }
    }

    pub fn influx_sink_config(&self) -> InfluxSinkConfig {
        InfluxSinkConfig {
            url: self.influx_url.clone(),
            database: self.influx_database.clone(),
            username: self.influx_username.clone(),
            password: self.influx_password.clone(),
            timeout: Duration::from_millis(self.influx_timeout_ms),
            integer_fields: self.influx_integer_fields.clone(),
        }
    }

    /// Built-in bounds overlaid with the setup file's global table.
    pub fn validator(&self) -> Validator {
        Validator::new(default_bounds()).with_overrides(&self.bounds)
    }
}

fn number<T, E>(env_value: &E, key: &str, from_setup: Option<T>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    E: Fn(&str) -> Option<String>,
{
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}={raw:?}")),
        None => Ok(from_setup),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn setup_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_setup_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");

        let config = Config::from_sources(env_of(&[]), Some(&path)).unwrap();

        assert_eq!(config.influx_url, "http://127.0.0.1:8086");
        assert_eq!(config.influx_database, "homeclimate");
        assert_eq!(config.sample_interval(), Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(15));
        assert_eq!(config.write_max_attempts.get(), 3);
        assert_eq!(config.on_exhausted, ExhaustionPolicy::Drop);
        assert!(config.adapters.is_empty());
        assert_eq!(config.write_policy().jitter, None);
        assert_eq!(
            config.influx_sink_config().integer_fields,
            BTreeSet::from(["error_code".to_string(), "mem_used".to_string()])
        );
    }

    #[test]
    fn integer_fields_come_from_setup_or_environment() {
        let file = setup_file(r#"{"influx_integer_fields": ["error_code", "co2"]}"#);

        let config = Config::from_sources(env_of(&[]), Some(file.path())).unwrap();
        assert_eq!(
            config.influx_integer_fields,
            BTreeSet::from(["co2".to_string(), "error_code".to_string()])
        );

        let env = env_of(&[("HOMECLIMATE_INFLUX_INTEGER_FIELDS", "mem_used, ,pressure")]);
        let config = Config::from_sources(env, Some(file.path())).unwrap();
        assert_eq!(
            config.influx_sink_config().integer_fields,
            BTreeSet::from(["mem_used".to_string(), "pressure".to_string()])
        );
    }

    #[test]
    fn parses_adapters_bounds_and_tags() {
        let file = setup_file(
            r#"{
                "influx_database": "climate",
                "on_exhausted": "exit",
                "tags": {"site": "home"},
                "bounds": {"temperature": {"min": -30.0, "max": 45.0}},
                "adapters": [
                    {"kind": "hs110", "name": "dryer", "host": "10.0.0.20"},
                    {"kind": "system", "name": "pi", "machine": "garage-pi"},
                    {
                        "kind": "exec",
                        "name": "outdoor",
                        "command": ["/usr/local/bin/read-bmp180"],
                        "fields": ["temperature", "pressure"],
                        "tags": {"room": "outdoor", "sensor": "BMP180"},
                        "bounds": {"pressure": {"min": 950.0, "max": 1050.0}}
                    }
                ]
            }"#,
        );

        let config = Config::from_sources(env_of(&[]), Some(file.path())).unwrap();

        assert_eq!(config.influx_database, "climate");
        assert_eq!(config.on_exhausted, ExhaustionPolicy::Exit);
        assert_eq!(config.global_tags["site"], "home");
        assert_eq!(config.adapters.len(), 3);
        assert_eq!(
            config.adapters[0],
            AdapterConfig::Hs110 {
                name: "dryer".into(),
                host: "10.0.0.20".into(),
                port: 9999,
                measurement: None,
                tags: Tags::new(),
                bounds: HashMap::new(),
            }
        );
        assert_eq!(config.adapters[2].name(), "outdoor");
        assert_eq!(
            config.adapters[2].bounds()["pressure"],
            Bounds::new(950.0, 1050.0)
        );

        let validator = config.validator();
        assert_eq!(validator.validate("temperature", Some(-25.0)), Some(-25.0));
        assert_eq!(validator.validate("humidity", Some(101.0)), None);
    }

    #[test]
    fn environment_pins_win_over_setup_file() {
        let file = setup_file(r#"{"influx_url": "http://nas:8086", "write_max_attempts": 7}"#);
        let env = env_of(&[
            ("HOMECLIMATE_INFLUX_URL", " http://influx:8086 "),
            ("HOMECLIMATE_WRITE_JITTER_MS", "250"),
            ("HOMECLIMATE_ON_EXHAUSTED", "exit"),
        ]);

        let config = Config::from_sources(env, Some(file.path())).unwrap();

        assert_eq!(config.influx_url, "http://influx:8086");
        assert_eq!(config.write_max_attempts.get(), 7);
        assert_eq!(config.write_policy().jitter, Some(Duration::from_millis(250)));
        assert_eq!(config.on_exhausted, ExhaustionPolicy::Exit);
    }

    #[test]
    fn setup_path_comes_from_environment() {
        let file = setup_file(r#"{"sample_interval_seconds": 60}"#);
        let path = file.path().to_string_lossy().to_string();
        let env = env_of(&[("HOMECLIMATE_SETUP_CONFIG_PATH", path.as_str())]);

        let config = Config::from_sources(env, None).unwrap();

        assert_eq!(config.setup_path, file.path());
        assert_eq!(config.sample_interval(), Duration::from_secs(60));
    }

    #[test]
    fn zero_write_attempts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let env = env_of(&[("HOMECLIMATE_WRITE_MAX_ATTEMPTS", "0")]);

        let err = Config::from_sources(env, Some(&path)).unwrap_err();
        assert!(err.to_string().contains("write_max_attempts"));
    }

    #[test]
    fn malformed_values_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let env = env_of(&[("HOMECLIMATE_SAMPLE_INTERVAL_SECONDS", "soon")]);
        assert!(Config::from_sources(env, Some(&path)).is_err());

        let file = setup_file(r#"{"adapters": [{"kind": "zigbee", "name": "x"}]}"#);
        assert!(Config::from_sources(env_of(&[]), Some(file.path())).is_err());
    }
}

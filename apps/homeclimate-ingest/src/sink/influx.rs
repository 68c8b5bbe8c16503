use super::{Sink, SinkError};
use crate::sample::Sample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeSet;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 256;

/// Fields written as line-protocol integers (`12i`). InfluxDB fixes a
/// field's type on first write, so these must match existing series.
pub const DEFAULT_INTEGER_FIELDS: [&str; 2] = ["error_code", "mem_used"];

pub fn default_integer_fields() -> BTreeSet<String> {
    DEFAULT_INTEGER_FIELDS.iter().map(|f| f.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct InfluxSinkConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub integer_fields: BTreeSet<String>,
}

/// InfluxDB 1.x `/write` endpoint client speaking line protocol.
#[derive(Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    integer_fields: BTreeSet<String>,
}

impl InfluxSink {
    pub fn new(config: &InfluxSinkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build InfluxDB HTTP client")?;
        Ok(Self {
            client,
            write_url: format!("{}/write", config.url.trim_end_matches('/')),
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            integer_fields: config.integer_fields.clone(),
        })
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, batch: &[Sample]) -> Result<(), SinkError> {
        let lines: Vec<String> = batch
            .iter()
            .filter_map(|sample| encode_line(sample, &self.integer_fields))
            .collect();
        if lines.is_empty() {
            tracing::debug!(len = batch.len(), "batch has no representable points; skipping write");
            return Ok(());
        }
        if lines.len() < batch.len() {
            tracing::debug!(
                skipped = batch.len() - lines.len(),
                "skipped samples without any field value"
            );
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "ns")])
            .body(lines.join("\n"));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

fn classify_transport_error(err: reqwest::Error) -> SinkError {
    if err.is_timeout() {
        SinkError::Timeout
    } else if err.is_connect() {
        SinkError::ServerError(err.to_string())
    } else {
        SinkError::Unknown(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> SinkError {
    let body: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        SinkError::Timeout
    } else if status.is_server_error() {
        SinkError::ServerError(message)
    } else {
        SinkError::Unknown(message)
    }
}

/// Renders one sample as a line-protocol point
/// (`measurement,tag=v field=v timestamp_ns`). Null fields are left out;
/// a sample without any value has no line. Fields in `integer_fields` are
/// rounded and written with the `i` suffix.
pub fn encode_line(sample: &Sample, integer_fields: &BTreeSet<String>) -> Option<String> {
    let timestamp = sample.timestamp_nanos()?;
    let fields: Vec<String> = sample
        .fields
        .iter()
        .filter_map(|(key, value)| {
            let value = (*value).filter(|v| v.is_finite())?;
            if integer_fields.contains(key) {
                Some(format!("{}={}i", escape_key(key), value.round() as i64))
            } else {
                Some(format!("{}={}", escape_key(key), value))
            }
        })
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&sample.measurement);
    for (key, value) in &sample.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&timestamp.to_string());
    Some(line)
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

//! One-shot batch delivery: read samples, validate, deliver once with a
//! bounded retry budget and report the outcome as a process status.

use crate::poller::Tagger;
use crate::retry::{Delivery, DeliveryError, RetryingWriter};
use crate::sample::Sample;
use crate::validate::Validator;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Reads newline-delimited JSON samples. Blank lines are skipped.
pub fn read_samples<R: BufRead>(reader: R) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid sample on line {}", index + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

/// `-` reads stdin.
pub fn load_input(input: &str) -> Result<Vec<Sample>> {
    if input == "-" {
        return read_samples(io::stdin().lock());
    }
    let path = Path::new(input);
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_samples(BufReader::new(file))
}

/// Validates and tags `samples`, then hands them to `writer` as one batch.
/// An empty batch succeeds without touching the sink.
pub async fn push(
    mut samples: Vec<Sample>,
    validator: &Validator,
    tagger: &Tagger,
    writer: &RetryingWriter,
) -> Result<Delivery, DeliveryError> {
    if samples.is_empty() {
        tracing::info!("no samples to deliver");
        return Ok(Delivery { attempts: 0 });
    }
    for sample in &mut samples {
        let nulled = validator.apply(sample);
        if !nulled.is_empty() {
            tracing::warn!(measurement = %sample.measurement, fields = ?nulled, "nulled implausible values");
        }
        tagger.apply(sample);
    }

    let delivery = writer.write(&samples).await?;
    tracing::info!(
        samples = samples.len(),
        attempts = delivery.attempts,
        "batch delivered"
    );
    Ok(delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::sample::Tags;
    use crate::sink::{Sink, SinkError};
    use crate::validate::default_bounds;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        calls: Mutex<Vec<(Instant, Vec<Sample>)>>,
    }

    #[async_trait]
    impl Sink for Recorder {
        async fn write(&self, batch: &[Sample]) -> Result<(), SinkError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), batch.to_vec()));
            if self.fail {
                Err(SinkError::ServerError("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    const BACKUP_LINES: &str = concat!(
        r#"{"measurement":"backup","tags":{"target":"nas"},"timestamp":"2024-03-01T02:00:00Z","fields":{"success":1.0,"duration":812.5}}"#,
        "\n\n",
        r#"{"measurement":"live logging","tags":{"room":"attic"},"timestamp":1709258400000,"fields":{"temperature":55.0,"humidity":40.0}}"#,
        "\n",
    );

    #[test]
    fn reads_ndjson_from_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BACKUP_LINES.as_bytes()).unwrap();

        let samples = load_input(file.path().to_str().unwrap()).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].measurement, "backup");
        assert_eq!(samples[1].fields["humidity"], Some(40.0));
    }

    #[test]
    fn reports_the_offending_line() {
        let input = "{\"measurement\":\"x\",\"timestamp\":0}\nnot json\n";
        let err = read_samples(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_validated_tagged_and_delivered_once() {
        let sink = Arc::new(Recorder::default());
        let writer = RetryingWriter::new(sink.clone(), RetryPolicy::batch());
        let tagger = Tagger::new(Tags::from([("site".to_string(), "home".to_string())]));
        let samples = read_samples(BACKUP_LINES.as_bytes()).unwrap();

        let delivery = push(
            samples,
            &Validator::new(default_bounds()),
            &tagger,
            &writer,
        )
        .await
        .unwrap();

        assert_eq!(delivery.attempts, 1);
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let batch = &calls[0].1;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].fields["temperature"], None);
        assert_eq!(batch[1].fields["humidity"], Some(40.0));
        assert!(batch.iter().all(|s| s.tags["site"] == "home"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_sink_exhausts_the_batch_policy() {
        let sink = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let writer = RetryingWriter::new(sink.clone(), RetryPolicy::batch());
        let samples = read_samples(BACKUP_LINES.as_bytes()).unwrap();

        let err = push(samples, &Validator::default(), &Tagger::default(), &writer)
            .await
            .unwrap_err();

        let DeliveryError::Exhausted { attempts, batch_len, .. } = err;
        assert_eq!(attempts, 5);
        assert_eq!(batch_len, 2);
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert!(calls[4].0 - calls[0].0 >= Duration::from_secs(240));
    }

    #[tokio::test]
    async fn empty_input_never_contacts_the_sink() {
        let sink = Arc::new(Recorder::default());
        let writer = RetryingWriter::new(sink.clone(), RetryPolicy::batch());

        let delivery = push(Vec::new(), &Validator::default(), &Tagger::default(), &writer)
            .await
            .unwrap();

        assert_eq!(delivery.attempts, 0);
        assert!(sink.calls.lock().unwrap().is_empty());
    }
}

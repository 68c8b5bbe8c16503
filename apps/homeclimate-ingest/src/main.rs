use anyhow::{Context, Result};
use clap::Parser;
use homeclimate_ingest::cli::{Cli, Command, PushArgs};
use homeclimate_ingest::config::Config;
use homeclimate_ingest::poller::Tagger;
use homeclimate_ingest::push;
use homeclimate_ingest::retry::RetryingWriter;
use homeclimate_ingest::service::{self, RunOutcome};
use homeclimate_ingest::sink::{InfluxSink, Sink};
use std::process::ExitCode;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,homeclimate_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "homeclimate-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn run(config: Config) -> Result<ExitCode> {
    let sink: Arc<dyn Sink> = Arc::new(InfluxSink::new(&config.influx_sink_config())?);
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    match service::run_pollers(&config, sink, shutdown).await?.outcome {
        RunOutcome::Stopped => Ok(ExitCode::SUCCESS),
        RunOutcome::Exhausted => Ok(ExitCode::FAILURE),
    }
}

async fn push_batch(config: Config, args: &PushArgs) -> Result<ExitCode> {
    let samples = push::load_input(&args.input)
        .with_context(|| format!("failed to load samples from {}", args.input))?;
    let sink: Arc<dyn Sink> = Arc::new(InfluxSink::new(&config.influx_sink_config())?);
    let writer =
        RetryingWriter::new(sink, args.policy()).with_attempt_timeout(config.write_attempt_timeout());
    let tagger = Tagger::new(config.global_tags.clone());

    match push::push(samples, &config.validator(), &tagger, &writer).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            tracing::error!(error = %err, "batch delivery failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.setup.as_deref())?;
    init_tracing(&config)?;

    match cli.command() {
        Command::Run => run(config).await,
        Command::Push(args) => push_batch(config, args).await,
    }
}

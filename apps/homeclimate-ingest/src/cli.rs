use crate::retry::{RetryPolicy, BATCH_BACKOFF, BATCH_MAX_ATTEMPTS};
use clap::{Args, Parser, Subcommand};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "homeclimate-ingest",
    version,
    about = "Polls home climate sensors and writes samples to InfluxDB"
)]
pub struct Cli {
    /// Setup file; overrides HOMECLIMATE_SETUP_CONFIG_PATH.
    #[arg(long, global = true)]
    pub setup: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Run)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll every configured adapter until interrupted (default).
    Run,
    /// Deliver newline-delimited JSON samples as one batch.
    Push(PushArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct PushArgs {
    /// Input file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    pub input: String,
    #[arg(long, default_value_t = NonZeroU32::MIN.saturating_add(BATCH_MAX_ATTEMPTS - 1))]
    pub max_attempts: NonZeroU32,
    #[arg(long, default_value_t = BATCH_BACKOFF.as_secs())]
    pub backoff_secs: u64,
}

impl PushArgs {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.backoff_secs))
    }
}

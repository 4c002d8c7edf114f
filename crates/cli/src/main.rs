// crates/cli/src/main.rs
//! `jobwatch`: monitor remote processing jobs until they finish.
//!
//! Polls every job id given on the command line concurrently, logs progress
//! as it arrives and prints one combined report at the end. Exits non-zero
//! unless every job completed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use jobwatch_core::{JobHandle, JobRegistry, MonitorConfig, PollEvent, PollState, StatusClient};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "jobwatch", version, about = "Poll remote processing jobs until they finish")]
struct Args {
    /// Job ids to monitor.
    #[arg(required = true)]
    job_ids: Vec<String>,

    /// TOML config file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Base URL of the job status service.
    #[arg(long)]
    base_url: Option<String>,

    /// Seconds between status queries.
    #[arg(long)]
    interval: Option<f64>,

    /// Give up after this many seconds.
    #[arg(long)]
    max_duration: Option<f64>,

    /// Report output format.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    log_format: Format,
}

fn init_tracing(format: Format) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,jobwatch_core=info,jobwatch=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        Format::Text => builder.compact().init(),
        Format::Json => builder.json().init(),
    }
}

/// Load file + env config, then apply command-line overrides.
fn load_config(args: &Args) -> Result<MonitorConfig> {
    let mut config = MonitorConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &args.base_url {
        config.client.base_url = url.clone();
    }
    if let Some(secs) = args.interval {
        config.polling.interval_secs = secs;
    }
    if let Some(secs) = args.max_duration {
        config.polling.max_duration_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Job ids in command-line order with repeats removed.
fn unique_job_ids(ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Log poll events until every job has finished.
async fn log_events(mut rx: broadcast::Receiver<PollEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) if event.state == PollState::Polling => match &event.error {
                Some(error) => tracing::warn!(job_id = %event.job_id, poll = event.poll, %error, "Status query failed"),
                None => tracing::info!(
                    job_id = %event.job_id,
                    poll = event.poll,
                    status = ?event.status,
                    progress = event.progress,
                    step = event.current_step.as_deref().unwrap_or(""),
                    stalled = event.stalled,
                    "Progress"
                ),
            },
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "Progress log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(&args)?;
    let client = StatusClient::new(&config.client).context("building status client")?;
    let registry = Arc::new(JobRegistry::new(Arc::new(client), config.polling.to_options()));

    let logger = tokio::spawn(log_events(registry.subscribe()));

    for id in unique_job_ids(&args.job_ids) {
        let handle = JobHandle::new(id)?;
        registry
            .register(handle)
            .with_context(|| format!("starting monitor for job {id}"))?;
    }

    let ctrl_c_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling all jobs");
            ctrl_c_registry.cancel_all();
        }
    });

    let report = registry.wait_all().await;
    logger.abort();

    match args.format {
        Format::Text => println!("{report}"),
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(if report.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_job_ids_keeps_first_occurrence() {
        let ids: Vec<String> = ["pdf-b", "pdf-a", "pdf-b", "pdf-c", "pdf-a"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(unique_job_ids(&ids), vec!["pdf-b", "pdf-a", "pdf-c"]);
    }

    #[test]
    fn test_args_accept_repeated_ids() {
        let args = Args::try_parse_from(["jobwatch", "job-1", "job-1", "--interval", "2"]).unwrap();
        assert_eq!(unique_job_ids(&args.job_ids), vec!["job-1"]);
        assert_eq!(args.interval, Some(2.0));
    }
}

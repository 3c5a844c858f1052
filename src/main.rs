mod config;
mod generator;
mod llm;
mod pipeline;
mod prompts;
mod quota;
mod record;
mod sink;
mod source;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::PipelineConfig;
use generator::DescriptionGenerator;
use llm::{LlmClient, LlmSettings};
use pipeline::{BatchCoordinator, Progress};
use prompts::PromptTemplate;
use quota::QuotaTracker;
use sink::CsvSink;

/// Generate one description per archival media record with an LLM.
#[derive(Parser, Debug)]
#[command(name = "media-describer", version)]
struct Args {
    /// Input CSV, one row per media file, with a header row
    input: PathBuf,

    /// Output CSV (default: output/descriptions_<timestamp>.csv)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Replace the built-in system prompt with the contents of this file
    #[arg(long, env = "DESCRIBER_SYSTEM_PROMPT_PATH")]
    system_prompt: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load env before clap so `.env` values feed its env fallbacks
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = PipelineConfig::from_env()?;
    let settings = LlmSettings::from_env()?;
    let client = LlmClient::new(&settings)?;
    info!(
        provider = ?settings.provider,
        model = %settings.model,
        "LLM client initialized"
    );

    let mut template = PromptTemplate::new(settings.model.clone(), settings.max_tokens);
    if let Some(path) = &args.system_prompt {
        template = template.with_system_file(path)?;
        info!(path = %path.display(), "Using custom system prompt");
    }

    let output_path = match args.output {
        Some(path) => path,
        None => default_output_path(),
    };
    if let Some(dir) = output_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let source = source::csv_records(&args.input, config.batch_size)?;
    let mut sink = CsvSink::create(&output_path)?;
    info!(input = %args.input.display(), output = %output_path.display(), "Starting CSV processing");

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current batch");
            let _ = stop_tx.send(true);
        }
    });

    let (progress_tx, progress_rx) = watch::channel(Progress::default());
    let reporter = tokio::spawn(report_progress(progress_rx));

    let generator = DescriptionGenerator::new(client, template, config.retry.clone());
    let coordinator = BatchCoordinator::new(generator, QuotaTracker::start(&config.quota), &config)
        .with_progress(progress_tx)
        .with_stop_signal(stop_rx);

    let result = coordinator.run(source, &mut sink).await;
    coordinator.shutdown();
    // Dropping the coordinator closed the progress channel
    let _ = reporter.await;

    match result {
        Ok(summary) => {
            info!(
                output = %sink.path().display(),
                processed = summary.processed,
                described = summary.described,
                skipped = summary.skipped,
                failed = summary.failed,
                aborted = summary.aborted,
                "Processing complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(
                output = %output_path.display(),
                rows_written = sink.rows(),
                "Processing error: {:#}",
                e
            );
            Err(e)
        }
    }
}

/// Log each progress update until the coordinator drops its sender.
async fn report_progress(mut rx: watch::Receiver<Progress>) {
    while rx.changed().await.is_ok() {
        let progress = *rx.borrow_and_update();
        info!(
            processed = progress.processed,
            seen = progress.seen,
            source_exhausted = progress.source_exhausted,
            "Progress"
        );
    }
}

/// `output/descriptions_<UTC timestamp>.csv`, with `:` and `.` made filename-safe.
fn default_output_path() -> PathBuf {
    let timestamp = chrono::Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    Path::new("output").join(format!("descriptions_{}.csv", timestamp))
}

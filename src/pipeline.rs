use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::generator::{DescriptionGenerator, Outcome};
use crate::llm::CompletionService;
use crate::quota::QuotaTracker;
use crate::record::Record;
use crate::sink::{OutputRow, RowSink};

/// Running counts. `seen` is only the final total once `source_exhausted` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub seen: u64,
    pub source_exhausted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub described: u64,
    pub skipped: u64,
    pub failed: u64,
    pub batches: u64,
    pub quota_waits: u64,
    /// Stopped at a batch boundary before the source ran out.
    pub aborted: bool,
}

/// Drains a record stream in fixed-size batches, one record at a time.
///
/// Records are never described concurrently: the shared quota count and the
/// sink's row order both rely on a single in-order worker.
pub struct BatchCoordinator<S> {
    generator: DescriptionGenerator<S>,
    quota: QuotaTracker,
    batch_size: usize,
    batch_delay: Duration,
    progress: Option<watch::Sender<Progress>>,
    stop: Option<watch::Receiver<bool>>,
}

impl<S: CompletionService> BatchCoordinator<S> {
    pub fn new(
        generator: DescriptionGenerator<S>,
        quota: QuotaTracker,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            generator,
            quota,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay,
            progress: None,
            stop: None,
        }
    }

    /// Publish progress after every batch.
    pub fn with_progress(mut self, tx: watch::Sender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Honour a stop request at the next batch boundary.
    pub fn with_stop_signal(mut self, rx: watch::Receiver<bool>) -> Self {
        self.stop = Some(rx);
        self
    }

    #[cfg(test)]
    pub fn generator(&self) -> &DescriptionGenerator<S> {
        &self.generator
    }

    /// Stop the quota tracker's reset task.
    pub fn shutdown(self) {
        self.quota.stop();
    }

    /// Describe every record from `source`, appending exactly one row per record to `sink`.
    ///
    /// Only source and sink failures are returned as errors; per-record failures become rows.
    pub async fn run<St, K>(&self, source: St, sink: &mut K) -> Result<RunSummary>
    where
        St: Stream<Item = Result<Record>>,
        K: RowSink,
    {
        let mut source = std::pin::pin!(source);
        let mut summary = RunSummary::default();
        let mut progress = Progress::default();
        let mut batch: Vec<Record> = Vec::with_capacity(self.batch_size);

        info!(
            batch_size = self.batch_size,
            batch_delay_ms = self.batch_delay.as_millis() as u64,
            "Starting description run"
        );

        loop {
            if batch.is_empty() && self.stop_requested() {
                warn!(
                    processed = summary.processed,
                    "Stop requested, ending run at batch boundary"
                );
                summary.aborted = true;
                break;
            }

            match source.next().await {
                Some(record) => {
                    let record = record.with_context(|| {
                        format!("Failed to read input row {}", progress.seen + 1)
                    })?;
                    progress.seen += 1;
                    batch.push(record);

                    if batch.len() == self.batch_size {
                        self.drain(&mut batch, sink, &mut summary, &mut progress)
                            .await?;
                        tokio::time::sleep(self.batch_delay).await;
                    }
                }
                None => {
                    progress.source_exhausted = true;
                    if !batch.is_empty() {
                        self.drain(&mut batch, sink, &mut summary, &mut progress)
                            .await?;
                    }
                    break;
                }
            }
        }

        self.publish(progress);
        info!(
            processed = summary.processed,
            described = summary.described,
            skipped = summary.skipped,
            failed = summary.failed,
            batches = summary.batches,
            quota_waits = summary.quota_waits,
            "Description run finished"
        );
        Ok(summary)
    }

    async fn drain<K: RowSink>(
        &self,
        batch: &mut Vec<Record>,
        sink: &mut K,
        summary: &mut RunSummary,
        progress: &mut Progress,
    ) -> Result<()> {
        summary.batches += 1;
        info!(batch = summary.batches, size = batch.len(), "Processing batch");

        for record in batch.drain(..) {
            let row = summary.processed + 1;
            let generation = self.generator.generate(row, &record, &self.quota).await;
            summary.quota_waits += u64::from(generation.quota_waits);
            match &generation.outcome {
                Outcome::Description(_) => summary.described += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Failed(_) => summary.failed += 1,
            }

            let output = OutputRow {
                text: generation.outcome.row_text(),
            };
            sink.append(&output)
                .with_context(|| format!("Failed to write output for row {}", row))?;
            summary.processed += 1;
            debug!(
                row,
                filename = record.filename(),
                wrote = if output.text.is_empty() { "blank line" } else { "description" },
                "Row written"
            );
        }

        progress.processed = summary.processed;
        info!("Processed {}/{} rows", progress.processed, progress.seen);
        self.publish(*progress);
        Ok(())
    }

    fn publish(&self, progress: Progress) {
        if let Some(tx) = &self.progress {
            tx.send_replace(progress);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::config::{QuotaConfig, RetryConfig};
    use crate::llm::testing::{rate_limited, server_error, text, ScriptedService};
    use crate::prompts::PromptTemplate;
    use crate::record::FILENAME;

    fn records(names: &[&str]) -> Vec<Record> {
        names
            .iter()
            .map(|n| [(FILENAME, *n)].into_iter().collect())
            .collect()
    }

    fn stream(names: &[&str]) -> impl Stream<Item = Result<Record>> {
        futures::stream::iter(records(names).into_iter().map(Ok::<Record, anyhow::Error>))
    }

    fn coordinator(
        service: ScriptedService,
        config: &PipelineConfig,
    ) -> BatchCoordinator<ScriptedService> {
        let generator = DescriptionGenerator::new(
            service,
            PromptTemplate::new("test-model", 200),
            config.retry.clone(),
        );
        BatchCoordinator::new(generator, QuotaTracker::start(&config.quota), config)
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryConfig {
                call_delay: Duration::ZERO,
                ..RetryConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn texts(rows: &[OutputRow]) -> Vec<&str> {
        rows.iter().map(|r| r.text.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_seven_records_two_batches_no_quota_wait() {
        let config = PipelineConfig::default();
        let coordinator = coordinator(ScriptedService::default(), &config);
        let mut sink: Vec<OutputRow> = Vec::new();

        let summary = coordinator
            .run(stream(&["a", "b", "c", "d", "e", "f", "g"]), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.processed, 7);
        assert_eq!(summary.described, 7);
        assert_eq!(summary.quota_waits, 0);
        assert!(!summary.aborted);
        assert_eq!(
            texts(&sink),
            vec![
                "described a",
                "described b",
                "described c",
                "described d",
                "described e",
                "described f",
                "described g"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_row_per_record_whatever_the_outcome() {
        let config = quick_config();
        let service = ScriptedService::new(vec![
            text("A map of Bidar."),
            server_error("bad gateway"),
            rate_limited(),
            text("A recovered description."),
        ]);
        let coordinator = coordinator(service, &config);
        let mut sink: Vec<OutputRow> = Vec::new();

        let summary = coordinator
            .run(stream(&["map.jpg", "", "broken.pdf", "  ", "slow.wav"]), &mut sink)
            .await
            .unwrap();

        assert_eq!(
            texts(&sink),
            vec![
                "A map of Bidar.",
                "",
                "Error: 500 bad gateway",
                "",
                "A recovered description."
            ]
        );
        assert_eq!(summary.described, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(coordinator.generator().service().calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failures_still_fill_batch() {
        let config = quick_config();
        let service = ScriptedService::new((0..5).map(|_| server_error("down")).collect());
        let coordinator = coordinator(service, &config);
        let mut sink: Vec<OutputRow> = Vec::new();

        let summary = coordinator
            .run(stream(&["1", "2", "3", "4", "5"]), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.len(), 5);
        assert!(sink.iter().all(|r| r.text == "Error: 500 down"));
        assert_eq!(summary.failed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_batch_delay_only_after_full_batches() {
        let config = quick_config();

        let full = coordinator(ScriptedService::default(), &config);
        let start = Instant::now();
        full.run(stream(&["1"; 10]), &mut Vec::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));

        let partial = coordinator(ScriptedService::default(), &config);
        let start = Instant::now();
        partial.run(stream(&["1"; 7]), &mut Vec::new()).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_pauses_run() {
        let config = PipelineConfig {
            quota: QuotaConfig {
                ceiling: 2,
                window: Duration::from_secs(60),
            },
            ..quick_config()
        };
        let coordinator = coordinator(ScriptedService::default(), &config);
        let start = Instant::now();
        let mut sink: Vec<OutputRow> = Vec::new();

        let summary = coordinator
            .run(stream(&["a", "b", "c", "d"]), &mut sink)
            .await
            .unwrap();
        assert_eq!(summary.quota_waits, 1);
        assert_eq!(sink.len(), 4);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    struct PullCountingSink {
        pulled: Arc<AtomicUsize>,
        pulled_at_append: Vec<usize>,
    }

    impl RowSink for PullCountingSink {
        fn append(&mut self, _row: &OutputRow) -> Result<()> {
            self.pulled_at_append.push(self.pulled.load(Ordering::SeqCst));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_pulled_one_batch_at_a_time() {
        let config = quick_config();
        let coordinator = coordinator(ScriptedService::default(), &config);
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let source = stream(&["1"; 7]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut sink = PullCountingSink {
            pulled,
            pulled_at_append: Vec::new(),
        };

        coordinator.run(source, &mut sink).await.unwrap();
        assert_eq!(sink.pulled_at_append, vec![5, 5, 5, 5, 5, 7, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_aborts_run() {
        let config = PipelineConfig {
            batch_size: 1,
            ..quick_config()
        };
        let coordinator = coordinator(ScriptedService::default(), &config);
        let source = futures::stream::iter(vec![
            Ok(records(&["a"]).remove(0)),
            Err(anyhow::anyhow!("disk went away")),
            Ok(records(&["c"]).remove(0)),
        ]);
        let mut sink: Vec<OutputRow> = Vec::new();

        let err = coordinator.run(source, &mut sink).await.unwrap_err();
        assert!(format!("{:#}", err).contains("disk went away"));
        assert_eq!(texts(&sink), vec!["described a"]);
    }

    struct FailingSink {
        accepted: usize,
        limit: usize,
    }

    impl RowSink for FailingSink {
        fn append(&mut self, _row: &OutputRow) -> Result<()> {
            if self.accepted == self.limit {
                anyhow::bail!("disk full");
            }
            self.accepted += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_error_aborts_run() {
        let config = quick_config();
        let coordinator = coordinator(ScriptedService::default(), &config);
        let mut sink = FailingSink {
            accepted: 0,
            limit: 2,
        };

        let err = coordinator
            .run(stream(&["a", "b", "c", "d"]), &mut sink)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));
        assert_eq!(sink.accepted, 2);
        assert_eq!(coordinator.generator().service().calls(), 3);
    }

    struct StoppingSink {
        rows: Vec<OutputRow>,
        stop_after: usize,
        stop: watch::Sender<bool>,
    }

    impl RowSink for StoppingSink {
        fn append(&mut self, row: &OutputRow) -> Result<()> {
            self.rows.push(row.clone());
            if self.rows.len() == self.stop_after {
                self.stop.send_replace(true);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_honoured_at_batch_boundary() {
        let config = PipelineConfig {
            batch_size: 3,
            ..quick_config()
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let coordinator =
            coordinator(ScriptedService::default(), &config).with_stop_signal(stop_rx);
        let mut sink = StoppingSink {
            rows: Vec::new(),
            stop_after: 1,
            stop: stop_tx,
        };

        let summary = coordinator
            .run(stream(&["a", "b", "c", "d", "e", "f"]), &mut sink)
            .await
            .unwrap();
        // the batch in flight completes
        assert_eq!(sink.rows.len(), 3);
        assert!(summary.aborted);
        assert_eq!(summary.processed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_published() {
        let config = quick_config();
        let (tx, rx) = watch::channel(Progress::default());
        let coordinator = coordinator(ScriptedService::default(), &config).with_progress(tx);

        coordinator
            .run(stream(&["a", "", "c", "d", "e", "f", "g"]), &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(
            *rx.borrow(),
            Progress {
                processed: 7,
                seen: 7,
                source_exhausted: true,
            }
        );
        coordinator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_source() {
        let coordinator = coordinator(ScriptedService::default(), &quick_config());
        let mut sink: Vec<OutputRow> = Vec::new();
        let summary = coordinator.run(stream(&[]), &mut sink).await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert!(sink.is_empty());
    }
}

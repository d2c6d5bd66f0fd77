use crate::pipeline::candidate::{Outcome, TokenUsage, Verdict};
use crate::pipeline::flusher::OutcomeFlusher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the progress reporter task.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters shared by the engine, the sink, and the reporter.
#[derive(Default, Debug)]
pub struct RunCounters {
    completed: AtomicU64,
    matched: AtomicU64,
    not_matched: AtomicU64,
    summary_rejected: AtomicU64,
    fetch_failed: AtomicU64,
    evaluation_failed: AtomicU64,
    duplicates_skipped: AtomicU64,
    screening_input_tokens: AtomicU64,
    screening_output_tokens: AtomicU64,
    evaluation_input_tokens: AtomicU64,
    evaluation_output_tokens: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one finished evaluation into the tallies, including its token spend.
    pub fn record_outcome(&self, outcome: &Outcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        match outcome.verdict() {
            Verdict::Matched { .. } => &self.matched,
            Verdict::NotMatched { .. } => &self.not_matched,
            Verdict::SummaryRejected { .. } => &self.summary_rejected,
            Verdict::FetchFailed { .. } => &self.fetch_failed,
            Verdict::EvaluationFailed { .. } => &self.evaluation_failed,
        }
        .fetch_add(1, Ordering::Relaxed);

        let usage = outcome.usage();
        self.screening_input_tokens
            .fetch_add(usage.screening.input, Ordering::Relaxed);
        self.screening_output_tokens
            .fetch_add(usage.screening.output, Ordering::Relaxed);
        self.evaluation_input_tokens
            .fetch_add(usage.evaluation.input, Ordering::Relaxed);
        self.evaluation_output_tokens
            .fetch_add(usage.evaluation.output, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of candidates whose outcome has been recorded so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            not_matched: self.not_matched.load(Ordering::Relaxed),
            summary_rejected: self.summary_rejected.load(Ordering::Relaxed),
            fetch_failed: self.fetch_failed.load(Ordering::Relaxed),
            evaluation_failed: self.evaluation_failed.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            screening_tokens: TokenUsage::new(
                self.screening_input_tokens.load(Ordering::Relaxed),
                self.screening_output_tokens.load(Ordering::Relaxed),
            ),
            evaluation_tokens: TokenUsage::new(
                self.evaluation_input_tokens.load(Ordering::Relaxed),
                self.evaluation_output_tokens.load(Ordering::Relaxed),
            ),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CountersSnapshot {
    pub completed: u64,
    pub matched: u64,
    pub not_matched: u64,
    pub summary_rejected: u64,
    pub fetch_failed: u64,
    pub evaluation_failed: u64,
    pub duplicates_skipped: u64,
    pub screening_tokens: TokenUsage,
    pub evaluation_tokens: TokenUsage,
}

/// Spawns a background task that periodically logs throughput, verdict tallies, and token spend.
pub fn spawn_progress_reporter(
    counters: Arc<RunCounters>,
    flusher: Arc<OutcomeFlusher>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = counters.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "newsift::progress", "progress reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = counters.snapshot();
                    let completed_delta = current_snapshot
                        .completed
                        .saturating_sub(last_snapshot.completed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        completed_delta as f64 / elapsed
                    };
                    let pending = flusher.pending_items().await;

                    tracing::info!(
                        target: "newsift::progress",
                        throughput = format!("{throughput:.2}"),
                        completed = current_snapshot.completed,
                        matched = current_snapshot.matched,
                        rejected = current_snapshot.summary_rejected,
                        failed = current_snapshot.fetch_failed
                            + current_snapshot.evaluation_failed,
                        duplicates = current_snapshot.duplicates_skipped,
                        pending,
                        tokens_in = current_snapshot.screening_tokens.input
                            + current_snapshot.evaluation_tokens.input,
                        tokens_out = current_snapshot.screening_tokens.output
                            + current_snapshot.evaluation_tokens.output,
                        "run progress snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

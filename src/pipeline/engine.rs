use crate::content::listing::CandidateSource;
use crate::evaluator::ItemEvaluator;
use crate::pipeline::candidate::{CandidateBatch, Outcome, StageUsage, Verdict};
use crate::pipeline::flusher::OutcomeFlusher;
use crate::pipeline::pool::EvalPool;
use crate::runtime::sink::SinkClient;
use crate::runtime::telemetry::{CountersSnapshot, RunCounters};
use anyhow::{Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the engine needs, grouped to keep the constructor readable.
pub struct EngineParams {
    pub evaluator: Arc<ItemEvaluator>,
    pub concurrency: usize,
    pub flusher: Arc<OutcomeFlusher>,
    pub sink: SinkClient,
    pub counters: Arc<RunCounters>,
    pub cancellation: CancellationToken,
}

/// Final tallies of a run, returned whether it completed or was interrupted.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub counters: CountersSnapshot,
    pub elapsed: Duration,
    pub interrupted: bool,
}

/// Drives batches from a [`CandidateSource`] through concurrent evaluation and
/// into the sink, preserving listing order end to end.
///
/// The engine pulls a batch, fans its candidates out on the pool, and then
/// holds off on the next pull while the pool is backlogged, draining finished
/// items in order whenever a slot frees up. Cancelling the token stops the run
/// at the next opportunity and aborts whatever is still queued.
pub struct EvalEngine {
    evaluator: Arc<ItemEvaluator>,
    pool: EvalPool,
    flusher: Arc<OutcomeFlusher>,
    sink: SinkClient,
    counters: Arc<RunCounters>,
    cancellation: CancellationToken,
    seen_links: HashSet<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Gate {
    Cleared,
    Cancelled,
}

impl EvalEngine {
    pub fn new(params: EngineParams) -> Self {
        let EngineParams {
            evaluator,
            concurrency,
            flusher,
            sink,
            counters,
            cancellation,
        } = params;
        Self {
            evaluator,
            pool: EvalPool::new(concurrency),
            flusher,
            sink,
            counters,
            cancellation,
            seen_links: HashSet::new(),
        }
    }

    /// Consumes the source to exhaustion and returns the run's summary.
    ///
    /// Fails only on run-level problems: a broken source, a sink write error,
    /// or an evaluation task that was torn down instead of finishing. Per-item
    /// trouble ends up in the item's own outcome instead.
    pub async fn run(&mut self, source: &mut dyn CandidateSource) -> Result<RunSummary> {
        let started = Instant::now();
        tracing::info!(concurrency = self.pool.limit(), "evaluation run starting");

        loop {
            if self.cancellation.is_cancelled() {
                return self.interrupt(started).await;
            }

            let batch = match source.next_batch().await.context("candidate source failed")? {
                Some(batch) => batch,
                None => break,
            };

            let label = batch.label().to_string();
            let scheduled = self.schedule_batch(batch).await;
            tracing::info!(batch = %label, scheduled, "batch scheduled");

            self.flusher.drain_ready(&self.sink, &self.counters).await?;

            if self.wait_for_gate().await? == Gate::Cancelled {
                return self.interrupt(started).await;
            }
        }

        let drained = tokio::select! {
            _ = self.cancellation.cancelled() => None,
            result = self.flusher.drain_all(&self.sink, &self.counters) => Some(result?),
        };
        let Some(drained) = drained else {
            return self.interrupt(started).await;
        };
        tracing::debug!(drained, "final drain complete");

        let elapsed = started.elapsed();
        self.sink
            .finalize(elapsed)
            .await
            .context("finalizing the result log")?;

        let summary = RunSummary {
            counters: self.counters.snapshot(),
            elapsed,
            interrupted: false,
        };
        tracing::info!(
            completed = summary.counters.completed,
            matched = summary.counters.matched,
            duplicates = summary.counters.duplicates_skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "evaluation run complete"
        );
        Ok(summary)
    }

    /// Spawns an evaluation task per previously unseen candidate and registers
    /// the batch with the flusher. Returns how many tasks were spawned.
    async fn schedule_batch(&mut self, batch: CandidateBatch) -> usize {
        let (label, candidates) = batch.into_parts();
        let mut handles = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !self.seen_links.insert(candidate.link().to_string()) {
                tracing::debug!(link = candidate.link(), "duplicate candidate skipped");
                self.counters.record_duplicate();
                continue;
            }

            let evaluator = Arc::clone(&self.evaluator);
            let fallback = candidate.clone();
            let handle = self.pool.spawn(async move {
                match AssertUnwindSafe(evaluator.evaluate(candidate))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(link = fallback.link(), panic = %message, "evaluation panicked");
                        Outcome::new(
                            fallback,
                            Verdict::EvaluationFailed {
                                reason: format!("evaluation panicked: {message}"),
                            },
                            StageUsage::default(),
                        )
                    }
                }
            });
            handles.push(handle);
        }

        let scheduled = handles.len();
        self.flusher.submit_batch(label, handles).await;
        scheduled
    }

    /// Blocks until the pool can absorb another batch, draining finished items
    /// on every completion so the head of the queue never sits on a full pool.
    async fn wait_for_gate(&self) -> Result<Gate> {
        let flusher = Arc::clone(&self.flusher);
        let sink = self.sink.clone();
        let counters = Arc::clone(&self.counters);
        let drain = move || {
            let flusher = Arc::clone(&flusher);
            let sink = sink.clone();
            let counters = Arc::clone(&counters);
            async move { flusher.drain_ready(&sink, &counters).await.map(|_| ()) }
        };

        tokio::select! {
            _ = self.cancellation.cancelled() => Ok(Gate::Cancelled),
            result = self.pool.wait_for_capacity(drain) => {
                result?;
                Ok(Gate::Cleared)
            }
        }
    }

    /// Aborts everything still pending and reports what was done so far.
    /// The sink is left unfinalized; records already flushed stay on disk.
    async fn interrupt(&mut self, started: Instant) -> Result<RunSummary> {
        let aborted = self.flusher.abort_pending().await;
        let elapsed = started.elapsed();
        let summary = RunSummary {
            counters: self.counters.snapshot(),
            elapsed,
            interrupted: true,
        };
        tracing::info!(
            aborted,
            completed = summary.counters.completed,
            elapsed_ms = elapsed.as_millis() as u64,
            "evaluation run interrupted"
        );
        Ok(summary)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
